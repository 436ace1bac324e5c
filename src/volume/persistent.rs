use crate::error::AgentResult;
use crate::volume::{Volume, VolumeDriver};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Hands out volumes backed by a pre-existing directory
#[derive(Debug, Clone)]
pub struct PersistentDriver {
    path: PathBuf,
}

impl PersistentDriver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl VolumeDriver for PersistentDriver {
    async fn create(&self, _id: &str) -> AgentResult<Box<dyn Volume>> {
        Ok(Box::new(PersistentVolume {
            path: self.path.clone(),
        }))
    }

    fn name(&self) -> &'static str {
        "persistent"
    }
}

/// Volume that leaves data intact during creation and removal
#[derive(Debug)]
pub struct PersistentVolume {
    path: PathBuf,
}

#[async_trait]
impl Volume for PersistentVolume {
    fn handle(&self) -> &Path {
        &self.path
    }

    async fn delete(&self) -> AgentResult<()> {
        Ok(())
    }
}
