use crate::error::{AgentError, AgentResult};
use crate::volume::{Volume, VolumeDriver};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

/// Allocates ephemeral volumes under a base directory
#[derive(Debug, Clone)]
pub struct EphemeralDriver {
    base_dir: PathBuf,
}

impl EphemeralDriver {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Unique directory name for a volume, `<id>-<uuid>`
    fn dir_name(id: &str) -> String {
        let id: String = id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}-{}", id.trim_start_matches('.'), Uuid::new_v4().simple())
    }
}

#[async_trait]
impl VolumeDriver for EphemeralDriver {
    async fn create(&self, id: &str) -> AgentResult<Box<dyn Volume>> {
        fs::create_dir_all(&self.base_dir).await.map_err(|e| {
            AgentError::io(
                format!("creating volume base directory {}", self.base_dir.display()),
                e,
            )
        })?;

        let path = self.base_dir.join(Self::dir_name(id));
        fs::create_dir(&path)
            .await
            .map_err(|e| AgentError::io(format!("creating volume {}", path.display()), e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))
                .await
                .map_err(|e| AgentError::io("setting volume permissions", e))?;
        }

        debug!("Created ephemeral volume {} at {}", id, path.display());
        Ok(Box::new(EphemeralVolume { path }))
    }

    fn name(&self) -> &'static str {
        "ephemeral"
    }
}

/// Short lived volume that does not retain data
#[derive(Debug)]
pub struct EphemeralVolume {
    path: PathBuf,
}

#[async_trait]
impl Volume for EphemeralVolume {
    fn handle(&self) -> &Path {
        &self.path
    }

    async fn delete(&self) -> AgentResult<()> {
        match fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AgentError::io(
                format!("removing volume {}", self.path.display()),
                e,
            )),
        }
    }
}
