//! In-progress cache writes

use crate::error::{AgentError, AgentResult};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Artifact being written; becomes visible only on [`PartialEntry::commit`]
///
/// Dropping an uncommitted partial removes its file.
#[derive(Debug)]
pub struct PartialEntry {
    file: Option<File>,
    temp_path: PathBuf,
    final_path: PathBuf,
    committed: bool,
}

impl PartialEntry {
    pub(crate) fn create(final_path: &Path) -> AgentResult<Self> {
        let name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                AgentError::Internal(format!("cache entry {} has no name", final_path.display()))
            })?;
        let temp_path =
            final_path.with_file_name(format!(".{}.{}.partial", name, Uuid::new_v4().simple()));

        let file = File::create(&temp_path)
            .map_err(|e| AgentError::io(format!("creating {}", temp_path.display()), e))?;

        Ok(Self {
            file: Some(file),
            temp_path,
            final_path: final_path.to_path_buf(),
            committed: false,
        })
    }

    /// Flush to disk and atomically move the artifact into place
    pub fn commit(mut self) -> AgentResult<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()
                .map_err(|e| AgentError::io(format!("syncing {}", self.temp_path.display()), e))?;
        }

        fs::rename(&self.temp_path, &self.final_path).map_err(|e| {
            AgentError::io(
                format!("moving cache entry into {}", self.final_path.display()),
                e,
            )
        })?;
        self.committed = true;

        debug!("Committed cache entry {}", self.final_path.display());
        Ok(())
    }
}

impl Write for PartialEntry {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(io::Error::other("cache entry already committed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for PartialEntry {
    fn drop(&mut self) {
        if !self.committed {
            drop(self.file.take());
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}
