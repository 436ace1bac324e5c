//! Content-addressed artifact cache
//!
//! Maps an artifact kind and content hash to a fixed location on disk:
//! `<cache dir>/fuzzball/<kind>/<hash>`. The hash is the identity, so the
//! cache itself never hashes or verifies anything.
//!
//! # Entry States
//!
//! | State | On disk | `exists()` |
//! |-------|---------|------------|
//! | Absent | nothing at the entry path | false |
//! | Writing | `.<hash>.<uuid>.partial` beside the entry path | false |
//! | Complete | file at the entry path | true |
//!
//! Entries only appear by atomic rename of a fully written partial file and
//! are never deleted by the agent.

mod partial;

pub use partial::PartialEntry;

use crate::config::schema::CacheConfig;
use crate::error::{AgentError, AgentResult};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Directory below the configured cache dir that only the agent controls
const CACHE_DIR_NAME: &str = "fuzzball";

/// Category of cached artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// Singularity image file
    Sif,
}

impl ArtifactKind {
    /// Every kind gets a directory at initialization
    pub const ALL: &'static [Self] = &[Self::Sif];

    /// Directory name for this kind
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Sif => "sif",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

/// Node-local cache directory
#[derive(Debug, Clone)]
pub struct Cache {
    base_dir: PathBuf,
}

impl Cache {
    /// Create the cache root and one directory per artifact kind
    pub async fn new(config: &CacheConfig) -> AgentResult<Self> {
        let cache = Self {
            base_dir: config.dir.join(CACHE_DIR_NAME),
        };

        ensure_dir(&cache.base_dir).await?;
        for kind in ArtifactKind::ALL {
            ensure_dir(&cache.kind_dir(*kind)).await?;
        }

        debug!("Cache ready at {}", cache.base_dir.display());
        Ok(cache)
    }

    /// Root of the agent's cache
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn kind_dir(&self, kind: ArtifactKind) -> PathBuf {
        self.base_dir.join(kind.dir_name())
    }

    /// Location of an artifact; never touches the filesystem
    pub fn entry(&self, kind: ArtifactKind, hash: &str) -> CacheEntry {
        CacheEntry {
            path: self.kind_dir(kind).join(hash),
        }
    }
}

/// Create `dir` (and parents) unless it already exists as a directory
async fn ensure_dir(dir: &Path) -> AgentResult<()> {
    let cache_init = |reason: String| AgentError::CacheInit {
        path: dir.to_path_buf(),
        reason,
    };

    match fs::metadata(dir).await {
        Ok(meta) if meta.is_dir() => return Ok(()),
        Ok(_) => return Err(cache_init("path is not a directory".to_string())),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(cache_init(e.to_string())),
    }

    fs::create_dir_all(dir)
        .await
        .map_err(|e| cache_init(e.to_string()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(|e| cache_init(e.to_string()))?;
    }

    Ok(())
}

/// A filesystem location to store one artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    path: PathBuf,
}

impl CacheEntry {
    /// Where the artifact lives once complete
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether anything is present at the entry path
    ///
    /// Content is not verified.
    pub fn exists(&self) -> bool {
        !matches!(
            std::fs::symlink_metadata(&self.path),
            Err(e) if e.kind() == ErrorKind::NotFound
        )
    }

    /// Start writing the artifact to a partial file beside the entry
    pub fn begin_write(&self) -> AgentResult<PartialEntry> {
        PartialEntry::create(&self.path)
    }
}
