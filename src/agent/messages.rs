//! Command payloads and results exchanged with the scheduler
//!
//! Payloads are JSON. Capitalized field names are accepted on input for
//! compatibility with older schedulers. Every result carries an `err` field
//! that is `null` on success and the failure message otherwise.

use crate::orchestration::JobStatus;
use serde::{Deserialize, Serialize};

/// Volume create/delete command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRequest {
    #[serde(alias = "ID")]
    pub id: String,

    #[serde(default, alias = "Name")]
    pub name: String,

    #[serde(rename = "type", alias = "Type", default)]
    pub kind: String,
}

/// Image download command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRequest {
    #[serde(alias = "URI")]
    pub uri: String,
}

/// Image cache check command: either a bare hash or `{"hash": ...}`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CacheCheckRequest {
    Hash(String),
    Object {
        #[serde(alias = "Hash")]
        hash: String,
    },
}

impl CacheCheckRequest {
    pub fn hash(&self) -> &str {
        match self {
            Self::Hash(hash) | Self::Object { hash } => hash,
        }
    }
}

/// Published on `job.<id>.finished`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFinished {
    pub status: JobStatus,
    pub rc: i32,
    pub err: Option<String>,
}

/// Published on `volume.<id>.create` and `volume.<id>.delete`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeResult {
    pub err: Option<String>,
}

/// Published on `image.download`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDownloaded {
    pub uri: String,
    pub err: Option<String>,
}

/// Published on `image.cached`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCached {
    pub hash: String,
    pub exists: bool,
}
