//! Job descriptions as submitted by the scheduler

use serde::{Deserialize, Serialize};
use std::fmt;

/// One unit of sandboxed work
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID, used to derive output and result subjects
    #[serde(alias = "ID")]
    pub id: String,

    #[serde(default, alias = "Name")]
    pub name: String,

    /// Direct image reference, used unless `cached` is set
    #[serde(default, alias = "Image")]
    pub image: String,

    /// Argument vector to run inside the image
    #[serde(default, alias = "Command")]
    pub command: Vec<String>,

    /// Volumes to bind, in order
    #[serde(default, alias = "Volumes")]
    pub volumes: Vec<VolumeBinding>,

    /// Run the cached image identified by `hash` instead of `image`
    #[serde(default, alias = "Cached")]
    pub cached: bool,

    #[serde(default, alias = "Hash")]
    pub hash: String,
}

/// Where a volume appears inside the sandbox
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBinding {
    #[serde(rename = "volumeID", alias = "VolumeID")]
    pub volume_id: String,

    #[serde(alias = "Location")]
    pub location: String,
}

/// Where the job's image comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource<'a> {
    /// Passed to the runtime verbatim
    Reference(&'a str),
    /// Content hash of an image in the local cache
    Cached(&'a str),
}

impl Job {
    pub fn image_source(&self) -> ImageSource<'_> {
        if self.cached {
            ImageSource::Cached(&self.hash)
        } else {
            ImageSource::Reference(&self.image)
        }
    }

    /// Subject that receives the job's output chunks
    pub fn output_subject(&self) -> String {
        format!("job.{}.output", self.id)
    }

    /// Subject that receives the job's final status
    pub fn finished_subject(&self) -> String {
        format!("job.{}.finished", self.id)
    }
}

/// Terminal status reported to the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Completed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}
