//! Command handlers
//!
//! Every handler acknowledges on the reply subject before doing any work,
//! then publishes exactly one result. Transport failures are logged and
//! otherwise ignored.

use crate::agent::messages::{
    CacheCheckRequest, ImageCached, ImageDownloaded, ImageRequest, JobFinished, VolumeRequest,
    VolumeResult,
};
use crate::agent::output::BusOutput;
use crate::bus::{Message, MessageBus};
use crate::cache::{ArtifactKind, Cache};
use crate::error::AgentError;
use crate::image::{is_image_hash, ImageDownloader};
use crate::orchestration::{Job, JobEngine};
use crate::volume::VolumeManager;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Kinds of command the agent accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    JobStart,
    VolumeCreate,
    VolumeDelete,
    ImageDownload,
    ImageCached,
}

impl Command {
    pub const ALL: &'static [Self] = &[
        Self::JobStart,
        Self::VolumeCreate,
        Self::VolumeDelete,
        Self::ImageDownload,
        Self::ImageCached,
    ];

    /// Node-scoped subject the command arrives on
    pub fn subject(&self, node_id: &str) -> String {
        let suffix = match self {
            Self::JobStart => "job.start",
            Self::VolumeCreate => "volume.create",
            Self::VolumeDelete => "volume.delete",
            Self::ImageDownload => "image.download",
            Self::ImageCached => "image.cached",
        };
        format!("node.{}.{}", node_id, suffix)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::JobStart => "job start",
            Self::VolumeCreate => "volume creation",
            Self::VolumeDelete => "volume deletion",
            Self::ImageDownload => "image download",
            Self::ImageCached => "image cache check",
        };
        f.write_str(name)
    }
}

/// Everything a handler needs, shared by all in-flight commands
pub(crate) struct Context {
    pub bus: Arc<dyn MessageBus>,
    pub volumes: Arc<VolumeManager>,
    pub cache: Cache,
    pub downloader: ImageDownloader,
    pub engine: JobEngine,
}

impl Context {
    /// Acknowledge, process and answer one command
    pub async fn handle(&self, command: Command, message: Message, jobs: CancellationToken) {
        let started = Instant::now();
        info!(subject = %message.subject, reply = ?message.reply, "handling {}", command);

        self.acknowledge(command, &message).await;

        match command {
            Command::JobStart => {
                if let Some(job) = decode(command, &message) {
                    self.start_job(job, jobs).await;
                }
            }
            Command::VolumeCreate => {
                if let Some(req) = decode::<VolumeRequest>(command, &message) {
                    let result = self.volumes.create(&req.id, &req.kind).await;
                    self.report_volume(&req.id, "create", result.err()).await;
                }
            }
            Command::VolumeDelete => {
                if let Some(req) = decode::<VolumeRequest>(command, &message) {
                    let result = self.volumes.delete(&req.id).await;
                    self.report_volume(&req.id, "delete", result.err()).await;
                }
            }
            Command::ImageDownload => {
                if let Some(req) = decode(command, &message) {
                    self.download_image(req).await;
                }
            }
            Command::ImageCached => {
                if let Some(req) = decode::<CacheCheckRequest>(command, &message) {
                    self.check_cached(req.hash()).await;
                }
            }
        }

        info!(subject = %message.subject, took = ?started.elapsed(), "handled {}", command);
    }

    async fn acknowledge(&self, command: Command, message: &Message) {
        let Some(reply) = &message.reply else {
            return;
        };
        if let Err(e) = self.bus.publish(reply, Vec::new()).await {
            warn!(reply = %reply, error = %e, "failed to acknowledge {}", command);
        }
    }

    async fn start_job(&self, job: Job, jobs: CancellationToken) {
        let output = BusOutput::new(self.bus.clone(), job.output_subject());
        let result = self.engine.run(&job, &output, &jobs).await;

        if let Some(e) = &result.error {
            warn!(job_id = %job.id, error = %e, retryable = e.is_retryable(), "job failed");
        } else {
            info!(job_id = %job.id, rc = result.rc(), "job exited");
        }

        let finished = JobFinished {
            status: result.status(),
            rc: result.rc(),
            err: result.error.as_ref().map(ToString::to_string),
        };
        self.publish_result(&job.finished_subject(), &finished).await;
    }

    async fn report_volume(&self, id: &str, action: &str, err: Option<AgentError>) {
        if let Some(e) = &err {
            warn!(
                volume_id = %id,
                error = %e,
                retryable = e.is_retryable(),
                "volume {} failed",
                action
            );
        }
        let result = VolumeResult {
            err: err.map(|e| e.to_string()),
        };
        self.publish_result(&format!("volume.{}.{}", id, action), &result)
            .await;
    }

    async fn download_image(&self, req: ImageRequest) {
        let err = match self.downloader.download(&req.uri).await {
            Ok(_) => None,
            Err(e) => {
                warn!(image_uri = %req.uri, error = %e, "could not download library image");
                Some(e.to_string())
            }
        };
        let result = ImageDownloaded { uri: req.uri, err };
        self.publish_result("image.download", &result).await;
    }

    async fn check_cached(&self, hash: &str) {
        let exists = is_image_hash(hash) && self.cache.entry(ArtifactKind::Sif, hash).exists();
        info!(hash = %hash, exists, "image cache checked");

        let result = ImageCached {
            hash: hash.to_string(),
            exists,
        };
        self.publish_result("image.cached", &result).await;
    }

    async fn publish_result<T: Serialize>(&self, subject: &str, result: &T) {
        let payload = match serde_json::to_vec(result) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(subject = %subject, error = %e, "failed to encode result");
                return;
            }
        };
        if let Err(e) = self.bus.publish(subject, payload).await {
            warn!(subject = %subject, error = %e, "failed to publish result");
        }
    }
}

/// Decode a command payload; undecodable commands are logged and dropped
fn decode<T: DeserializeOwned>(command: Command, message: &Message) -> Option<T> {
    match serde_json::from_slice(&message.payload) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(subject = %message.subject, error = %e, "dropping malformed {}", command);
            None
        }
    }
}
