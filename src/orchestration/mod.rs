//! Job execution on the node
//!
//! Turns a [`Job`] into a sandbox runtime invocation:
//! - volume IDs become a single `--bind` list
//! - cache-backed images are resolved to their cache entry
//! - process output is streamed to an [`OutputSink`] as it arrives

mod engine;
mod job;
mod runtime;

pub use engine::{ExecutionResult, JobEngine};
pub use job::{ImageSource, Job, JobStatus, VolumeBinding};
pub use runtime::SandboxRuntime;

use crate::error::AgentResult;
use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

/// Largest chunk forwarded to a sink in one write
const CHUNK_SIZE: usize = 8 * 1024;

/// Destination for a job's combined stdout and stderr
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn write(&self, chunk: Vec<u8>) -> AgentResult<()>;
}

/// Sink that keeps everything in memory
#[derive(Debug, Default)]
pub struct CollectedOutput {
    buf: Mutex<Vec<u8>>,
}

impl CollectedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl OutputSink for CollectedOutput {
    async fn write(&self, chunk: Vec<u8>) -> AgentResult<()> {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(&chunk);
        Ok(())
    }
}

/// Forward stdout+stderr from a child process to `sink` until both close.
///
/// Chunks are forwarded as read, without line buffering. Sink failures are
/// logged and the remaining output is still drained so the child never
/// blocks on a full pipe.
pub(crate) async fn stream_child_output(child: &mut tokio::process::Child, sink: &dyn OutputSink) {
    let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
        debug!("child output not captured");
        return;
    };

    let mut stdout_done = false;
    let mut stderr_done = false;

    while !stdout_done || !stderr_done {
        tokio::select! {
            chunk = read_chunk(&mut stdout), if !stdout_done => {
                match chunk {
                    Some(chunk) => forward(sink, chunk).await,
                    None => stdout_done = true,
                }
            }
            chunk = read_chunk(&mut stderr), if !stderr_done => {
                match chunk {
                    Some(chunk) => forward(sink, chunk).await,
                    None => stderr_done = true,
                }
            }
        }
    }
}

/// Next chunk from a pipe, or `None` at end of stream
async fn read_chunk<R: AsyncRead + Unpin>(pipe: &mut R) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    match pipe.read(&mut buf).await {
        Ok(0) => None,
        Ok(n) => {
            buf.truncate(n);
            Some(buf)
        }
        Err(e) => {
            debug!(error = %e, "failed to read child output");
            None
        }
    }
}

async fn forward(sink: &dyn OutputSink, chunk: Vec<u8>) {
    if let Err(e) = sink.write(chunk).await {
        warn!(error = %e, "failed to forward job output");
    }
}
