//! Sandboxed job execution

use crate::cache::{ArtifactKind, Cache};
use crate::error::{AgentError, AgentResult};
use crate::image::is_image_hash;
use crate::orchestration::job::{ImageSource, Job, JobStatus, VolumeBinding};
use crate::orchestration::runtime::SandboxRuntime;
use crate::orchestration::{stream_child_output, OutputSink};
use crate::volume::VolumeManager;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one job run
///
/// A non-zero exit is a normal outcome; `error` is only set when the
/// process could not be started, awaited, or was cancelled.
#[derive(Debug, Default)]
pub struct ExecutionResult {
    pub exit_code: Option<i32>,
    pub error: Option<AgentError>,
}

impl ExecutionResult {
    fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            error: None,
        }
    }

    fn failed(error: AgentError) -> Self {
        Self {
            exit_code: None,
            error: Some(error),
        }
    }

    pub fn status(&self) -> JobStatus {
        match (&self.error, self.exit_code) {
            (None, Some(0)) => JobStatus::Completed,
            _ => JobStatus::Failed,
        }
    }

    /// Exit code as reported to the scheduler, zero if never observed
    pub fn rc(&self) -> i32 {
        self.exit_code.unwrap_or(0)
    }
}

/// Exit code of a finished process; -1 when it was killed by a signal
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Runs jobs through the sandbox runtime
pub struct JobEngine {
    runtime: SandboxRuntime,
    volumes: Arc<VolumeManager>,
    cache: Cache,
}

impl JobEngine {
    pub fn new(runtime: SandboxRuntime, volumes: Arc<VolumeManager>, cache: Cache) -> Self {
        Self {
            runtime,
            volumes,
            cache,
        }
    }

    /// The `--bind` value for the given volumes, `None` when there are none
    ///
    /// Order is preserved and nothing is deduplicated.
    pub fn bind_list(&self, bindings: &[VolumeBinding]) -> AgentResult<Option<String>> {
        let binds = bindings
            .iter()
            .map(|binding| {
                let handle = self
                    .volumes
                    .get_handle(&binding.volume_id)
                    .map_err(|e| AgentError::volume_resolution(&binding.volume_id, e))?;
                Ok(format!("{}:{}", handle.display(), binding.location))
            })
            .collect::<AgentResult<Vec<_>>>()?;

        Ok((!binds.is_empty()).then(|| binds.join(",")))
    }

    /// The image argument for the runtime; cached images are never downloaded here
    pub fn resolve_image(&self, job: &Job) -> AgentResult<String> {
        match job.image_source() {
            ImageSource::Reference(image) => Ok(image.to_string()),
            ImageSource::Cached(hash) => {
                if !is_image_hash(hash) {
                    return Err(AgentError::InvalidImageHash(hash.to_string()));
                }
                let entry = self.cache.entry(ArtifactKind::Sif, hash);
                if !entry.exists() {
                    return Err(AgentError::CachedImageMissing(hash.to_string()));
                }
                Ok(entry.path().display().to_string())
            }
        }
    }

    /// Run `job` to completion, forwarding its output to `sink`
    ///
    /// Every failure before the spawn aborts the run without starting a
    /// process. Cancelling `cancel` kills the process.
    pub async fn run(
        &self,
        job: &Job,
        sink: &dyn OutputSink,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let prepared = self.runtime.locate().and_then(|binary| {
            let bind = self.bind_list(&job.volumes)?;
            let image = self.resolve_image(job)?;
            Ok((binary, bind, image))
        });
        let (binary, bind, image) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return ExecutionResult::failed(e),
        };

        let args = SandboxRuntime::exec_args(bind.as_deref(), &image, &job.command);
        debug!(job_id = %job.id, runtime = %binary.display(), ?args, "spawning sandbox");

        let mut child = match Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return ExecutionResult::failed(AgentError::command_failed(
                    self.runtime.binary(),
                    e,
                ))
            }
        };
        info!(job_id = %job.id, image = %image, pid = ?child.id(), "job started");

        let waited = tokio::select! {
            status = wait_with_output(&mut child, sink) => Some(status),
            _ = cancel.cancelled() => None,
        };

        match waited {
            Some(Ok(status)) => ExecutionResult::exited(exit_code(status)),
            Some(Err(e)) => ExecutionResult::failed(AgentError::io("waiting for sandbox", e)),
            None => {
                info!(job_id = %job.id, "cancelling job");
                if let Err(e) = child.kill().await {
                    warn!(job_id = %job.id, error = %e, "failed to kill sandbox");
                }
                ExecutionResult {
                    exit_code: child.try_wait().ok().flatten().map(exit_code),
                    error: Some(AgentError::JobCancelled),
                }
            }
        }
    }
}

async fn wait_with_output(
    child: &mut Child,
    sink: &dyn OutputSink,
) -> std::io::Result<ExitStatus> {
    stream_child_output(child, sink).await;
    child.wait().await
}
