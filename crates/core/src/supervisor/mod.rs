//! Process supervisor for the external normalization tool.
//!
//! [`ProcessSupervisor::run`] executes exactly one tool invocation for one
//! job attempt. It owns the child process and the job's [`WorkArea`], and it
//! guarantees on every exit path that the child has been killed and reaped
//! and that the work area is gone.
//!
//! The outcome is a classification, never raw tool output: stderr is only
//! ever logged at debug level.

pub mod work_area;

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::ffmpeg::{build_normalize_args, NormalizeSettings, ToolCommand, OUTPUT_EXTENSION};
use crate::types::DbId;

pub use work_area::{purge_work_root, WorkArea};

/// Maximum stderr captured per invocation (64 KiB).
const MAX_STDERR_BYTES: u64 = 64 * 1024;

/// How long to wait for the stderr reader once the child has exited.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Directory (relative to the storage root) holding per-job work areas.
pub const WORK_DIR: &str = "work";

/// Directory (relative to the storage root) holding normalized artifacts.
pub const OUTPUT_DIR: &str = "outputs";

/// Why a normalization attempt did not produce an artifact.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    #[error("normalization exceeded its time limit of {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("normalization tool exited with code {code:?}")]
    NonZeroExit { code: Option<i32> },

    #[error("normalization tool produced no usable output")]
    CorruptOutput,

    #[error("normalization tool could not be started")]
    SpawnFailed,

    #[error("input artifact is missing")]
    InputMissing,

    #[error("I/O error while preparing or collecting the artifact")]
    Io,
}

impl FailureReason {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InputMissing)
    }

    /// Sanitized classification stored as the job's `error_detail`.
    pub fn as_detail(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::NonZeroExit { .. } => "tool_exit_nonzero",
            Self::CorruptOutput => "corrupt_output",
            Self::SpawnFailed => "spawn_failed",
            Self::InputMissing => "input_missing",
            Self::Io => "io_error",
        }
    }
}

/// Result of one supervised invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorOutcome {
    /// The artifact was produced and moved to `output_reference`
    /// (relative to the storage root).
    Succeeded { output_reference: String },
    Failed { reason: FailureReason },
    /// The cancellation token fired before or during the run.
    Cancelled,
}

/// How the wait on the child ended.
enum Exit {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs the normalization tool against stored inputs.
///
/// Cheap to share behind an `Arc`; holds no per-run state.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    storage_root: PathBuf,
    tool: ToolCommand,
    settings: NormalizeSettings,
}

impl ProcessSupervisor {
    pub fn new(storage_root: impl Into<PathBuf>, tool: ToolCommand, settings: NormalizeSettings) -> Self {
        Self {
            storage_root: storage_root.into(),
            tool,
            settings,
        }
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn work_root(&self) -> PathBuf {
        self.storage_root.join(WORK_DIR)
    }

    /// Absolute path of a storage-relative reference.
    pub fn resolve(&self, reference: &str) -> PathBuf {
        self.storage_root.join(reference)
    }

    /// Storage-relative reference of a job's normalized artifact.
    pub fn output_reference(job_id: DbId) -> String {
        format!("{OUTPUT_DIR}/job-{job_id}.{OUTPUT_EXTENSION}")
    }

    /// Remove leftovers from attempts interrupted by a crash.
    pub fn purge_stale_work_areas(&self) -> std::io::Result<usize> {
        purge_work_root(&self.work_root())
    }

    /// Normalize `input_reference` for `job_id`, bounded by `timeout`.
    ///
    /// `attempt` is the job's retry count and selects the work area.
    /// Cancelling `cancel` terminates the tool immediately and yields
    /// [`SupervisorOutcome::Cancelled`].
    pub async fn run(
        &self,
        job_id: DbId,
        attempt: i32,
        input_reference: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> SupervisorOutcome {
        if cancel.is_cancelled() {
            tracing::info!(job_id, "Cancellation pending, skipping normalization");
            return SupervisorOutcome::Cancelled;
        }

        let input = self.resolve(input_reference);
        if !input.is_file() {
            tracing::warn!(job_id, input = %input.display(), "Input artifact missing");
            return failed(FailureReason::InputMissing);
        }

        let work_area = match WorkArea::acquire(&self.work_root(), job_id, attempt) {
            Ok(area) => area,
            Err(e) => {
                tracing::error!(job_id, error = %e, "Failed to allocate work area");
                return failed(FailureReason::Io);
            }
        };

        let scratch_output = work_area.path().join(format!("normalized.{OUTPUT_EXTENSION}"));
        let mut cmd = Command::new(&self.tool.program);
        cmd.args(&self.tool.base_args)
            .args(build_normalize_args(&input, &scratch_output, &self.settings))
            .current_dir(work_area.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so a timeout also takes down anything the tool forked.
        #[cfg(unix)]
        cmd.process_group(0);

        let start = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(
                    job_id,
                    program = %self.tool.program.display(),
                    error = %e,
                    "Failed to spawn normalization tool",
                );
                return failed(FailureReason::SpawnFailed);
            }
        };
        tracing::debug!(job_id, pid = child.id(), "Normalization tool started");

        let stderr = child.stderr.take();
        let mut stderr_task = tokio::spawn(async move { read_bounded(stderr).await });

        let exit = tokio::select! {
            status = child.wait() => Exit::Exited(status),
            _ = tokio::time::sleep(timeout) => Exit::TimedOut,
            _ = cancel.cancelled() => Exit::Cancelled,
        };

        if matches!(exit, Exit::TimedOut | Exit::Cancelled) {
            terminate(&mut child).await;
        }

        let stderr_bytes = match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, &mut stderr_task).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(_)) => Vec::new(),
            Err(_) => {
                stderr_task.abort();
                Vec::new()
            }
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let outcome = match exit {
            Exit::Cancelled => {
                tracing::info!(job_id, elapsed_ms, "Normalization cancelled");
                SupervisorOutcome::Cancelled
            }
            Exit::TimedOut => {
                tracing::warn!(job_id, elapsed_ms, "Normalization timed out, process killed");
                failed(FailureReason::Timeout {
                    limit_ms: timeout.as_millis() as u64,
                })
            }
            Exit::Exited(Err(e)) => {
                tracing::error!(job_id, error = %e, "Failed waiting on normalization tool");
                failed(FailureReason::Io)
            }
            Exit::Exited(Ok(status)) if !status.success() => {
                tracing::warn!(
                    job_id,
                    exit_code = ?status.code(),
                    elapsed_ms,
                    "Normalization tool failed",
                );
                tracing::debug!(
                    job_id,
                    stderr = %String::from_utf8_lossy(&stderr_bytes),
                    "Normalization tool stderr",
                );
                failed(FailureReason::NonZeroExit {
                    code: status.code(),
                })
            }
            Exit::Exited(Ok(_)) => self.collect_output(job_id, &scratch_output, elapsed_ms).await,
        };

        drop(work_area);
        outcome
    }

    /// Move a successful run's artifact out of the work area.
    async fn collect_output(&self, job_id: DbId, scratch: &Path, elapsed_ms: u64) -> SupervisorOutcome {
        let size = match tokio::fs::metadata(scratch).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        if size == 0 {
            tracing::warn!(job_id, "Normalization exited cleanly but output is missing or empty");
            return failed(FailureReason::CorruptOutput);
        }

        let output_reference = Self::output_reference(job_id);
        let destination = self.resolve(&output_reference);
        let moved = async {
            if let Some(parent) = destination.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(scratch, &destination).await
        }
        .await;

        match moved {
            Ok(()) => {
                tracing::info!(job_id, size, elapsed_ms, "Normalization succeeded");
                SupervisorOutcome::Succeeded { output_reference }
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "Failed to move normalized artifact");
                failed(FailureReason::Io)
            }
        }
    }
}

fn failed(reason: FailureReason) -> SupervisorOutcome {
    SupervisorOutcome::Failed { reason }
}

/// Forcibly stop the child (and its process group) and reap it.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: killpg only sends a signal; the group id is the child's pid
        // because it was spawned with `process_group(0)`.
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
    // The child may already be gone; either way `wait` reaps it.
    let _ = child.start_kill();
    if let Err(e) = child.wait().await {
        tracing::warn!(error = %e, "Failed to reap normalization tool");
    }
}

/// Read a stream to the end, keeping at most [`MAX_STDERR_BYTES`].
async fn read_bounded<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(h) = handle {
        let _ = h.take(MAX_STDERR_BYTES).read_to_end(&mut buf).await;
    }
    buf
}
