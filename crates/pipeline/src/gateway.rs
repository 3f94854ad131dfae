//! The operations the HTTP layer is allowed to perform on jobs.
//!
//! Every method maps store and validation failures onto [`CoreError`] so the
//! caller only has one error taxonomy to translate into responses.

use std::path::PathBuf;

use audionorm_core::audio::validate_upload;
use audionorm_core::error::CoreError;
use audionorm_core::types::DbId;
use audionorm_db::models::job::{Job, JobListQuery, NewJob};
use audionorm_db::models::status::JobStatus;
use audionorm_db::repositories::JobRepo;
use serde::Serialize;

use crate::context::PipelineContext;
use crate::executor::remove_file;

/// Directory (relative to the storage root) holding uploaded inputs.
pub const INPUT_DIR: &str = "inputs";

/// A cancel can race a reclaim that puts the job back to pending; retry this often.
const CANCEL_ATTEMPTS: usize = 3;

/// Snapshot of pipeline health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub db_healthy: bool,
    pub busy_workers: usize,
    pub max_workers: usize,
    /// `None` when the store could not be queried.
    pub pending_jobs: Option<i64>,
}

/// Job submission, inspection and cancellation.
#[derive(Clone)]
pub struct JobGateway {
    ctx: PipelineContext,
}

impl JobGateway {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Accept an uploaded audio file and queue a job for it.
    ///
    /// Invalid payloads are rejected before anything is stored. When every
    /// worker is busy and the backlog is full, the submission is refused with
    /// [`CoreError::ResourceExhausted`] rather than queued.
    pub async fn submit(&self, bytes: &[u8]) -> Result<DbId, CoreError> {
        let container = validate_upload(bytes, self.ctx.config.max_upload_bytes)?;

        if self.ctx.capacity.all_busy() {
            let pending = JobRepo::count_by_status(&self.ctx.db, JobStatus::Pending).await?;
            if pending >= self.ctx.config.max_queue_depth {
                tracing::warn!(
                    pending,
                    max_queue_depth = self.ctx.config.max_queue_depth,
                    "Rejecting submission, pipeline saturated",
                );
                return Err(CoreError::ResourceExhausted(format!(
                    "all {} workers are busy and {pending} jobs are queued",
                    self.ctx.capacity.max_workers()
                )));
            }
        }

        let input_reference = format!(
            "{INPUT_DIR}/{}.{}",
            uuid::Uuid::new_v4(),
            container.extension()
        );
        let path = self.ctx.supervisor.resolve(&input_reference);
        let stored = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, bytes).await
        }
        .await;
        if let Err(e) = stored {
            tracing::error!(path = %path.display(), error = %e, "Failed to store upload");
            return Err(CoreError::Internal("failed to store upload".to_string()));
        }

        let new_job = NewJob {
            input_reference: input_reference.clone(),
            input_format: container.name().to_string(),
            max_retries: self.ctx.config.max_retries,
        };
        match JobRepo::create(&self.ctx.db, &new_job).await {
            Ok(job_id) => {
                tracing::info!(
                    job_id,
                    format = container.name(),
                    size = bytes.len(),
                    "Job submitted",
                );
                Ok(job_id)
            }
            Err(e) => {
                remove_file(&self.ctx, &input_reference).await;
                Err(e.into())
            }
        }
    }

    /// Current snapshot of a job.
    pub async fn status(&self, job_id: DbId) -> Result<Job, CoreError> {
        JobRepo::find_by_id(&self.ctx.db, job_id)
            .await?
            .ok_or(CoreError::NotFound {
                entity: "Job",
                id: job_id,
            })
    }

    /// Cancel a job.
    ///
    /// A pending job is cancelled immediately. A running job is flagged in
    /// the store and its supervisor is signalled; it reaches `cancelled` once
    /// its executor has killed the tool. A terminal job is a conflict.
    pub async fn cancel(&self, job_id: DbId) -> Result<Job, CoreError> {
        for _ in 0..CANCEL_ATTEMPTS {
            if JobRepo::cancel_pending(&self.ctx.db, job_id).await? {
                tracing::info!(job_id, "Pending job cancelled");
                let job = self.status(job_id).await?;
                remove_file(&self.ctx, &job.input_reference).await;
                return Ok(job);
            }

            if JobRepo::request_cancel(&self.ctx.db, job_id).await? {
                let signalled = self.ctx.registry.cancel(job_id);
                tracing::info!(job_id, signalled, "Cancellation requested for running job");
                return self.status(job_id).await;
            }

            let job = self.status(job_id).await?;
            if job.status.is_terminal() {
                return Err(CoreError::InvalidTransition(format!(
                    "job {job_id} is already {}",
                    job.status
                )));
            }
        }

        Err(CoreError::Conflict(format!(
            "job {job_id} changed state while cancelling, try again"
        )))
    }

    pub async fn list(&self, query: &JobListQuery) -> Result<Vec<Job>, CoreError> {
        Ok(JobRepo::list(&self.ctx.db, query).await?)
    }

    /// Absolute path of a succeeded job's normalized artifact.
    pub async fn output_path(&self, job_id: DbId) -> Result<PathBuf, CoreError> {
        let job = self.status(job_id).await?;
        match (job.status, job.output_reference) {
            (JobStatus::Succeeded, Some(reference)) => Ok(self.ctx.supervisor.resolve(&reference)),
            (status, _) => Err(CoreError::InvalidTransition(format!(
                "job {job_id} has no output while {status}"
            ))),
        }
    }

    pub async fn health(&self) -> HealthReport {
        let db_healthy = audionorm_db::health_check(&self.ctx.db).await.is_ok();
        let pending_jobs = if db_healthy {
            JobRepo::count_by_status(&self.ctx.db, JobStatus::Pending)
                .await
                .ok()
        } else {
            None
        };

        HealthReport {
            db_healthy,
            busy_workers: self.ctx.capacity.busy(),
            max_workers: self.ctx.capacity.max_workers(),
            pending_jobs,
        }
    }
}
