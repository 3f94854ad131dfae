//! Runs one leased job to completion.
//!
//! The executor drives the supervisor while renewing the lease, then writes
//! the terminal (or retry) state back to the store. Nothing is written if the
//! lease was lost along the way: the sweeper has already handed the job to
//! someone else.

use audionorm_core::supervisor::SupervisorOutcome;
use audionorm_core::types::DbId;
use audionorm_db::models::job::Job;
use audionorm_db::models::status::JobStatus;
use audionorm_db::repositories::JobRepo;
use tokio_util::sync::CancellationToken;

use crate::context::PipelineContext;

/// Execute `job`, which `worker_id` has just leased.
pub async fn execute(ctx: &PipelineContext, worker_id: &str, job: Job, shutdown: &CancellationToken) {
    let job_id = job.id;
    let attempt = job.retry_count + 1;
    let token = ctx.registry.register(job_id, job.retry_count, shutdown);
    observe_requested_cancel(ctx, job_id, &token).await;

    tracing::info!(
        job_id,
        worker_id,
        attempt,
        max_attempts = job.max_retries + 1,
        "Job started",
    );

    let run = ctx.supervisor.run(
        job_id,
        job.retry_count,
        &job.input_reference,
        ctx.config.per_job_timeout,
        &token,
    );
    tokio::pin!(run);

    let period = ctx.config.lease_renewal_interval();
    let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let mut lease_lost = false;

    let outcome = loop {
        tokio::select! {
            outcome = &mut run => break outcome,
            _ = renew.tick(), if !lease_lost => {
                match JobRepo::renew_lease(&ctx.db, job_id, worker_id, ctx.config.lease_duration).await {
                    Ok(true) => tracing::trace!(job_id, worker_id, "Lease renewed"),
                    Ok(false) => {
                        tracing::warn!(job_id, worker_id, "Lease lost, abandoning job");
                        lease_lost = true;
                        token.cancel();
                    }
                    Err(e) => {
                        tracing::warn!(job_id, worker_id, error = %e, "Lease renewal failed");
                    }
                }
            }
        }
    };

    ctx.registry.remove(job_id, job.retry_count);

    if lease_lost {
        // The job may already be leased again; its artifact path is shared,
        // so whatever was produced here is left for the next attempt to overwrite.
        tracing::debug!(job_id, worker_id, ?outcome, "Result discarded after lease loss");
        return;
    }

    if matches!(outcome, SupervisorOutcome::Cancelled) && shutdown.is_cancelled() {
        // Left running; startup recovery or the sweeper decides its fate.
        tracing::info!(job_id, worker_id, "Shutdown interrupted job");
        return;
    }

    // A successful renewal guarantees the lease outlives the write below.
    match JobRepo::renew_lease(&ctx.db, job_id, worker_id, ctx.config.lease_duration).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(job_id, worker_id, ?outcome, "Lease expired before completion, discarding result");
            return;
        }
        Err(e) => {
            tracing::error!(job_id, worker_id, error = %e, "Failed to confirm lease, leaving job to the sweeper");
            return;
        }
    }

    let cancel_requested = token.is_cancelled() && !shutdown.is_cancelled();
    finish(ctx, worker_id, &job, outcome, cancel_requested).await;
}

/// Pick up a cancellation that reached the store before the job's token was
/// registered, so the gateway's signal found nothing to cancel.
async fn observe_requested_cancel(ctx: &PipelineContext, job_id: DbId, token: &CancellationToken) {
    match JobRepo::find_by_id(&ctx.db, job_id).await {
        Ok(Some(job)) if job.cancel_requested => {
            tracing::debug!(job_id, "Cancellation requested before registration");
            token.cancel();
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(job_id, error = %e, "Failed to check for requested cancellation"),
    }
}

/// Write the outcome of a run whose lease is confirmed.
async fn finish(
    ctx: &PipelineContext,
    worker_id: &str,
    job: &Job,
    outcome: SupervisorOutcome,
    cancel_requested: bool,
) {
    let job_id = job.id;

    match outcome {
        SupervisorOutcome::Succeeded { output_reference } if cancel_requested => {
            remove_file(ctx, &output_reference).await;
            record_cancelled(ctx, job).await;
        }
        SupervisorOutcome::Succeeded { output_reference } => {
            match JobRepo::mark_succeeded(&ctx.db, job_id, &output_reference).await {
                Ok(()) => {
                    tracing::info!(job_id, worker_id, output = %output_reference, "Job succeeded");
                    remove_file(ctx, &job.input_reference).await;
                }
                Err(e) => {
                    tracing::error!(job_id, worker_id, error = %e, "Failed to record success");
                }
            }
        }
        SupervisorOutcome::Failed { .. } if cancel_requested => record_cancelled(ctx, job).await,
        SupervisorOutcome::Failed { reason } => {
            let detail = reason.as_detail();
            match JobRepo::mark_failed(&ctx.db, job_id, detail, reason.is_retryable()).await {
                Ok(JobStatus::Pending) => {
                    tracing::warn!(
                        job_id,
                        worker_id,
                        attempt = job.retry_count + 1,
                        reason = detail,
                        "Job attempt failed, requeued",
                    );
                }
                Ok(JobStatus::Cancelled) => {
                    tracing::info!(job_id, worker_id, reason = detail, "Job cancelled after failed attempt");
                    remove_file(ctx, &job.input_reference).await;
                }
                Ok(status) => {
                    tracing::error!(
                        job_id,
                        worker_id,
                        attempt = job.retry_count + 1,
                        reason = detail,
                        %status,
                        "Job failed",
                    );
                    remove_file(ctx, &job.input_reference).await;
                }
                Err(e) => {
                    tracing::error!(job_id, worker_id, error = %e, "Failed to record failure");
                }
            }
        }
        SupervisorOutcome::Cancelled => record_cancelled(ctx, job).await,
    }
}

async fn record_cancelled(ctx: &PipelineContext, job: &Job) {
    match JobRepo::mark_cancelled(&ctx.db, job.id).await {
        Ok(()) => {
            tracing::info!(job_id = job.id, "Job cancelled");
            remove_file(ctx, &job.input_reference).await;
        }
        Err(e) => tracing::error!(job_id = job.id, error = %e, "Failed to record cancellation"),
    }
}

/// Remove a storage-relative file, ignoring one that is already gone.
pub(crate) async fn remove_file(ctx: &PipelineContext, reference: &str) {
    let path = ctx.supervisor.resolve(reference);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove file"),
    }
}
