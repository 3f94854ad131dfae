//! Lease sweeper.
//!
//! Periodically reclaims running jobs whose lease has expired, i.e. whose
//! executor crashed, hung past its lease, or lost contact with the store.
//! Runs on a fixed `tokio::time::interval` independent of request traffic.

use audionorm_core::supervisor::ProcessSupervisor;
use audionorm_core::types::DbId;
use audionorm_db::repositories::JobRepo;
use audionorm_db::StoreError;
use tokio_util::sync::CancellationToken;

use crate::context::PipelineContext;
use crate::executor::remove_file;

/// What startup recovery cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub reclaimed_jobs: usize,
    pub purged_work_areas: usize,
}

/// Run the sweeper loop until `cancel` is triggered.
pub async fn run(ctx: PipelineContext, cancel: CancellationToken) {
    let sweep_interval = ctx.config.sweep_interval;
    tracing::info!(
        interval_ms = sweep_interval.as_millis() as u64,
        lease_ms = ctx.config.lease_duration.as_millis() as u64,
        "Lease sweeper started",
    );

    let mut interval = tokio::time::interval(sweep_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Lease sweeper stopping");
                break;
            }
            _ = interval.tick() => {
                match sweep_once(&ctx).await {
                    Ok(reclaimed) if !reclaimed.is_empty() => {
                        tracing::warn!(count = reclaimed.len(), job_ids = ?reclaimed, "Reclaimed expired leases");
                    }
                    Ok(_) => tracing::trace!("Lease sweep: nothing to reclaim"),
                    Err(e) => tracing::error!(error = %e, "Lease sweep failed"),
                }
            }
        }
    }
}

/// Reclaim every expired lease once. Returns the reclaimed job ids.
pub async fn sweep_once(ctx: &PipelineContext) -> Result<Vec<DbId>, StoreError> {
    let reclaimed = JobRepo::reclaim_expired_leases(&ctx.db).await?;
    release_finished_inputs(ctx, &reclaimed).await;
    Ok(reclaimed)
}

/// Recover from an unclean shutdown before any worker starts.
///
/// Every job still marked running belongs to a previous process, so all of
/// them are reclaimed regardless of lease expiry, and every leftover work
/// area is deleted.
pub async fn recover_on_startup(ctx: &PipelineContext) -> Result<RecoveryReport, StoreError> {
    let reclaimed = JobRepo::reclaim_all_running(&ctx.db).await?;
    release_finished_inputs(ctx, &reclaimed).await;

    let purged_work_areas = match ctx.supervisor.purge_stale_work_areas() {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to purge stale work areas");
            0
        }
    };

    let report = RecoveryReport {
        reclaimed_jobs: reclaimed.len(),
        purged_work_areas,
    };
    tracing::info!(
        reclaimed_jobs = report.reclaimed_jobs,
        purged_work_areas = report.purged_work_areas,
        "Startup recovery complete",
    );
    Ok(report)
}

/// Delete the files of reclaimed jobs that ended terminally.
async fn release_finished_inputs(ctx: &PipelineContext, job_ids: &[DbId]) {
    for &job_id in job_ids {
        match JobRepo::find_by_id(&ctx.db, job_id).await {
            Ok(Some(job)) if job.status.is_terminal() => {
                tracing::info!(job_id, status = %job.status, "Reclaimed job finished");
                remove_file(ctx, &job.input_reference).await;
                // A stale holder may have produced an artifact nobody will claim.
                remove_file(ctx, &ProcessSupervisor::output_reference(job_id)).await;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(job_id, error = %e, "Failed to inspect reclaimed job"),
        }
    }
}
