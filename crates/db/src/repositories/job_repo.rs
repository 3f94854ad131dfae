//! Repository for the `jobs` table.
//!
//! Every state change is a single conditional `UPDATE` so that concurrent
//! workers, the sweeper and the gateway can never interleave a
//! read-then-write on the same job. The lease taken by [`JobRepo::try_lease`]
//! is the only thing that grants a worker the right to run a job.

use std::time::Duration;

use audionorm_core::types::DbId;
use chrono::Utc;

use crate::error::StoreError;
use crate::models::job::{Job, JobListQuery, NewJob};
use crate::models::status::JobStatus;
use crate::DbPool;

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, status_id, input_reference, input_format, output_reference, error_detail, \
    retry_count, max_retries, worker_id, lease_expires_at, cancel_requested, \
    created_at, started_at, completed_at, updated_at";

/// Maximum page size for job listing.
const MAX_LIMIT: i64 = 100;

/// Default page size for job listing.
const DEFAULT_LIMIT: i64 = 50;

/// `error_detail` recorded when a job exhausts its retries through lease expiry.
pub const LEASE_EXPIRED_DETAIL: &str = "lease_expired";

type StoreResult<T> = Result<T, StoreError>;

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn lease_deadline(now: i64, lease_duration: Duration) -> i64 {
    now.saturating_add(lease_duration.as_millis().min(i64::MAX as u128) as i64)
}

/// Provides the atomic job operations used by the gateway, workers and sweeper.
pub struct JobRepo;

impl JobRepo {
    /// Insert a new pending job and return its id.
    pub async fn create(pool: &DbPool, input: &NewJob) -> StoreResult<DbId> {
        let now = now_millis();
        let id = sqlx::query_scalar::<_, DbId>(
            "INSERT INTO jobs \
                 (status_id, input_reference, input_format, max_retries, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $5) \
             RETURNING id",
        )
        .bind(JobStatus::Pending.id())
        .bind(&input.input_reference)
        .bind(&input.input_format)
        .bind(input.max_retries)
        .bind(now)
        .fetch_one(pool)
        .await?;
        Ok(id)
    }

    /// Find a job by its ID.
    pub async fn find_by_id(pool: &DbPool, id: DbId) -> StoreResult<Option<Job>> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        let job = sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(job)
    }

    /// Pending jobs in submission order (oldest first). Read-only.
    pub async fn fetch_pending(pool: &DbPool, limit: i64) -> StoreResult<Vec<Job>> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE status_id = $1 \
             ORDER BY created_at ASC, id ASC \
             LIMIT $2"
        );
        let jobs = sqlx::query_as::<_, Job>(&query)
            .bind(JobStatus::Pending.id())
            .bind(limit.max(0))
            .fetch_all(pool)
            .await?;
        Ok(jobs)
    }

    /// Atomically move a pending job to running under `worker_id`'s lease.
    ///
    /// Returns `false` when the job is not pending or another lease is
    /// still active. A `true` return is the only licence to run the job.
    pub async fn try_lease(
        pool: &DbPool,
        id: DbId,
        worker_id: &str,
        lease_duration: Duration,
    ) -> StoreResult<bool> {
        let now = now_millis();
        let result = sqlx::query(
            "UPDATE jobs \
             SET status_id = $1, worker_id = $2, lease_expires_at = $3, \
                 started_at = $4, updated_at = $4 \
             WHERE id = $5 AND status_id = $6 \
               AND worker_id IS NULL \
               AND (lease_expires_at IS NULL OR lease_expires_at <= $4)",
        )
        .bind(JobStatus::Running.id())
        .bind(worker_id)
        .bind(lease_deadline(now, lease_duration))
        .bind(now)
        .bind(id)
        .bind(JobStatus::Pending.id())
        .execute(pool)
        .await?;

        let leased = result.rows_affected() == 1;
        if leased {
            tracing::debug!(job_id = id, worker_id, "Job leased");
        }
        Ok(leased)
    }

    /// Extend a lease still held by `worker_id`.
    ///
    /// Returns `false` if the lease was lost (reclaimed, cancelled or
    /// finished elsewhere); the caller must then stop working on the job.
    pub async fn renew_lease(
        pool: &DbPool,
        id: DbId,
        worker_id: &str,
        lease_duration: Duration,
    ) -> StoreResult<bool> {
        let now = now_millis();
        let result = sqlx::query(
            "UPDATE jobs \
             SET lease_expires_at = $1, updated_at = $2 \
             WHERE id = $3 AND status_id = $4 AND worker_id = $5 AND lease_expires_at > $2",
        )
        .bind(lease_deadline(now, lease_duration))
        .bind(now)
        .bind(id)
        .bind(JobStatus::Running.id())
        .bind(worker_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Record a successful normalization. The job must be running.
    pub async fn mark_succeeded(
        pool: &DbPool,
        id: DbId,
        output_reference: &str,
    ) -> StoreResult<()> {
        let now = now_millis();
        let result = sqlx::query(
            "UPDATE jobs \
             SET status_id = $1, output_reference = $2, error_detail = NULL, \
                 worker_id = NULL, lease_expires_at = NULL, \
                 completed_at = $3, updated_at = $3 \
             WHERE id = $4 AND status_id = $5",
        )
        .bind(JobStatus::Succeeded.id())
        .bind(output_reference)
        .bind(now)
        .bind(id)
        .bind(JobStatus::Running.id())
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Self::transition_error(pool, id, "marked succeeded").await);
        }
        Ok(())
    }

    /// Record a failed attempt. The job must be running.
    ///
    /// A retryable failure with budget left sends the job back to pending
    /// with `retry_count + 1`; anything else is terminal with
    /// `error_detail` set. A job flagged by `request_cancel` ends cancelled
    /// instead, as it would on reclaim. Returns the status the job ended up in.
    pub async fn mark_failed(
        pool: &DbPool,
        id: DbId,
        error_detail: &str,
        retryable: bool,
    ) -> StoreResult<JobStatus> {
        let now = now_millis();
        let status_id = sqlx::query_scalar::<_, i16>(
            "UPDATE jobs \
             SET status_id = CASE \
                     WHEN cancel_requested = 1 THEN $8 \
                     WHEN $1 AND retry_count < max_retries THEN $2 \
                     ELSE $3 END, \
                 retry_count = CASE \
                     WHEN cancel_requested = 0 AND $1 AND retry_count < max_retries \
                     THEN retry_count + 1 ELSE retry_count END, \
                 error_detail = CASE \
                     WHEN cancel_requested = 1 THEN NULL \
                     WHEN $1 AND retry_count < max_retries THEN NULL \
                     ELSE $4 END, \
                 completed_at = CASE \
                     WHEN cancel_requested = 0 AND $1 AND retry_count < max_retries THEN NULL \
                     ELSE $5 END, \
                 worker_id = NULL, lease_expires_at = NULL, updated_at = $5 \
             WHERE id = $6 AND status_id = $7 \
             RETURNING status_id",
        )
        .bind(retryable)
        .bind(JobStatus::Pending.id())
        .bind(JobStatus::Failed.id())
        .bind(error_detail)
        .bind(now)
        .bind(id)
        .bind(JobStatus::Running.id())
        .bind(JobStatus::Cancelled.id())
        .fetch_optional(pool)
        .await?;

        match status_id.and_then(JobStatus::from_id) {
            Some(status) => Ok(status),
            None => Err(Self::transition_error(pool, id, "marked failed").await),
        }
    }

    /// Finish a running job as cancelled (its process was terminated).
    pub async fn mark_cancelled(pool: &DbPool, id: DbId) -> StoreResult<()> {
        let now = now_millis();
        let result = sqlx::query(
            "UPDATE jobs \
             SET status_id = $1, worker_id = NULL, lease_expires_at = NULL, \
                 completed_at = $2, updated_at = $2 \
             WHERE id = $3 AND status_id = $4",
        )
        .bind(JobStatus::Cancelled.id())
        .bind(now)
        .bind(id)
        .bind(JobStatus::Running.id())
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Self::transition_error(pool, id, "marked cancelled").await);
        }
        Ok(())
    }

    /// Cancel a job that has not been leased yet.
    ///
    /// Returns `true` if the job was pending and is now cancelled.
    pub async fn cancel_pending(pool: &DbPool, id: DbId) -> StoreResult<bool> {
        let now = now_millis();
        let result = sqlx::query(
            "UPDATE jobs \
             SET status_id = $1, completed_at = $2, updated_at = $2 \
             WHERE id = $3 AND status_id = $4",
        )
        .bind(JobStatus::Cancelled.id())
        .bind(now)
        .bind(id)
        .bind(JobStatus::Pending.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Durably flag a running job for cancellation.
    ///
    /// The flag survives a crash: a reclaimed job carrying it becomes
    /// cancelled instead of going back to pending.
    pub async fn request_cancel(pool: &DbPool, id: DbId) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET cancel_requested = 1, updated_at = $1 \
             WHERE id = $2 AND status_id = $3",
        )
        .bind(now_millis())
        .bind(id)
        .bind(JobStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Reclaim running jobs whose lease has expired.
    ///
    /// Each job goes back to pending with `retry_count + 1`, or to failed
    /// (`lease_expired`) once its retry budget is spent, or to cancelled if a
    /// cancellation had been requested. Returns the reclaimed ids.
    pub async fn reclaim_expired_leases(pool: &DbPool) -> StoreResult<Vec<DbId>> {
        Self::reclaim(pool, true).await
    }

    /// Reclaim every running job regardless of lease expiry.
    ///
    /// Only valid at startup, before any worker of this process has taken a
    /// lease: leases left in the table can only belong to a dead process.
    pub async fn reclaim_all_running(pool: &DbPool) -> StoreResult<Vec<DbId>> {
        Self::reclaim(pool, false).await
    }

    async fn reclaim(pool: &DbPool, only_expired: bool) -> StoreResult<Vec<DbId>> {
        let expiry_filter = if only_expired {
            "AND lease_expires_at <= $6"
        } else {
            "AND $6 IS NOT NULL"
        };
        let query = format!(
            "UPDATE jobs \
             SET status_id = CASE \
                     WHEN cancel_requested = 1 THEN $1 \
                     WHEN retry_count >= max_retries THEN $2 \
                     ELSE $3 END, \
                 error_detail = CASE \
                     WHEN cancel_requested = 0 AND retry_count >= max_retries THEN $4 \
                     ELSE NULL END, \
                 retry_count = CASE \
                     WHEN cancel_requested = 0 AND retry_count < max_retries THEN retry_count + 1 \
                     ELSE retry_count END, \
                 completed_at = CASE \
                     WHEN cancel_requested = 1 OR retry_count >= max_retries THEN $6 \
                     ELSE NULL END, \
                 worker_id = NULL, lease_expires_at = NULL, updated_at = $6 \
             WHERE status_id = $5 {expiry_filter} \
             RETURNING id"
        );
        let ids = sqlx::query_scalar::<_, DbId>(&query)
            .bind(JobStatus::Cancelled.id())
            .bind(JobStatus::Failed.id())
            .bind(JobStatus::Pending.id())
            .bind(LEASE_EXPIRED_DETAIL)
            .bind(JobStatus::Running.id())
            .bind(now_millis())
            .fetch_all(pool)
            .await?;

        if !ids.is_empty() {
            tracing::debug!(count = ids.len(), only_expired, "Reclaimed running jobs");
        }
        Ok(ids)
    }

    /// List jobs newest first with optional status filter and pagination.
    pub async fn list(pool: &DbPool, params: &JobListQuery) -> StoreResult<Vec<Job>> {
        let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let offset = params.offset.unwrap_or(0).max(0);

        let jobs = match params.status {
            Some(status) => {
                let query = format!(
                    "SELECT {COLUMNS} FROM jobs WHERE status_id = $1 \
                     ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
                );
                sqlx::query_as::<_, Job>(&query)
                    .bind(status.id())
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(pool)
                    .await?
            }
            None => {
                let query = format!(
                    "SELECT {COLUMNS} FROM jobs \
                     ORDER BY created_at DESC, id DESC LIMIT $1 OFFSET $2"
                );
                sqlx::query_as::<_, Job>(&query)
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(pool)
                    .await?
            }
        };
        Ok(jobs)
    }

    /// Total number of job records.
    pub async fn count(pool: &DbPool) -> StoreResult<i64> {
        let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs")
            .fetch_one(pool)
            .await?;
        Ok(n)
    }

    /// Number of jobs currently in `status`.
    pub async fn count_by_status(pool: &DbPool, status: JobStatus) -> StoreResult<i64> {
        let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs WHERE status_id = $1")
            .bind(status.id())
            .fetch_one(pool)
            .await?;
        Ok(n)
    }

    /// Explain why a conditional update matched no row.
    async fn transition_error(pool: &DbPool, id: DbId, operation: &'static str) -> StoreError {
        let current = sqlx::query_scalar::<_, i16>("SELECT status_id FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await;

        match current {
            Ok(None) => StoreError::NotFound(id),
            Ok(Some(status_id)) => match JobStatus::from_id(status_id) {
                Some(from) => StoreError::InvalidTransition {
                    id,
                    from,
                    operation,
                },
                None => StoreError::Persistence(sqlx::Error::Protocol(format!(
                    "job {id} has unknown status id {status_id}"
                ))),
            },
            Err(e) => StoreError::Persistence(e),
        }
    }
}
