//! Job entity models and DTOs for the normalization pipeline.

use audionorm_core::types::{DbId, Timestamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

use super::status::{JobStatus, StatusId};

/// A row from the `jobs` table.
///
/// `output_reference` is present only for succeeded jobs and
/// `error_detail` only for failed ones; the schema enforces both.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: DbId,
    pub status: JobStatus,
    pub input_reference: String,
    pub input_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    #[serde(skip_serializing)]
    pub worker_id: Option<String>,
    pub cancel_requested: bool,
    pub created_at: Timestamp,
    pub lease_expires_at: Option<Timestamp>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub updated_at: Timestamp,
}

impl<'r> FromRow<'r, SqliteRow> for Job {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let status_id: StatusId = row.try_get("status_id")?;
        let status = JobStatus::from_id(status_id).ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "status_id".to_string(),
            source: format!("unknown job status id {status_id}").into(),
        })?;

        Ok(Self {
            id: row.try_get("id")?,
            status,
            input_reference: row.try_get("input_reference")?,
            input_format: row.try_get("input_format")?,
            output_reference: row.try_get("output_reference")?,
            error_detail: row.try_get("error_detail")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            worker_id: row.try_get("worker_id")?,
            cancel_requested: row.try_get("cancel_requested")?,
            created_at: from_millis(row.try_get("created_at")?),
            lease_expires_at: row.try_get::<Option<i64>, _>("lease_expires_at")?.map(from_millis),
            started_at: row.try_get::<Option<i64>, _>("started_at")?.map(from_millis),
            completed_at: row.try_get::<Option<i64>, _>("completed_at")?.map(from_millis),
            updated_at: from_millis(row.try_get("updated_at")?),
        })
    }
}

/// Convert stored epoch milliseconds into a UTC timestamp.
pub fn from_millis(ms: i64) -> Timestamp {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

/// Insert payload for a new pending job.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Storage-relative location of the uploaded input.
    pub input_reference: String,
    /// Detected container name (e.g. `"wav"`).
    pub input_format: String,
    /// Retry budget copied from configuration at creation time.
    pub max_retries: i32,
}

/// Query parameters for listing jobs.
#[derive(Debug, Default, Deserialize)]
pub struct JobListQuery {
    /// Filter by status (e.g. `pending`, `failed`).
    pub status: Option<JobStatus>,
    /// Maximum number of results. Defaults to 50, capped at 100.
    pub limit: Option<i64>,
    /// Number of results to skip. Defaults to 0.
    pub offset: Option<i64>,
}
