use audionorm_core::error::CoreError;
use audionorm_core::types::DbId;

use crate::models::status::JobStatus;

/// Errors returned by the job store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(DbId),

    /// The job exists but its current status does not allow `operation`.
    #[error("job {id} cannot be {operation} while {from}")]
    InvalidTransition {
        id: DbId,
        from: JobStatus,
        operation: &'static str,
    },

    #[error("store unavailable: {0}")]
    Persistence(#[from] sqlx::Error),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => CoreError::NotFound { entity: "Job", id },
            StoreError::InvalidTransition { .. } => CoreError::InvalidTransition(err.to_string()),
            StoreError::Persistence(e) => CoreError::Persistence(e.to_string()),
        }
    }
}
