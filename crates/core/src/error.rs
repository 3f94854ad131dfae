use crate::types::DbId;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: DbId },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// The requested state change is not allowed from the entity's current state.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// A bounded resource (worker pool, queue) is saturated.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The durable store could not complete the operation.
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display_names_entity() {
        let err = CoreError::NotFound { entity: "Job", id: 9 };
        assert_eq!(err.to_string(), "Entity not found: Job with id 9");
    }

    #[test]
    fn resource_exhausted_display() {
        let err = CoreError::ResourceExhausted("worker pool saturated".into());
        assert_eq!(err.to_string(), "Resource exhausted: worker pool saturated");
    }
}
