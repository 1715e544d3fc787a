use crate::job::JobStatus;
use crate::types::JobId;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid job transition for {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Worker {worker_id} no longer owns job {job_id}")]
    OwnershipLost { job_id: JobId, worker_id: String },

    #[error("Internal error: {0}")]
    Internal(String),
}
