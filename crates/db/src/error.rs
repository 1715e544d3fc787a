use conductor_core::error::CoreError;
use conductor_core::types::JobId;

/// Errors from the shared-state layer.
///
/// Transition violations detected by the domain model surface as
/// [`StoreError::Core`]; callers that need to distinguish a lost claim use
/// [`StoreError::is_ownership_lost`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A database error from sqlx.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The requested transition was rejected by the job state machine.
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Job {0} not found")]
    JobNotFound(JobId),

    #[error("Job {0} already exists")]
    Duplicate(JobId),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row could not be mapped back into the domain model.
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// True when the caller no longer holds the claim on the job.
    pub fn is_ownership_lost(&self) -> bool {
        matches!(self, StoreError::Core(CoreError::OwnershipLost { .. }))
    }
}
