//! The compute backend seam.

use async_trait::async_trait;

/// Handle the backend assigns to a submitted task.
pub type BackendTaskId = String;

/// One produced output, ready to be stored as an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOutput {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl BackendOutput {
    pub fn new(bytes: impl Into<Vec<u8>>, content_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.into(),
        }
    }
}

/// State of a backend task at one poll.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BackendPoll {
    pub done: bool,
    /// Fraction complete in `0.0..=1.0`.
    pub progress: f32,
    /// Only meaningful when `done` and `error` is `None`.
    pub outputs: Vec<BackendOutput>,
    /// Set when the task ended in failure.
    pub error: Option<BackendError>,
}

impl BackendPoll {
    pub fn running(progress: f32) -> Self {
        Self {
            progress,
            ..Self::default()
        }
    }

    pub fn succeeded(outputs: Vec<BackendOutput>) -> Self {
        Self {
            done: true,
            progress: 1.0,
            outputs,
            error: None,
        }
    }

    pub fn failed(error: BackendError) -> Self {
        Self {
            done: true,
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Errors from the compute backend, classified by whether a retry can help.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Network failure, overload or a 5xx; retrying may succeed.
    #[error("Transient backend error: {0}")]
    Transient(String),

    /// The backend rejected the work; retrying cannot help.
    #[error("Permanent backend error: {0}")]
    Permanent(String),

    /// The call did not complete within its deadline.
    #[error("Backend call timed out: {0}")]
    Timeout(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Transient(_) | BackendError::Timeout(_))
    }
}

/// Client for the compute backend.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Hand the opaque request payload to the backend verbatim.
    async fn submit(&self, payload: &[u8]) -> Result<BackendTaskId, BackendError>;

    async fn poll(&self, task_id: &str) -> Result<BackendPoll, BackendError>;

    /// Best-effort cancellation of a running task.
    async fn cancel(&self, task_id: &str) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_and_timeout_are_retryable() {
        assert!(BackendError::Transient("503".into()).is_retryable());
        assert!(BackendError::Timeout("poll".into()).is_retryable());
        assert!(!BackendError::Permanent("bad input".into()).is_retryable());
    }

    #[test]
    fn succeeded_poll_is_done_and_complete() {
        let poll = BackendPoll::succeeded(vec![BackendOutput::new(b"x".to_vec(), "text/plain")]);
        assert!(poll.done);
        assert_eq!(poll.progress, 1.0);
        assert!(poll.error.is_none());
    }
}
