//! Submission-side services of the orchestration layer.
//!
//! - [`SubmissionService`]: Submit / GetStatus / Cancel / SubscribeProgress.
//! - [`RateLimiter`]: per-owner token-bucket admission.
//! - [`OrchestratorMetrics`]: the Prometheus registry shared with workers.

pub mod metrics;
pub mod rate_limiter;
pub mod submission;

pub use metrics::{MetricsError, OrchestratorMetrics};
pub use rate_limiter::{RateLimitError, RateLimiter};
pub use submission::{
    SubmissionConfig, SubmissionService, SubmitError, SubmitReceipt, SubmitRequest,
};
