//! External collaborators of the orchestration layer, at their boundary.
//!
//! - [`client`]: the compute backend that actually runs a job.
//! - [`http`]: a REST implementation of [`BackendClient`].
//! - [`artifacts`]: durable storage for job outputs (S3 or in-memory).
//! - [`quota`]: per-owner rate-limit quotas resolved from the owner's tier.
//! - [`backoff`]: exponential retry delays.

pub mod artifacts;
pub mod backoff;
pub mod client;
#[cfg(any(test, feature = "test-support"))]
pub mod fake;
pub mod http;
pub mod quota;

pub use artifacts::{ArtifactError, ArtifactStore, MemoryArtifactStore, S3ArtifactStore};
pub use backoff::Backoff;
pub use client::{BackendClient, BackendError, BackendOutput, BackendPoll, BackendTaskId};
pub use http::HttpBackendClient;
pub use quota::{QuotaError, QuotaProvider, Tier, TierQuotaProvider, TierTable};
