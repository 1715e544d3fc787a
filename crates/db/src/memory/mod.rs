//! Process-local implementations of the storage traits.
//!
//! Each store guards its map with a single `tokio::sync::Mutex`, which makes
//! every trait method trivially atomic. Transition rules are delegated to
//! [`conductor_core::job::Job`] so these stores behave exactly like the
//! PostgreSQL ones.

mod idempotency;
mod job_store;
mod queue;
mod rate_limit;
mod workers;

pub use idempotency::MemoryIdempotencyStore;
pub use job_store::MemoryJobStore;
pub use queue::{MemoryQueue, DEFAULT_VISIBILITY_TIMEOUT};
pub use rate_limit::MemoryRateLimitStore;
pub use workers::MemoryWorkerRegistry;
