//! PostgreSQL implementations of the storage traits.
//!
//! Each repository is a zero-sized type with associated functions that take
//! the pool explicitly. [`PgStore`] bundles the pool and implements every
//! trait in [`crate::store`] by delegating to them.

pub mod idempotency_repo;
pub mod job_repo;
pub mod queue_repo;
pub mod rate_limit_repo;
pub mod worker_repo;

use std::time::Duration;

pub use idempotency_repo::IdempotencyRepo;
pub use job_repo::JobRepo;
pub use queue_repo::QueueRepo;
pub use rate_limit_repo::RateLimitRepo;
pub use worker_repo::WorkerRepo;

use crate::memory::DEFAULT_VISIBILITY_TIMEOUT;
use crate::DbPool;

/// How often an idle `receive` re-polls the queue table.
pub const DEFAULT_QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Shared PostgreSQL-backed state. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: DbPool,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            poll_interval: DEFAULT_QUEUE_POLL_INTERVAL,
        }
    }

    /// Override the queue's visibility timeout.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Override how often an idle `receive` re-polls.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

/// Saturating conversion for counters stored as `INTEGER`.
pub(crate) fn to_db_int(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}
