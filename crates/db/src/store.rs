//! Storage seams injected into every orchestration component.
//!
//! Each trait method is a single-key atomic operation. The only operations
//! with cross-writer semantics are [`JobStore::claim`] (and the sweep's
//! [`JobStore::requeue_abandoned`] / [`JobStore::fail_abandoned`], which use
//! the same compare-and-set) and [`IdempotencyStore::reserve`]; every other
//! job write is made by the single worker that owns the job.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conductor_core::idempotency::{IdempotencyRecord, Reservation};
use conductor_core::job::{CancelOutcome, Job, JobError, JobOutcome, JobStatus};
use conductor_core::rate_limit::{Quota, RateDecision};
use conductor_core::types::{JobId, Timestamp, WorkerId};
use serde::Serialize;

use crate::error::StoreError;
use crate::memory::{
    MemoryIdempotencyStore, MemoryJobStore, MemoryQueue, MemoryRateLimitStore,
    MemoryWorkerRegistry,
};
use crate::repositories::PgStore;

/// Answer to a worker heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatAck {
    pub cancel_requested: bool,
}

/// Number of jobs per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts(pub HashMap<JobStatus, u64>);

impl StatusCounts {
    pub fn get(&self, status: JobStatus) -> u64 {
        self.0.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }
}

/// One message handed out by the work queue.
///
/// The message stays invisible to other receivers until it is acked or its
/// visibility timeout lapses, after which it is delivered again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job_id: JobId,
    /// Opaque handle for [`WorkQueue::ack`].
    pub receipt: String,
    /// 1 on first delivery.
    pub delivery_count: u32,
}

// ---------------------------------------------------------------------------
// Job State Store
// ---------------------------------------------------------------------------

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job. Fails with [`StoreError::Duplicate`] if the id exists.
    async fn insert(&self, job: &Job) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError>;

    /// Compare-and-set `Queued -> Running` for `worker_id`.
    ///
    /// Returns the claimed job, or `None` if it was not `Queued` (already
    /// claimed, canceled, finished) or does not exist.
    async fn claim(
        &self,
        id: &str,
        worker_id: &str,
        now: Timestamp,
    ) -> Result<Option<Job>, StoreError>;

    /// Refresh `heartbeat_at`; fails with an ownership error if the worker
    /// lost the claim.
    async fn heartbeat(
        &self,
        id: &str,
        worker_id: &str,
        now: Timestamp,
    ) -> Result<HeartbeatAck, StoreError>;

    async fn record_backend_task(
        &self,
        id: &str,
        worker_id: &str,
        task_id: &str,
        attempts: u32,
    ) -> Result<(), StoreError>;

    async fn record_progress(
        &self,
        id: &str,
        worker_id: &str,
        fraction: f32,
    ) -> Result<(), StoreError>;

    /// Move a job owned by `worker_id` to its terminal state.
    async fn complete(
        &self,
        id: &str,
        worker_id: &str,
        outcome: JobOutcome,
        now: Timestamp,
    ) -> Result<Job, StoreError>;

    /// Queued -> Canceled, Running -> flag, terminal -> no-op.
    async fn request_cancel(&self, id: &str, now: Timestamp) -> Result<CancelOutcome, StoreError>;

    /// Sweep CAS: return a job to `Queued` if it is still running under
    /// `owner` with exactly `heartbeat_at`.
    ///
    /// Returns the resulting status (`Queued`, or `Canceled` when a cancel
    /// was pending), or `None` when the CAS lost to a fresh heartbeat.
    async fn requeue_abandoned(
        &self,
        id: &str,
        owner: &str,
        heartbeat_at: Timestamp,
        now: Timestamp,
    ) -> Result<Option<JobStatus>, StoreError>;

    /// Sweep CAS: fail a job still running under `owner` with exactly
    /// `heartbeat_at`. Returns `false` when the CAS lost.
    async fn fail_abandoned(
        &self,
        id: &str,
        owner: &str,
        heartbeat_at: Timestamp,
        error: JobError,
        now: Timestamp,
    ) -> Result<bool, StoreError>;

    async fn list_running(&self) -> Result<Vec<Job>, StoreError>;

    /// Queued jobs created strictly before `cutoff`, oldest first. The
    /// PostgreSQL store leaves out jobs that still have a queue message.
    async fn list_queued_before(&self, cutoff: Timestamp) -> Result<Vec<Job>, StoreError>;

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError>;
}

// ---------------------------------------------------------------------------
// Idempotency
// ---------------------------------------------------------------------------

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically map `(owner_id, client_key)` to `record.job_id` unless a
    /// live mapping exists. Expired mappings are replaced.
    async fn reserve(
        &self,
        record: IdempotencyRecord,
        now: Timestamp,
    ) -> Result<Reservation, StoreError>;

    /// Drop a mapping, but only if it still points at `job_id`.
    async fn release(&self, owner_id: &str, client_key: &str, job_id: &str)
        -> Result<(), StoreError>;

    /// Delete expired mappings. Returns how many were removed.
    async fn purge_expired(&self, now: Timestamp) -> Result<u64, StoreError>;
}

// ---------------------------------------------------------------------------
// Rate limit counters
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomic refill + check-and-decrement of the owner's bucket.
    async fn try_acquire(
        &self,
        owner_id: &str,
        quota: Quota,
        cost: u32,
        now: Timestamp,
    ) -> Result<RateDecision, StoreError>;

    /// Current bucket state without consuming tokens.
    async fn peek(
        &self,
        owner_id: &str,
        quota: Quota,
        now: Timestamp,
    ) -> Result<RateDecision, StoreError>;
}

// ---------------------------------------------------------------------------
// Work queue
// ---------------------------------------------------------------------------

/// At-least-once queue of job references.
///
/// Delivery may be duplicated; consumers must rely on [`JobStore::claim`]
/// for mutual exclusion.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn push(&self, job_id: &str) -> Result<(), StoreError>;

    /// Wait up to `wait` for a visible message. Never busy-spins.
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, StoreError>;

    /// Remove a delivered message for good.
    async fn ack(&self, receipt: &str) -> Result<(), StoreError>;

    /// Best-effort removal of every message for `job_id`.
    async fn remove(&self, job_id: &str) -> Result<bool, StoreError>;

    /// Whether any message for `job_id` is waiting or in flight.
    async fn contains(&self, job_id: &str) -> Result<bool, StoreError>;

    /// Messages waiting to be delivered.
    async fn depth(&self) -> Result<u64, StoreError>;
}

// ---------------------------------------------------------------------------
// Live worker registry
// ---------------------------------------------------------------------------

#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Upsert the worker's last-seen time.
    async fn beat(&self, worker_id: &str, now: Timestamp) -> Result<(), StoreError>;

    async fn deregister(&self, worker_id: &str) -> Result<(), StoreError>;

    /// Workers seen within `stale_after` of `now`.
    async fn live_workers(
        &self,
        now: Timestamp,
        stale_after: Duration,
    ) -> Result<HashSet<WorkerId>, StoreError>;

    /// Delete workers last seen before `cutoff`. Returns how many went.
    async fn prune(&self, cutoff: Timestamp) -> Result<u64, StoreError>;
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// Every storage seam, shared by the submission service, workers and the
/// recovery sweep.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub rate_limits: Arc<dyn RateLimitStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub workers: Arc<dyn WorkerRegistry>,
}

impl Stores {
    /// Process-local stores.
    pub fn in_memory(visibility_timeout: Duration) -> Self {
        Self {
            jobs: Arc::new(MemoryJobStore::new()),
            idempotency: Arc::new(MemoryIdempotencyStore::new()),
            rate_limits: Arc::new(MemoryRateLimitStore::new()),
            queue: Arc::new(MemoryQueue::new(visibility_timeout)),
            workers: Arc::new(MemoryWorkerRegistry::new()),
        }
    }

    /// All seams backed by one PostgreSQL pool.
    pub fn postgres(store: PgStore) -> Self {
        let store = Arc::new(store);
        Self {
            jobs: store.clone(),
            idempotency: store.clone(),
            rate_limits: store.clone(),
            queue: store.clone(),
            workers: store,
        }
    }
}
