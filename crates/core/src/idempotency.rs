//! Idempotency mapping: `(owner_id, client_key) -> job_id` with a TTL.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::to_chrono;
use crate::types::{JobId, OwnerId, Timestamp};

/// Default lifetime of an idempotency mapping: 24 hours.
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub owner_id: OwnerId,
    pub client_key: String,
    pub job_id: JobId,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
}

impl IdempotencyRecord {
    pub fn new(
        owner_id: impl Into<OwnerId>,
        client_key: impl Into<String>,
        job_id: impl Into<JobId>,
        now: Timestamp,
        ttl: Duration,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            client_key: client_key.into(),
            job_id: job_id.into(),
            created_at: now,
            expires_at: now + to_chrono(ttl),
        }
    }

    pub fn is_live(&self, now: Timestamp) -> bool {
        now < self.expires_at
    }
}

/// Outcome of an atomic reserve on `(owner_id, client_key)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// The caller's job id now owns the key.
    Reserved,
    /// A live mapping already existed; the caller must reuse this job.
    Existing(JobId),
}
