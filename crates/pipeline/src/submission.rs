//! Job Submission Service: the only entry point that creates jobs.
//!
//! `submit` runs, in order: validation, idempotency reservation, rate
//! limiting, job insert, enqueue. A reservation is released again if the
//! request is rejected or the insert fails, so a client retry with the same
//! key is not pinned to a job that never existed.
//!
//! A duplicate that finds a reservation whose job is not yet visible waits
//! briefly for it. If the job never appears the first submit died or was
//! rejected, and the duplicate takes the key over instead of returning a
//! job id that does not exist.

use std::sync::Arc;
use std::time::Duration;

use conductor_core::clock::Clock;
use conductor_core::error::CoreError;
use conductor_core::idempotency::{IdempotencyRecord, Reservation, DEFAULT_IDEMPOTENCY_TTL};
use conductor_core::job::{CancelOutcome, Job, JobStatus};
use conductor_core::job_events::MSG_JOB_CANCELED;
use conductor_core::rate_limit::RateDecision;
use conductor_core::types::{new_job_id, JobId, OwnerId, Timestamp};
use conductor_core::validation::{
    validate_idempotency_key, validate_owner_id, validate_payload, DEFAULT_MAX_PAYLOAD_BYTES,
};
use conductor_db::{StoreError, Stores};
use conductor_events::{ProgressEvent, ProgressHub, ProgressStream};
use serde::Serialize;

use crate::metrics::OrchestratorMetrics;
use crate::rate_limiter::{RateLimitError, RateLimiter};

/// How often a duplicate submit re-checks for the job its key points at.
const DEDUP_CONFIRM_ATTEMPTS: u32 = 5;
const DEDUP_CONFIRM_DELAY: Duration = Duration::from_millis(20);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Tunables for the submission path.
#[derive(Debug, Clone, Copy)]
pub struct SubmissionConfig {
    pub max_payload_bytes: usize,
    pub idempotency_ttl: Duration,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub owner_id: OwnerId,
    pub idempotency_key: Option<String>,
    pub payload: Vec<u8>,
}

impl SubmitRequest {
    pub fn new(owner_id: impl Into<OwnerId>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            owner_id: owner_id.into(),
            idempotency_key: None,
            payload: payload.into(),
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// What the caller gets back from a successful submit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitReceipt {
    pub job_id: JobId,
    /// True when an earlier submit with the same key created the job.
    pub deduplicated: bool,
    /// Bucket state after admission; `None` for deduplicated submits.
    pub rate: Option<RateDecision>,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Rate limit exceeded; retry after {retry_after:?}")]
    RateLimitExceeded {
        retry_after: Duration,
        decision: RateDecision,
    },

    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    RateLimiter(#[from] RateLimitError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<CoreError> for SubmitError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => SubmitError::Validation(msg),
            CoreError::Forbidden(msg) => SubmitError::Forbidden(msg),
            CoreError::NotFound { id, .. } => SubmitError::NotFound(id),
            other => SubmitError::Store(StoreError::Core(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct SubmissionService {
    stores: Stores,
    rate_limiter: RateLimiter,
    hub: ProgressHub,
    clock: Arc<dyn Clock>,
    metrics: OrchestratorMetrics,
    config: SubmissionConfig,
}

impl SubmissionService {
    pub fn new(
        stores: Stores,
        rate_limiter: RateLimiter,
        hub: ProgressHub,
        clock: Arc<dyn Clock>,
        metrics: OrchestratorMetrics,
        config: SubmissionConfig,
    ) -> Self {
        Self {
            stores,
            rate_limiter,
            hub,
            clock,
            metrics,
            config,
        }
    }

    /// Create a job, or return the one already created for the same
    /// `(owner_id, idempotency_key)`.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, SubmitError> {
        let SubmitRequest {
            owner_id,
            idempotency_key,
            payload,
        } = request;

        validate_owner_id(&owner_id)?;
        if let Some(key) = &idempotency_key {
            validate_idempotency_key(key)?;
        }
        validate_payload(&payload, self.config.max_payload_bytes)?;

        let now = self.clock.now();
        let job_id = new_job_id();

        if let Some(key) = &idempotency_key {
            let record = IdempotencyRecord::new(
                owner_id.clone(),
                key.clone(),
                job_id.clone(),
                now,
                self.config.idempotency_ttl,
            );
            if let Some(existing) = self.reserve_key(record, now).await? {
                self.metrics.job_deduplicated();
                tracing::info!(job_id = %existing, owner_id = %owner_id, "Duplicate submit resolved to existing job");
                return Ok(SubmitReceipt {
                    job_id: existing,
                    deduplicated: true,
                    rate: None,
                });
            }
        }

        let decision = match self.rate_limiter.allow(&owner_id, 1).await {
            Ok(decision) => decision,
            Err(e) => {
                self.release(&owner_id, idempotency_key.as_deref(), &job_id).await;
                return Err(e.into());
            }
        };
        if !decision.allowed {
            self.release(&owner_id, idempotency_key.as_deref(), &job_id).await;
            return Err(SubmitError::RateLimitExceeded {
                retry_after: decision.retry_after.unwrap_or_default(),
                decision,
            });
        }

        let job = Job::new_queued(job_id.clone(), owner_id.clone(), payload, now);
        if let Err(e) = self.stores.jobs.insert(&job).await {
            self.release(&owner_id, idempotency_key.as_deref(), &job_id).await;
            return Err(e.into());
        }

        // The job is durable from here on; a lost enqueue is repaired by the
        // recovery sweep, so it must not fail the submit.
        if let Err(e) = self.stores.queue.push(&job_id).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to enqueue job, recovery sweep will re-enqueue");
        }

        self.metrics.job_created();
        tracing::info!(job_id = %job_id, owner_id = %owner_id, "Job submitted");

        Ok(SubmitReceipt {
            job_id,
            deduplicated: false,
            rate: Some(decision),
        })
    }

    /// Current snapshot of a job.
    pub async fn status(&self, job_id: &str) -> Result<Job, SubmitError> {
        self.stores
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| SubmitError::NotFound(job_id.to_string()))
    }

    /// Request cancellation on behalf of `owner_id`.
    ///
    /// A queued job is canceled immediately; a running job is flagged and
    /// its worker stops at its next poll tick.
    pub async fn cancel(&self, job_id: &str, owner_id: &str) -> Result<CancelOutcome, SubmitError> {
        let job = self.status(job_id).await?;
        if job.owner_id != owner_id {
            return Err(SubmitError::Forbidden(format!(
                "job {job_id} does not belong to {owner_id}"
            )));
        }

        let now = self.clock.now();
        let outcome = self.stores.jobs.request_cancel(job_id, now).await?;
        match outcome {
            CancelOutcome::Canceled => {
                if let Err(e) = self.stores.queue.remove(job_id).await {
                    tracing::warn!(job_id, error = %e, "Failed to remove canceled job from queue");
                }
                self.hub.publish(
                    ProgressEvent::new(job_id, JobStatus::Canceled, now).with_message(MSG_JOB_CANCELED),
                );
                self.metrics.job_canceled();
                tracing::info!(job_id, owner_id, "Queued job canceled");
            }
            CancelOutcome::CancelRequested => {
                tracing::info!(job_id, owner_id, "Cancel requested for running job");
            }
            CancelOutcome::AlreadyTerminal(status) => {
                tracing::debug!(job_id, %status, "Cancel ignored, job already terminal");
            }
        }
        Ok(outcome)
    }

    /// Stream of progress events for a job, ending at its terminal event.
    pub async fn subscribe_progress(&self, job_id: &str) -> Result<ProgressStream, SubmitError> {
        // Subscribe before reading the snapshot so a terminal event published
        // in between is not missed.
        let stream = self.hub.subscribe(job_id);
        let job = self.status(job_id).await?;
        if job.is_terminal() {
            return Ok(ProgressStream::once(ProgressEvent::from_job(&job, self.clock.now())));
        }
        Ok(stream)
    }

    /// Delete expired idempotency mappings.
    pub async fn purge_expired_idempotency(&self) -> Result<u64, SubmitError> {
        let purged = self.stores.idempotency.purge_expired(self.clock.now()).await?;
        if purged > 0 {
            tracing::info!(purged, "Purged expired idempotency keys");
        }
        Ok(purged)
    }

    /// Reserve the idempotency key. Returns the job an earlier submit created,
    /// or `None` when this submit now owns the key.
    async fn reserve_key(
        &self,
        record: IdempotencyRecord,
        now: Timestamp,
    ) -> Result<Option<JobId>, SubmitError> {
        let mut orphan = None;
        for attempt in 0..DEDUP_CONFIRM_ATTEMPTS {
            match self.stores.idempotency.reserve(record.clone(), now).await? {
                Reservation::Reserved => return Ok(None),
                Reservation::Existing(existing) => {
                    if self.stores.jobs.get(&existing).await?.is_some() {
                        return Ok(Some(existing));
                    }
                    tracing::debug!(job_id = %existing, attempt, "Reserved job not visible yet");
                    orphan = Some(existing);
                    tokio::time::sleep(DEDUP_CONFIRM_DELAY).await;
                }
            }
        }

        let Some(orphan) = orphan else {
            return Ok(None);
        };
        tracing::warn!(
            job_id = %orphan,
            owner_id = %record.owner_id,
            "Idempotency key points at a job that never appeared, taking it over"
        );
        self.stores
            .idempotency
            .release(&record.owner_id, &record.client_key, &orphan)
            .await?;
        match self.stores.idempotency.reserve(record, now).await? {
            Reservation::Reserved => Ok(None),
            Reservation::Existing(existing) => {
                if self.stores.jobs.get(&existing).await?.is_some() {
                    Ok(Some(existing))
                } else {
                    Err(SubmitError::Conflict(format!(
                        "idempotency key is held by pending job {existing}"
                    )))
                }
            }
        }
    }

    /// Undo an idempotency reservation. Failures are logged: the mapping
    /// then simply expires with its TTL.
    async fn release(&self, owner_id: &str, key: Option<&str>, job_id: &str) {
        let Some(key) = key else {
            return;
        };
        if let Err(e) = self.stores.idempotency.release(owner_id, key, job_id).await {
            tracing::warn!(owner_id, job_id, error = %e, "Failed to release idempotency reservation");
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use conductor_backend::quota::{TierQuotaProvider, TierTable};
    use conductor_core::clock::ManualClock;
    use conductor_core::rate_limit::Quota;

    use super::*;

    fn service(quota: Quota) -> SubmissionService {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());
        let stores = Stores::in_memory(Duration::from_secs(60));
        let metrics = OrchestratorMetrics::new().unwrap();
        let limiter = RateLimiter::new(
            stores.rate_limits.clone(),
            Arc::new(TierQuotaProvider::new(TierTable::uniform(quota))),
            clock.clone(),
            metrics.clone(),
        );
        SubmissionService::new(
            stores,
            limiter,
            ProgressHub::default(),
            clock,
            metrics,
            SubmissionConfig::default(),
        )
    }

    #[tokio::test]
    async fn empty_payload_is_rejected_before_anything_is_stored() {
        let svc = service(Quota::per_hour(10));
        let err = svc.submit(SubmitRequest::new("u1", Vec::new())).await.unwrap_err();
        assert_matches!(err, SubmitError::Validation(_));
        assert_eq!(svc.stores.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let mut svc = service(Quota::per_hour(10));
        svc.config.max_payload_bytes = 4;
        let err = svc.submit(SubmitRequest::new("u1", b"12345".to_vec())).await.unwrap_err();
        assert_matches!(err, SubmitError::Validation(_));
    }

    #[tokio::test]
    async fn submit_creates_queued_job_and_enqueues_it() {
        let svc = service(Quota::per_hour(10));
        let receipt = svc.submit(SubmitRequest::new("u1", b"{}".to_vec())).await.unwrap();
        assert!(!receipt.deduplicated);
        assert_eq!(receipt.rate.map(|r| r.remaining), Some(9));

        let job = svc.status(&receipt.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.request_payload, b"{}");
        assert_eq!(svc.stores.queue.depth().await.unwrap(), 1);
        assert_eq!(svc.metrics.created_count(), 1.0);
    }

    #[tokio::test]
    async fn rate_limited_submit_releases_its_reservation() {
        let svc = service(Quota::per_hour(1));
        svc.submit(SubmitRequest::new("u1", b"a".to_vec())).await.unwrap();

        let err = svc
            .submit(SubmitRequest::new("u1", b"b".to_vec()).with_idempotency_key("k"))
            .await
            .unwrap_err();
        assert_matches!(err, SubmitError::RateLimitExceeded { retry_after, .. } if retry_after == Duration::from_secs(3600));

        let now = svc.clock.now();
        let reserve = svc
            .stores
            .idempotency
            .reserve(IdempotencyRecord::new("u1", "k", "fresh", now, Duration::from_secs(60)), now)
            .await
            .unwrap();
        assert_eq!(reserve, Reservation::Reserved);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_waits_for_a_reservation_that_is_released() {
        let svc = Arc::new(service(Quota::per_hour(10)));
        let now = svc.clock.now();
        // Stands in for a first submit that reserved the key and is about to
        // be rate limited.
        svc.stores
            .idempotency
            .reserve(IdempotencyRecord::new("u1", "k", "ghost", now, Duration::from_secs(60)), now)
            .await
            .unwrap();

        let task = tokio::spawn({
            let svc = svc.clone();
            async move {
                svc.submit(SubmitRequest::new("u1", b"{}".to_vec()).with_idempotency_key("k"))
                    .await
            }
        });
        tokio::time::sleep(DEDUP_CONFIRM_DELAY / 2).await;
        svc.stores.idempotency.release("u1", "k", "ghost").await.unwrap();

        let receipt = task.await.unwrap().unwrap();
        assert!(!receipt.deduplicated);
        assert_ne!(receipt.job_id, "ghost");
        assert_eq!(svc.status(&receipt.job_id).await.unwrap().status, JobStatus::Queued);
        assert_eq!(svc.metrics.deduplicated_count(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_takes_over_a_key_whose_job_never_appears() {
        let svc = service(Quota::per_hour(10));
        let now = svc.clock.now();
        svc.stores
            .idempotency
            .reserve(IdempotencyRecord::new("u1", "k", "ghost", now, Duration::from_secs(60)), now)
            .await
            .unwrap();

        let receipt = svc
            .submit(SubmitRequest::new("u1", b"{}".to_vec()).with_idempotency_key("k"))
            .await
            .unwrap();
        assert!(!receipt.deduplicated);
        assert_ne!(receipt.job_id, "ghost");
        svc.status(&receipt.job_id).await.unwrap();

        let again = svc
            .submit(SubmitRequest::new("u1", b"{}".to_vec()).with_idempotency_key("k"))
            .await
            .unwrap();
        assert!(again.deduplicated);
        assert_eq!(again.job_id, receipt.job_id);
    }

    #[tokio::test]
    async fn status_of_unknown_job_is_not_found() {
        let svc = service(Quota::per_hour(10));
        assert_matches!(svc.status("nope").await, Err(SubmitError::NotFound(id)) if id == "nope");
    }

    #[tokio::test]
    async fn cancel_by_other_owner_is_forbidden() {
        let svc = service(Quota::per_hour(10));
        let receipt = svc.submit(SubmitRequest::new("u1", b"{}".to_vec())).await.unwrap();
        assert_matches!(
            svc.cancel(&receipt.job_id, "intruder").await,
            Err(SubmitError::Forbidden(_))
        );
        assert_eq!(svc.status(&receipt.job_id).await.unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn cancel_queued_job_removes_it_from_the_queue() {
        let svc = service(Quota::per_hour(10));
        let receipt = svc.submit(SubmitRequest::new("u1", b"{}".to_vec())).await.unwrap();

        assert_eq!(
            svc.cancel(&receipt.job_id, "u1").await.unwrap(),
            CancelOutcome::Canceled
        );
        assert_eq!(svc.stores.queue.depth().await.unwrap(), 0);
        assert_eq!(
            svc.cancel(&receipt.job_id, "u1").await.unwrap(),
            CancelOutcome::AlreadyTerminal(JobStatus::Canceled)
        );
        assert_eq!(svc.metrics.canceled_count(), 1.0);
    }

    #[tokio::test]
    async fn purge_removes_expired_keys() {
        let clock = Arc::new(ManualClock::starting_now());
        let mut svc = service(Quota::per_hour(10));
        svc.clock = clock.clone() as Arc<dyn Clock>;
        svc.submit(SubmitRequest::new("u1", b"{}".to_vec()).with_idempotency_key("k"))
            .await
            .unwrap();

        assert_eq!(svc.purge_expired_idempotency().await.unwrap(), 0);
        clock.advance(DEFAULT_IDEMPOTENCY_TTL);
        assert_eq!(svc.purge_expired_idempotency().await.unwrap(), 1);
    }
}
