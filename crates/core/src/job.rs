//! The `Job` entity and its lifecycle state machine.
//!
//! ```text
//!            claim              succeed / fail / cancel
//!   Queued ─────────▶ Running ──────────────────────────▶ terminal
//!     │  ▲               │
//!     │  └── requeue ────┘   (crash recovery only)
//!     └── cancel ─────────────────────────────────────────▶ Canceled
//! ```
//!
//! Storage backends call the mutators on this type (or mirror them in SQL)
//! so that every store enforces the same transition rules. A job is
//! `Running` iff `worker_owner` and `heartbeat_at` are both set, and the
//! `result`/`error` fields are written exactly once on entering a terminal
//! state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{JobId, OwnerId, Timestamp, WorkerId};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Status ID type matching the SMALLINT `job_statuses` lookup table.
pub type StatusId = i16;

/// Job execution status.
///
/// The discriminants match the seed order of the `job_statuses` table.
#[repr(i16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued = 1,
    Running = 2,
    Succeeded = 3,
    Failed = 4,
    Canceled = 5,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Canceled,
    ];

    /// Return the database status ID.
    pub fn id(self) -> StatusId {
        self as StatusId
    }

    /// Map a database status ID back to the enum.
    pub fn from_id(id: StatusId) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.id() == id)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    ///
    /// `Running -> Queued` is only ever taken by the recovery sweep.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Canceled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Canceled)
                | (Running, Queued)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::Validation(format!("Unknown job status: \"{s}\"")))
    }
}

// ---------------------------------------------------------------------------
// Results and errors
// ---------------------------------------------------------------------------

/// Durable locator for a stored output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Stable object locator (e.g. `s3://bucket/key`).
    pub locator: String,
    /// Time-limited download URL.
    pub download_url: String,
    pub content_type: String,
    pub size_bytes: u64,
    /// When `download_url` stops working.
    pub expires_at: Timestamp,
}

/// Classification of a job-terminating error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// Backend kept failing in a retryable way after all retries.
    BackendTransient,
    /// Backend rejected the work; retrying cannot help.
    BackendPermanent,
    /// The per-job execution deadline elapsed.
    Timeout,
    /// The owning worker disappeared and recovery gave up on the job.
    WorkerLost,
    /// Artifact or state storage kept failing after all retries.
    Storage,
}

impl JobErrorKind {
    pub const ALL: [JobErrorKind; 5] = [
        JobErrorKind::BackendTransient,
        JobErrorKind::BackendPermanent,
        JobErrorKind::Timeout,
        JobErrorKind::WorkerLost,
        JobErrorKind::Storage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobErrorKind::BackendTransient => "backend_transient",
            JobErrorKind::BackendPermanent => "backend_permanent",
            JobErrorKind::Timeout => "timeout",
            JobErrorKind::WorkerLost => "worker_lost",
            JobErrorKind::Storage => "storage",
        }
    }
}

impl fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobErrorKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CoreError::Validation(format!("Unknown job error kind: \"{s}\"")))
    }
}

/// Structured error recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// How a running job ended, as reported by its owning worker.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded(Vec<ArtifactRef>),
    Failed(JobError),
    Canceled,
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Succeeded(_) => JobStatus::Succeeded,
            JobOutcome::Failed(_) => JobStatus::Failed,
            JobOutcome::Canceled => JobStatus::Canceled,
        }
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "status")]
pub enum CancelOutcome {
    /// The job was still queued and is now `Canceled`.
    Canceled,
    /// The job is running; its worker will observe the flag.
    CancelRequested,
    /// Nothing to do.
    AlreadyTerminal(JobStatus),
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One compute request and its full lifecycle record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner_id: OwnerId,
    pub status: JobStatus,
    /// Opaque request body, stored and handed to the backend verbatim.
    #[serde(with = "payload_base64")]
    pub request_payload: Vec<u8>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub cancel_requested: bool,
    /// Number of times crash recovery returned this job to the queue.
    pub retry_count: u32,
    /// Number of backend submissions made across all claims.
    pub attempts: u32,
    pub result: Option<Vec<ArtifactRef>>,
    pub error: Option<JobError>,
    pub worker_owner: Option<WorkerId>,
    pub heartbeat_at: Option<Timestamp>,
    /// Handle of the in-flight backend task, if any.
    pub backend_task_id: Option<String>,
    /// Last reported progress fraction in `0.0..=1.0`.
    pub progress: f32,
}

impl Job {
    /// A freshly submitted job.
    pub fn new_queued(
        id: JobId,
        owner_id: OwnerId,
        request_payload: Vec<u8>,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            owner_id,
            status: JobStatus::Queued,
            request_payload,
            created_at: now,
            started_at: None,
            completed_at: None,
            cancel_requested: false,
            retry_count: 0,
            attempts: 0,
            result: None,
            error: None,
            worker_owner: None,
            heartbeat_at: None,
            backend_task_id: None,
            progress: 0.0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True when `worker_id` currently holds the claim on this job.
    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.status == JobStatus::Running && self.worker_owner.as_deref() == Some(worker_id)
    }

    /// Compare-and-set `Queued -> Running` for `worker_id`.
    ///
    /// Returns `false` (and leaves the job untouched) unless the job is
    /// `Queued`. This is the only mutual-exclusion primitive between
    /// workers.
    pub fn claim(&mut self, worker_id: &str, now: Timestamp) -> bool {
        if self.status != JobStatus::Queued {
            return false;
        }
        self.status = JobStatus::Running;
        self.worker_owner = Some(worker_id.to_string());
        self.heartbeat_at = Some(now);
        self.started_at.get_or_insert(now);
        true
    }

    /// Refresh the liveness timestamp. Returns the cancellation flag.
    pub fn heartbeat(&mut self, worker_id: &str, now: Timestamp) -> Result<bool, CoreError> {
        self.ensure_owner(worker_id)?;
        self.heartbeat_at = Some(now);
        Ok(self.cancel_requested)
    }

    /// Record the backend handle for the current attempt.
    pub fn record_backend_task(
        &mut self,
        worker_id: &str,
        task_id: &str,
        attempts: u32,
    ) -> Result<(), CoreError> {
        self.ensure_owner(worker_id)?;
        self.backend_task_id = Some(task_id.to_string());
        self.attempts = attempts;
        Ok(())
    }

    pub fn record_progress(&mut self, worker_id: &str, fraction: f32) -> Result<(), CoreError> {
        self.ensure_owner(worker_id)?;
        self.progress = fraction.clamp(0.0, 1.0);
        Ok(())
    }

    /// Move a running job owned by `worker_id` into its terminal state.
    pub fn complete(
        &mut self,
        worker_id: &str,
        outcome: JobOutcome,
        now: Timestamp,
    ) -> Result<(), CoreError> {
        self.ensure_owner(worker_id)?;
        let next = outcome.status();
        match outcome {
            JobOutcome::Succeeded(refs) => {
                self.result = Some(refs);
                self.progress = 1.0;
            }
            JobOutcome::Failed(err) => self.error = Some(err),
            JobOutcome::Canceled => {}
        }
        self.enter_terminal(next, now);
        Ok(())
    }

    /// Apply a cancel request according to the current status.
    pub fn request_cancel(&mut self, now: Timestamp) -> CancelOutcome {
        match self.status {
            JobStatus::Queued => {
                self.enter_terminal(JobStatus::Canceled, now);
                CancelOutcome::Canceled
            }
            JobStatus::Running => {
                self.cancel_requested = true;
                CancelOutcome::CancelRequested
            }
            terminal => CancelOutcome::AlreadyTerminal(terminal),
        }
    }

    /// True when the job is still running under exactly the owner and
    /// heartbeat observed by the recovery sweep.
    pub fn matches_claim(&self, owner: &str, heartbeat_at: Timestamp) -> bool {
        self.is_owned_by(owner) && self.heartbeat_at == Some(heartbeat_at)
    }

    /// Return an abandoned running job to the queue.
    ///
    /// A pending cancel request wins over the requeue: the job becomes
    /// `Canceled` instead, so `cancel_requested` never outlives the job.
    pub fn requeue(&mut self, now: Timestamp) -> Result<JobStatus, CoreError> {
        self.ensure_status(JobStatus::Running, JobStatus::Queued)?;
        if self.cancel_requested {
            self.enter_terminal(JobStatus::Canceled, now);
            return Ok(JobStatus::Canceled);
        }
        self.status = JobStatus::Queued;
        self.worker_owner = None;
        self.heartbeat_at = None;
        self.backend_task_id = None;
        self.retry_count += 1;
        Ok(JobStatus::Queued)
    }

    /// Fail an abandoned running job outright.
    pub fn fail_abandoned(&mut self, error: JobError, now: Timestamp) -> Result<(), CoreError> {
        self.ensure_status(JobStatus::Running, JobStatus::Failed)?;
        self.error = Some(error);
        self.enter_terminal(JobStatus::Failed, now);
        Ok(())
    }

    fn enter_terminal(&mut self, status: JobStatus, now: Timestamp) {
        self.status = status;
        self.completed_at = Some(now);
        self.worker_owner = None;
        self.heartbeat_at = None;
    }

    fn ensure_owner(&self, worker_id: &str) -> Result<(), CoreError> {
        if self.is_owned_by(worker_id) {
            Ok(())
        } else {
            Err(CoreError::OwnershipLost {
                job_id: self.id.clone(),
                worker_id: worker_id.to_string(),
            })
        }
    }

    fn ensure_status(&self, expected: JobStatus, next: JobStatus) -> Result<(), CoreError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition {
                job_id: self.id.clone(),
                from: self.status,
                to: next,
            })
        }
    }
}

/// Payloads travel through JSON (logs, debug endpoints) as standard base64.
mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
