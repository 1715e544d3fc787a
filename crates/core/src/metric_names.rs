//! Canonical metric names for the orchestration layer.
//!
//! Shared by the metrics registry and by anything that scrapes or alerts on
//! the text exposition output.

pub const METRIC_JOBS_CREATED: &str = "conductor_jobs_created_total";

/// Submissions answered from an existing idempotency mapping.
pub const METRIC_JOBS_DEDUPLICATED: &str = "conductor_jobs_deduplicated_total";

pub const METRIC_JOBS_SUCCEEDED: &str = "conductor_jobs_succeeded_total";

/// Labelled by error `kind`.
pub const METRIC_JOBS_FAILED: &str = "conductor_jobs_failed_total";

pub const METRIC_JOBS_CANCELED: &str = "conductor_jobs_canceled_total";

pub const METRIC_RATE_LIMITED: &str = "conductor_rate_limited_total";

pub const METRIC_QUEUE_DEPTH: &str = "conductor_queue_depth";

pub const METRIC_JOBS_IN_FLIGHT: &str = "conductor_jobs_in_flight";

/// Seconds from job creation to successful claim.
pub const METRIC_CLAIM_LATENCY: &str = "conductor_claim_latency_seconds";

/// Seconds from claim to terminal state.
pub const METRIC_JOB_DURATION: &str = "conductor_job_duration_seconds";

pub const METRIC_RECOVERY_REQUEUED: &str = "conductor_recovery_requeued_total";

pub const METRIC_RECOVERY_FAILED: &str = "conductor_recovery_failed_total";

pub const METRIC_BACKEND_RETRIES: &str = "conductor_backend_retries_total";
