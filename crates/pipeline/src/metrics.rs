//! Prometheus metrics for the orchestration layer.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `conductor_jobs_created_total` | Counter | |
//! | `conductor_jobs_deduplicated_total` | Counter | |
//! | `conductor_jobs_succeeded_total` | Counter | |
//! | `conductor_jobs_failed_total` | Counter | `kind` |
//! | `conductor_jobs_canceled_total` | Counter | |
//! | `conductor_rate_limited_total` | Counter | |
//! | `conductor_queue_depth` | Gauge | |
//! | `conductor_jobs_in_flight` | Gauge | |
//! | `conductor_claim_latency_seconds` | Histogram | |
//! | `conductor_job_duration_seconds` | Histogram | |
//! | `conductor_recovery_requeued_total` | Counter | |
//! | `conductor_recovery_failed_total` | Counter | |
//! | `conductor_backend_retries_total` | Counter | |

use conductor_core::job::JobErrorKind;
use conductor_core::metric_names::*;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

/// Buckets for claim latency (seconds): sub-second pickup up to a backlog
/// of several minutes.
pub const CLAIM_LATENCY_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0];

/// Buckets for job duration (seconds).
pub const JOB_DURATION_BUCKETS: &[f64] = &[1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 900.0];

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// All orchestration metrics, registered on one [`Registry`].
///
/// Cheap to clone; clones share the underlying collectors.
#[derive(Clone)]
pub struct OrchestratorMetrics {
    registry: Registry,
    jobs_created: Counter,
    jobs_deduplicated: Counter,
    jobs_succeeded: Counter,
    jobs_failed: CounterVec,
    jobs_canceled: Counter,
    rate_limited: Counter,
    queue_depth: Gauge,
    jobs_in_flight: Gauge,
    claim_latency: Histogram,
    job_duration: Histogram,
    recovery_requeued: Counter,
    recovery_failed: Counter,
    backend_retries: Counter,
}

impl OrchestratorMetrics {
    /// Create the metrics on a fresh registry.
    pub fn new() -> Result<Self, MetricsError> {
        Self::with_registry(Registry::new())
    }

    pub fn with_registry(registry: Registry) -> Result<Self, MetricsError> {
        let jobs_created = counter(&registry, METRIC_JOBS_CREATED, "Jobs accepted by submit")?;
        let jobs_deduplicated = counter(
            &registry,
            METRIC_JOBS_DEDUPLICATED,
            "Submissions answered from an existing idempotency mapping",
        )?;
        let jobs_succeeded = counter(&registry, METRIC_JOBS_SUCCEEDED, "Jobs that succeeded")?;

        let jobs_failed = CounterVec::new(
            Opts::new(METRIC_JOBS_FAILED, "Jobs that failed, by error kind"),
            &["kind"],
        )?;
        registry.register(Box::new(jobs_failed.clone()))?;

        let jobs_canceled = counter(&registry, METRIC_JOBS_CANCELED, "Jobs that were canceled")?;
        let rate_limited = counter(&registry, METRIC_RATE_LIMITED, "Submissions denied by the rate limiter")?;

        let queue_depth = Gauge::with_opts(Opts::new(METRIC_QUEUE_DEPTH, "Messages waiting in the work queue"))?;
        registry.register(Box::new(queue_depth.clone()))?;

        let jobs_in_flight = Gauge::with_opts(Opts::new(
            METRIC_JOBS_IN_FLIGHT,
            "Jobs currently executing on this process",
        ))?;
        registry.register(Box::new(jobs_in_flight.clone()))?;

        let claim_latency = Histogram::with_opts(
            HistogramOpts::new(METRIC_CLAIM_LATENCY, "Seconds from job creation to claim")
                .buckets(CLAIM_LATENCY_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(claim_latency.clone()))?;

        let job_duration = Histogram::with_opts(
            HistogramOpts::new(METRIC_JOB_DURATION, "Seconds from claim to terminal state")
                .buckets(JOB_DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(job_duration.clone()))?;

        let recovery_requeued = counter(
            &registry,
            METRIC_RECOVERY_REQUEUED,
            "Abandoned jobs returned to the queue by the recovery sweep",
        )?;
        let recovery_failed = counter(
            &registry,
            METRIC_RECOVERY_FAILED,
            "Abandoned jobs failed by the recovery sweep",
        )?;
        let backend_retries = counter(
            &registry,
            METRIC_BACKEND_RETRIES,
            "Backend attempts retried after a transient error",
        )?;

        Ok(Self {
            registry,
            jobs_created,
            jobs_deduplicated,
            jobs_succeeded,
            jobs_failed,
            jobs_canceled,
            rate_limited,
            queue_depth,
            jobs_in_flight,
            claim_latency,
            job_duration,
            recovery_requeued,
            recovery_failed,
            backend_retries,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }

    // ---- submission ----

    pub fn job_created(&self) {
        self.jobs_created.inc();
    }

    pub fn job_deduplicated(&self) {
        self.jobs_deduplicated.inc();
    }

    pub fn rate_limited(&self) {
        self.rate_limited.inc();
    }

    // ---- terminal outcomes ----

    pub fn job_succeeded(&self) {
        self.jobs_succeeded.inc();
    }

    pub fn job_failed(&self, kind: JobErrorKind) {
        self.jobs_failed.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn job_canceled(&self) {
        self.jobs_canceled.inc();
    }

    // ---- execution ----

    pub fn set_queue_depth(&self, depth: u64) {
        self.queue_depth.set(depth as f64);
    }

    pub fn job_started(&self) {
        self.jobs_in_flight.inc();
    }

    pub fn job_finished(&self) {
        self.jobs_in_flight.dec();
    }

    pub fn observe_claim_latency(&self, seconds: f64) {
        self.claim_latency.observe(seconds.max(0.0));
    }

    pub fn observe_job_duration(&self, seconds: f64) {
        self.job_duration.observe(seconds.max(0.0));
    }

    pub fn backend_retry(&self) {
        self.backend_retries.inc();
    }

    // ---- recovery ----

    pub fn recovery_requeued(&self) {
        self.recovery_requeued.inc();
    }

    pub fn recovery_failed(&self) {
        self.recovery_failed.inc();
    }

    // ---- readers, mostly for tests ----

    pub fn created_count(&self) -> f64 {
        self.jobs_created.get()
    }

    pub fn deduplicated_count(&self) -> f64 {
        self.jobs_deduplicated.get()
    }

    pub fn succeeded_count(&self) -> f64 {
        self.jobs_succeeded.get()
    }

    pub fn failed_count(&self, kind: JobErrorKind) -> f64 {
        self.jobs_failed.with_label_values(&[kind.as_str()]).get()
    }

    pub fn canceled_count(&self) -> f64 {
        self.jobs_canceled.get()
    }

    pub fn rate_limited_count(&self) -> f64 {
        self.rate_limited.get()
    }

    pub fn in_flight(&self) -> f64 {
        self.jobs_in_flight.get()
    }

    pub fn requeued_count(&self) -> f64 {
        self.recovery_requeued.get()
    }

    pub fn recovery_failed_count(&self) -> f64 {
        self.recovery_failed.get()
    }

    pub fn backend_retry_count(&self) -> f64 {
        self.backend_retries.get()
    }
}

impl std::fmt::Debug for OrchestratorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorMetrics").finish_non_exhaustive()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter, MetricsError> {
    let counter = Counter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}
