//! Shared harness: in-memory stores, a manual clock, a scripted backend and
//! an in-memory artifact store wired the way the binary wires them.

use std::sync::Arc;
use std::time::Duration;

use conductor_backend::fake::ScriptedBackend;
use conductor_backend::quota::{TierQuotaProvider, TierTable};
use conductor_backend::{Backoff, MemoryArtifactStore};
use conductor_core::clock::{Clock, ManualClock};
use conductor_core::rate_limit::Quota;
use conductor_core::recovery::RecoveryPolicy;
use conductor_db::Stores;
use conductor_events::ProgressHub;
use conductor_pipeline::{OrchestratorMetrics, RateLimiter, SubmissionConfig, SubmissionService};
use conductor_worker::{ExecutorConfig, JobExecutor, PoolConfig, RecoveryConfig, RecoverySweep, WorkerDeps};

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const STALE_AFTER: Duration = Duration::from_secs(10);

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub stores: Stores,
    pub backend: Arc<ScriptedBackend>,
    pub artifacts: Arc<MemoryArtifactStore>,
    pub metrics: OrchestratorMetrics,
    pub deps: WorkerDeps,
    pub submission: SubmissionService,
}

pub fn harness(backend: ScriptedBackend) -> Harness {
    let clock = Arc::new(ManualClock::starting_now());
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let stores = Stores::in_memory(Duration::from_secs(60));
    let backend = Arc::new(backend);
    let artifacts = Arc::new(MemoryArtifactStore::new(Duration::from_secs(3600), dyn_clock.clone()));
    let metrics = OrchestratorMetrics::new().unwrap();
    let hub = ProgressHub::default();

    let limiter = RateLimiter::new(
        stores.rate_limits.clone(),
        Arc::new(TierQuotaProvider::new(TierTable::uniform(Quota::per_hour(1000)))),
        dyn_clock.clone(),
        metrics.clone(),
    );
    let submission = SubmissionService::new(
        stores.clone(),
        limiter,
        hub.clone(),
        dyn_clock.clone(),
        metrics.clone(),
        SubmissionConfig::default(),
    );

    let deps = WorkerDeps {
        stores: stores.clone(),
        backend: backend.clone(),
        artifacts: artifacts.clone(),
        hub,
        clock: dyn_clock,
        metrics: metrics.clone(),
    };

    Harness {
        clock,
        stores,
        backend,
        artifacts,
        metrics,
        deps,
        submission,
    }
}

pub fn executor_config() -> ExecutorConfig {
    ExecutorConfig {
        poll_interval: POLL_INTERVAL,
        job_timeout: Duration::from_secs(120),
        backend_call_timeout: Duration::from_secs(5),
        max_backend_retries: 1,
        backoff: Backoff::new(Duration::from_millis(200)),
    }
}

pub fn recovery_config() -> RecoveryConfig {
    RecoveryConfig {
        policy: RecoveryPolicy::default(),
        stale_after: STALE_AFTER,
        lost_message_after: Duration::from_secs(60),
        interval: Duration::from_secs(30),
    }
}

pub fn pool_config(concurrency: usize) -> PoolConfig {
    PoolConfig {
        concurrency,
        worker_id_prefix: "test".into(),
        queue_pop_timeout: Duration::from_millis(500),
        registry_interval: POLL_INTERVAL,
        drain_timeout: Duration::from_secs(5),
        executor: executor_config(),
        recovery: recovery_config(),
    }
}

impl Harness {
    pub fn executor(&self, worker_id: &str) -> JobExecutor {
        JobExecutor::new(worker_id, self.deps.clone(), executor_config())
    }

    pub fn sweep(&self) -> RecoverySweep {
        RecoverySweep::new(
            self.stores.clone(),
            self.deps.hub.clone(),
            self.deps.clock.clone(),
            self.metrics.clone(),
            recovery_config(),
        )
    }
}
