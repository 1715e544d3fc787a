//! Bounded worker pool.
//!
//! Each worker unit loops: receive from the queue (bounded wait) -> claim
//! CAS -> ack -> execute. The claim is the only mutual exclusion; a message
//! for a job that is no longer `Queued` is acked and dropped.
//!
//! Shutdown happens in three steps: workers stop receiving, in-flight jobs
//! get `drain_timeout` to finish, then their tokens are cancelled and the
//! jobs are left running for recovery to pick up.

use std::time::Duration;

use conductor_core::types::WorkerId;
use conductor_db::{Delivery, StoreError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::executor::{ExecutorConfig, JobExecutor, WorkerDeps};
use crate::recovery::{RecoveryConfig, RecoverySweep};

/// Grace period for tasks after their token has been cancelled.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub concurrency: usize,
    pub worker_id_prefix: String,
    /// Longest a single queue receive blocks.
    pub queue_pop_timeout: Duration,
    /// How often worker units are re-announced in the registry.
    pub registry_interval: Duration,
    pub drain_timeout: Duration,
    pub executor: ExecutorConfig,
    pub recovery: RecoveryConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            worker_id_prefix: "worker".into(),
            queue_pop_timeout: Duration::from_secs(1),
            registry_interval: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(30),
            executor: ExecutorConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

pub struct WorkerPool {
    worker_ids: Vec<WorkerId>,
    /// Workers stop taking new jobs.
    stop_receiving: CancellationToken,
    /// In-flight jobs are interrupted.
    abort: CancellationToken,
    /// Registry heartbeat and recovery sweep.
    background: CancellationToken,
    workers: JoinSet<()>,
    background_tasks: JoinSet<()>,
    drain_timeout: Duration,
}

impl WorkerPool {
    /// Register the worker units and spawn them with the registry heartbeat
    /// and the recovery sweep. The first sweep runs right away.
    pub async fn start(deps: WorkerDeps, config: PoolConfig) -> Result<Self, StoreError> {
        let process_id = Uuid::new_v4().simple().to_string();
        let worker_ids: Vec<WorkerId> = (1..=config.concurrency)
            .map(|n| format!("{}-{n}-{process_id}", config.worker_id_prefix))
            .collect();

        let now = deps.clock.now();
        for id in &worker_ids {
            deps.stores.workers.beat(id, now).await?;
        }

        let stop_receiving = CancellationToken::new();
        let abort = CancellationToken::new();
        let background = CancellationToken::new();

        let mut background_tasks = JoinSet::new();
        background_tasks.spawn(registry_loop(
            deps.clone(),
            worker_ids.clone(),
            config.registry_interval,
            background.clone(),
        ));
        let sweep = RecoverySweep::new(
            deps.stores.clone(),
            deps.hub.clone(),
            deps.clock.clone(),
            deps.metrics.clone(),
            config.recovery.clone(),
        );
        background_tasks.spawn(sweep.run(background.clone()));

        let mut workers = JoinSet::new();
        for id in &worker_ids {
            let executor = JobExecutor::new(id.clone(), deps.clone(), config.executor.clone());
            workers.spawn(worker_loop(
                executor,
                deps.clone(),
                config.queue_pop_timeout,
                stop_receiving.clone(),
                abort.clone(),
            ));
        }

        tracing::info!(
            concurrency = config.concurrency,
            prefix = %config.worker_id_prefix,
            "Worker pool started",
        );

        Ok(Self {
            worker_ids,
            stop_receiving,
            abort,
            background,
            workers,
            background_tasks,
            drain_timeout: config.drain_timeout,
        })
    }

    pub fn worker_ids(&self) -> &[WorkerId] {
        &self.worker_ids
    }

    /// Stop receiving, drain in-flight jobs, then stop background tasks.
    pub async fn shutdown(mut self) {
        tracing::info!(drain_timeout_secs = self.drain_timeout.as_secs(), "Worker pool draining");
        self.stop_receiving.cancel();

        let drained = tokio::time::timeout(self.drain_timeout, join_all(&mut self.workers)).await;
        if drained.is_err() {
            tracing::warn!(
                remaining = self.workers.len(),
                "Drain timeout elapsed, interrupting in-flight jobs",
            );
            self.abort.cancel();
            if tokio::time::timeout(STOP_GRACE, join_all(&mut self.workers))
                .await
                .is_err()
            {
                self.workers.abort_all();
            }
        }

        self.background.cancel();
        if tokio::time::timeout(STOP_GRACE, join_all(&mut self.background_tasks))
            .await
            .is_err()
        {
            self.background_tasks.abort_all();
        }
        tracing::info!("Worker pool stopped");
    }
}

async fn join_all(set: &mut JoinSet<()>) {
    while let Some(result) = set.join_next().await {
        if let Err(e) = result {
            if e.is_panic() {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
    }
}

async fn worker_loop(
    executor: JobExecutor,
    deps: WorkerDeps,
    pop_timeout: Duration,
    stop_receiving: CancellationToken,
    abort: CancellationToken,
) {
    let worker_id = executor.worker_id().to_string();
    tracing::debug!(worker_id = %worker_id, "Worker started");

    loop {
        let received = tokio::select! {
            _ = stop_receiving.cancelled() => break,
            received = deps.stores.queue.receive(pop_timeout) => received,
        };

        let delivery = match received {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(e) => {
                tracing::error!(worker_id = %worker_id, error = %e, "Queue receive failed");
                tokio::select! {
                    _ = stop_receiving.cancelled() => break,
                    _ = tokio::time::sleep(pop_timeout) => {}
                }
                continue;
            }
        };

        handle_delivery(&executor, &deps, delivery, &abort).await;
    }

    tracing::debug!(worker_id = %worker_id, "Worker stopped");
}

async fn handle_delivery(
    executor: &JobExecutor,
    deps: &WorkerDeps,
    delivery: Delivery,
    abort: &CancellationToken,
) {
    let worker_id = executor.worker_id();
    let claimed = deps
        .stores
        .jobs
        .claim(&delivery.job_id, worker_id, deps.clock.now())
        .await;

    let job = match claimed {
        Ok(job) => job,
        Err(e) => {
            // Not acked: the message becomes visible again after its
            // visibility timeout.
            tracing::error!(job_id = %delivery.job_id, worker_id, error = %e, "Claim failed");
            return;
        }
    };

    if let Err(e) = deps.stores.queue.ack(&delivery.receipt).await {
        tracing::warn!(job_id = %delivery.job_id, error = %e, "Queue ack failed");
    }

    match job {
        Some(job) => {
            executor.run(job, abort).await;
        }
        None => tracing::debug!(
            job_id = %delivery.job_id,
            worker_id,
            delivery_count = delivery.delivery_count,
            "Job no longer queued, dropping message",
        ),
    }
}

/// Keep the worker units visible in the registry and refresh the queue
/// depth gauge. Deregisters the units on exit.
async fn registry_loop(
    deps: WorkerDeps,
    worker_ids: Vec<WorkerId>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let now = deps.clock.now();
                for id in &worker_ids {
                    if let Err(e) = deps.stores.workers.beat(id, now).await {
                        tracing::warn!(worker_id = %id, error = %e, "Registry heartbeat failed");
                    }
                }
                match deps.stores.queue.depth().await {
                    Ok(depth) => deps.metrics.set_queue_depth(depth),
                    Err(e) => tracing::debug!(error = %e, "Queue depth refresh failed"),
                }
            }
        }
    }

    for id in &worker_ids {
        if let Err(e) = deps.stores.workers.deregister(id).await {
            tracing::warn!(worker_id = %id, error = %e, "Deregister failed");
        }
    }
}
