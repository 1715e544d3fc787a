//! Crash recovery sweep.
//!
//! Finds running jobs whose worker went away (stale heartbeat, or an owner
//! no longer in the live-worker registry) and requeues or fails them per
//! [`RecoveryPolicy`]. Every write is a compare-and-set on the exact
//! `(owner, heartbeat_at)` observed, so a worker that heartbeats between the
//! scan and the write keeps its job.
//!
//! The sweep also re-enqueues queued jobs old enough that their queue
//! message may have been lost, skipping any job that still has a message
//! waiting or in flight. Duplicate messages are harmless: the claim CAS lets
//! exactly one worker run the job. Registry rows of workers that have been
//! silent for [`REGISTRY_RETENTION_FACTOR`] staleness periods are deleted.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use conductor_core::clock::{to_chrono, Clock};
use conductor_core::job::{Job, JobError, JobErrorKind, JobStatus};
use conductor_core::job_events::{MSG_JOB_CANCELED, MSG_JOB_REQUEUED};
use conductor_core::recovery::{is_stale, RecoveryAction, RecoveryPolicy};
use conductor_core::types::{Timestamp, WorkerId};
use conductor_db::{StoreError, Stores};
use conductor_events::{ProgressEvent, ProgressHub};
use conductor_pipeline::OrchestratorMetrics;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Registry rows silent for this many `stale_after` periods are pruned.
pub const REGISTRY_RETENTION_FACTOR: u32 = 10;

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub policy: RecoveryPolicy,
    /// A running job whose heartbeat is older than this is abandoned.
    pub stale_after: Duration,
    /// Queued jobs older than this get a fresh queue message.
    pub lost_message_after: Duration,
    pub interval: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            policy: RecoveryPolicy::default(),
            stale_after: Duration::from_secs(10),
            lost_message_after: Duration::from_secs(60),
            interval: Duration::from_secs(30),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub requeued: u32,
    pub failed: u32,
    /// Abandoned jobs that had a pending cancel and were canceled instead.
    pub canceled: u32,
    /// Abandoned-looking jobs left alone because the CAS lost.
    pub skipped: u32,
    /// Old queued jobs pushed to the queue again.
    pub reenqueued: u32,
    /// Registry rows of long-gone workers deleted.
    pub pruned_workers: u64,
}

pub struct RecoverySweep {
    stores: Stores,
    hub: ProgressHub,
    clock: Arc<dyn Clock>,
    metrics: OrchestratorMetrics,
    config: RecoveryConfig,
}

impl RecoverySweep {
    pub fn new(
        stores: Stores,
        hub: ProgressHub,
        clock: Arc<dyn Clock>,
        metrics: OrchestratorMetrics,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            stores,
            hub,
            clock,
            metrics,
            config,
        }
    }

    /// Run the sweep loop until `cancel` is triggered. The first pass runs
    /// immediately.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            policy = %self.config.policy,
            "Recovery sweep started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Recovery sweep stopping");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.run_once(self.clock.now()).await {
                        tracing::error!(error = %e, "Recovery sweep failed");
                    }
                }
            }
        }
    }

    /// One pass over running and long-queued jobs.
    pub async fn run_once(&self, now: Timestamp) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();
        let live = self
            .stores
            .workers
            .live_workers(now, self.config.stale_after)
            .await?;

        for job in self.stores.jobs.list_running().await? {
            if !self.is_abandoned(&job, &live, now) {
                continue;
            }
            let (Some(owner), Some(heartbeat_at)) = (job.worker_owner.clone(), job.heartbeat_at)
            else {
                tracing::warn!(job_id = %job.id, "Running job without owner or heartbeat, skipping");
                report.skipped += 1;
                continue;
            };

            match self.config.policy.decide(job.retry_count) {
                RecoveryAction::Requeue => {
                    self.requeue(&job, &owner, heartbeat_at, now, &mut report)
                        .await?
                }
                RecoveryAction::Fail => {
                    self.fail(&job, &owner, heartbeat_at, now, &mut report)
                        .await?
                }
            }
        }

        let cutoff = now - to_chrono(self.config.lost_message_after);
        for job in self.stores.jobs.list_queued_before(cutoff).await? {
            if self.stores.queue.contains(&job.id).await? {
                continue;
            }
            self.stores.queue.push(&job.id).await?;
            report.reenqueued += 1;
        }

        let forget_before = now - to_chrono(self.config.stale_after * REGISTRY_RETENTION_FACTOR);
        report.pruned_workers = self.stores.workers.prune(forget_before).await?;

        if report != SweepReport::default() {
            tracing::info!(
                requeued = report.requeued,
                failed = report.failed,
                canceled = report.canceled,
                skipped = report.skipped,
                reenqueued = report.reenqueued,
                pruned_workers = report.pruned_workers,
                "Recovery sweep finished",
            );
        } else {
            tracing::debug!("Recovery sweep: nothing to recover");
        }
        Ok(report)
    }

    fn is_abandoned(&self, job: &Job, live: &HashSet<WorkerId>, now: Timestamp) -> bool {
        let owner_gone = job
            .worker_owner
            .as_ref()
            .map_or(true, |owner| !live.contains(owner));
        owner_gone || is_stale(job.heartbeat_at, now, self.config.stale_after)
    }

    async fn requeue(
        &self,
        job: &Job,
        owner: &str,
        heartbeat_at: Timestamp,
        now: Timestamp,
        report: &mut SweepReport,
    ) -> Result<(), StoreError> {
        let status = self
            .stores
            .jobs
            .requeue_abandoned(&job.id, owner, heartbeat_at, now)
            .await?;
        match status {
            Some(JobStatus::Queued) => {
                // A failed push is repaired by the next sweep's queued scan.
                if let Err(e) = self.stores.queue.push(&job.id).await {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to enqueue requeued job");
                }
                self.metrics.recovery_requeued();
                tracing::warn!(
                    job_id = %job.id,
                    worker_id = owner,
                    retry_count = job.retry_count + 1,
                    "Requeued job from lost worker",
                );
                self.hub.publish(
                    ProgressEvent::new(job.id.clone(), JobStatus::Queued, now)
                        .with_message(MSG_JOB_REQUEUED),
                );
                report.requeued += 1;
            }
            Some(JobStatus::Canceled) => {
                self.metrics.job_canceled();
                tracing::info!(job_id = %job.id, worker_id = owner, "Canceled job from lost worker");
                self.hub.publish(
                    ProgressEvent::new(job.id.clone(), JobStatus::Canceled, now)
                        .with_message(MSG_JOB_CANCELED),
                );
                report.canceled += 1;
            }
            _ => report.skipped += 1,
        }
        Ok(())
    }

    async fn fail(
        &self,
        job: &Job,
        owner: &str,
        heartbeat_at: Timestamp,
        now: Timestamp,
        report: &mut SweepReport,
    ) -> Result<(), StoreError> {
        let error = JobError::new(
            JobErrorKind::WorkerLost,
            format!("worker {owner} stopped heartbeating"),
        );
        let message = error.to_string();
        let failed = self
            .stores
            .jobs
            .fail_abandoned(&job.id, owner, heartbeat_at, error, now)
            .await?;
        if !failed {
            report.skipped += 1;
            return Ok(());
        }

        self.metrics.recovery_failed();
        self.metrics.job_failed(JobErrorKind::WorkerLost);
        tracing::warn!(
            job_id = %job.id,
            worker_id = owner,
            retry_count = job.retry_count,
            "Failed job from lost worker",
        );
        self.hub.publish(ProgressEvent::new(job.id.clone(), JobStatus::Failed, now).with_message(message));
        report.failed += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use conductor_core::clock::ManualClock;
    use conductor_core::types::new_job_id;

    use super::*;

    struct Fixture {
        sweep: RecoverySweep,
        stores: Stores,
        clock: Arc<ManualClock>,
        metrics: OrchestratorMetrics,
    }

    fn fixture(policy: RecoveryPolicy) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let stores = Stores::in_memory(Duration::from_secs(60));
        let metrics = OrchestratorMetrics::new().unwrap();
        let config = RecoveryConfig {
            policy,
            stale_after: Duration::from_secs(10),
            lost_message_after: Duration::from_secs(60),
            interval: Duration::from_secs(30),
        };
        Fixture {
            sweep: RecoverySweep::new(
                stores.clone(),
                ProgressHub::default(),
                clock.clone(),
                metrics.clone(),
                config,
            ),
            stores,
            clock,
            metrics,
        }
    }

    async fn running(f: &Fixture, worker: &str) -> Job {
        let job = Job::new_queued(new_job_id(), "u1".into(), b"p".to_vec(), f.clock.now());
        f.stores.jobs.insert(&job).await.unwrap();
        f.stores.workers.beat(worker, f.clock.now()).await.unwrap();
        f.stores.jobs.claim(&job.id, worker, f.clock.now()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn fresh_heartbeat_is_left_alone() {
        let f = fixture(RecoveryPolicy::default());
        let job = running(&f, "w1").await;

        f.clock.advance(Duration::from_secs(10));
        let report = f.sweep.run_once(f.clock.now()).await.unwrap();

        assert_eq!(report, SweepReport::default());
        assert_eq!(f.stores.jobs.get(&job.id).await.unwrap().unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn stale_job_is_requeued_once_then_failed() {
        let f = fixture(RecoveryPolicy::default());
        let job = running(&f, "w1").await;

        f.clock.advance(Duration::from_secs(11));
        let report = f.sweep.run_once(f.clock.now()).await.unwrap();
        assert_eq!(report.requeued, 1);
        let saved = f.stores.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(saved.status, JobStatus::Queued);
        assert_eq!(saved.retry_count, 1);
        assert_eq!(f.stores.queue.depth().await.unwrap(), 1);

        f.stores.workers.beat("w2", f.clock.now()).await.unwrap();
        f.stores.jobs.claim(&job.id, "w2", f.clock.now()).await.unwrap().unwrap();
        f.clock.advance(Duration::from_secs(11));
        let report = f.sweep.run_once(f.clock.now()).await.unwrap();
        assert_eq!(report.failed, 1);

        let saved = f.stores.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(saved.status, JobStatus::Failed);
        assert_eq!(saved.error.map(|e| e.kind), Some(JobErrorKind::WorkerLost));
        assert_eq!(f.metrics.requeued_count(), 1.0);
        assert_eq!(f.metrics.recovery_failed_count(), 1.0);
    }

    #[tokio::test]
    async fn fail_policy_fails_immediately() {
        let f = fixture(RecoveryPolicy::Fail);
        let job = running(&f, "w1").await;

        f.clock.advance(Duration::from_secs(30));
        let report = f.sweep.run_once(f.clock.now()).await.unwrap();

        assert_eq!(report.failed, 1);
        let saved = f.stores.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(saved.status, JobStatus::Failed);
        assert!(saved.completed_at.is_some());
    }

    #[tokio::test]
    async fn unregistered_owner_is_abandoned_even_with_fresh_heartbeat() {
        let f = fixture(RecoveryPolicy::default());
        let job = running(&f, "w1").await;
        f.stores.workers.deregister("w1").await.unwrap();

        let report = f.sweep.run_once(f.clock.now()).await.unwrap();

        assert_eq!(report.requeued, 1);
        assert_eq!(f.stores.jobs.get(&job.id).await.unwrap().unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn pending_cancel_wins_over_requeue() {
        let f = fixture(RecoveryPolicy::default());
        let job = running(&f, "w1").await;
        f.stores.jobs.request_cancel(&job.id, f.clock.now()).await.unwrap();

        f.clock.advance(Duration::from_secs(11));
        let report = f.sweep.run_once(f.clock.now()).await.unwrap();

        assert_eq!(report.canceled, 1);
        assert_eq!(f.stores.jobs.get(&job.id).await.unwrap().unwrap().status, JobStatus::Canceled);
        assert_eq!(f.stores.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn old_queued_jobs_are_reenqueued() {
        let f = fixture(RecoveryPolicy::default());
        let job = Job::new_queued(new_job_id(), "u1".into(), b"p".to_vec(), f.clock.now());
        f.stores.jobs.insert(&job).await.unwrap();

        assert_eq!(f.sweep.run_once(f.clock.now()).await.unwrap().reenqueued, 0);
        f.clock.advance(Duration::from_secs(61));
        assert_eq!(f.sweep.run_once(f.clock.now()).await.unwrap().reenqueued, 1);
        assert_eq!(f.stores.queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn repeated_sweeps_do_not_grow_a_backlog() {
        let f = fixture(RecoveryPolicy::default());
        for _ in 0..5 {
            let job = Job::new_queued(new_job_id(), "u1".into(), b"p".to_vec(), f.clock.now());
            f.stores.jobs.insert(&job).await.unwrap();
            f.stores.queue.push(&job.id).await.unwrap();
        }

        f.clock.advance(Duration::from_secs(61));
        for _ in 0..5 {
            let report = f.sweep.run_once(f.clock.now()).await.unwrap();
            assert_eq!(report.reenqueued, 0);
            assert_eq!(f.stores.queue.depth().await.unwrap(), 5);
            f.clock.advance(Duration::from_secs(30));
        }
    }

    #[tokio::test]
    async fn requeued_job_is_not_pushed_twice() {
        let f = fixture(RecoveryPolicy::Requeue { max_requeues: 3 });
        running(&f, "w1").await;

        f.clock.advance(Duration::from_secs(61));
        let report = f.sweep.run_once(f.clock.now()).await.unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(report.reenqueued, 0);
        assert_eq!(f.stores.queue.depth().await.unwrap(), 1);

        f.clock.advance(Duration::from_secs(30));
        assert_eq!(f.sweep.run_once(f.clock.now()).await.unwrap().reenqueued, 0);
        assert_eq!(f.stores.queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn long_silent_workers_are_pruned_from_the_registry() {
        let f = fixture(RecoveryPolicy::default());
        f.stores.workers.beat("crashed", f.clock.now()).await.unwrap();

        f.clock.advance(Duration::from_secs(60));
        assert_eq!(f.sweep.run_once(f.clock.now()).await.unwrap().pruned_workers, 0);

        f.clock.advance(Duration::from_secs(41));
        f.stores.workers.beat("alive", f.clock.now()).await.unwrap();
        assert_eq!(f.sweep.run_once(f.clock.now()).await.unwrap().pruned_workers, 1);
        let everyone = f
            .stores
            .workers
            .live_workers(f.clock.now(), Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(everyone, HashSet::from(["alive".to_string()]));
    }
}
