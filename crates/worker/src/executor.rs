//! Runs one claimed job against the compute backend.
//!
//! The executor owns the job from claim to terminal state. Every suspension
//! point (poll sleep, backoff sleep, backend call, artifact upload) is a
//! `select!` on the job's [`CancellationToken`] and deadline, and the
//! heartbeat is refreshed every poll interval throughout, so a slow backend
//! call never makes a live job look abandoned.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use conductor_backend::{ArtifactStore, Backoff, BackendClient, BackendError, BackendTaskId};
use conductor_core::clock::Clock;
use conductor_core::job::{ArtifactRef, Job, JobError, JobErrorKind, JobOutcome, JobStatus};
use conductor_core::job_events::{
    MSG_JOB_CANCELED, MSG_JOB_CLAIMED, MSG_JOB_PROGRESS, MSG_JOB_RETRYING, MSG_JOB_SUBMITTED,
    MSG_JOB_SUCCEEDED, MSG_JOB_UPLOADING,
};
use conductor_core::types::{Timestamp, WorkerId};
use conductor_db::Stores;
use conductor_events::{ProgressEvent, ProgressHub};
use conductor_pipeline::OrchestratorMetrics;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// How many times a terminal write is attempted before the job is left to
/// the recovery sweep.
const FINISH_ATTEMPTS: u32 = 3;

/// Everything a worker needs besides its own id.
#[derive(Clone)]
pub struct WorkerDeps {
    pub stores: Stores,
    pub backend: Arc<dyn BackendClient>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub hub: ProgressHub,
    pub clock: Arc<dyn Clock>,
    pub metrics: OrchestratorMetrics,
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Interval between backend polls and heartbeats.
    pub poll_interval: Duration,
    /// Overall deadline for one job, across all attempts.
    pub job_timeout: Duration,
    /// Hard timeout on every single backend call.
    pub backend_call_timeout: Duration,
    /// Extra backend attempts after a retryable failure.
    pub max_backend_retries: u32,
    pub backoff: Backoff,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(900),
            backend_call_timeout: Duration::from_secs(30),
            max_backend_retries: 1,
            backoff: Backoff::default(),
        }
    }
}

/// How a run ended from the worker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The job reached this terminal status.
    Finished(JobStatus),
    /// The worker let go of the job without a terminal write: the claim was
    /// lost or the pool shut down. Recovery decides what happens next.
    Abandoned,
}

/// Why execution stopped before the backend finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    CancelRequested,
    OwnershipLost,
    Shutdown,
    Deadline,
}

/// A failed attempt, classified for the retry decision.
#[derive(Debug)]
struct Failure {
    error: JobError,
    retryable: bool,
}

impl Failure {
    fn backend(err: BackendError) -> Self {
        let kind = match err {
            BackendError::Transient(_) => JobErrorKind::BackendTransient,
            BackendError::Permanent(_) => JobErrorKind::BackendPermanent,
            BackendError::Timeout(_) => JobErrorKind::Timeout,
        };
        Self {
            retryable: err.is_retryable(),
            error: JobError::new(kind, err.to_string()),
        }
    }

    fn storage(message: impl Into<String>) -> Self {
        Self {
            error: JobError::new(JobErrorKind::Storage, message),
            retryable: true,
        }
    }
}

enum AttemptError {
    Failed(Failure),
    Stopped(Stop),
}

impl From<Stop> for AttemptError {
    fn from(stop: Stop) -> Self {
        AttemptError::Stopped(stop)
    }
}

/// Per-run state.
struct Run<'a> {
    job: &'a Job,
    token: CancellationToken,
    deadline: Instant,
}

pub struct JobExecutor {
    worker_id: WorkerId,
    deps: WorkerDeps,
    config: ExecutorConfig,
}

impl JobExecutor {
    pub fn new(worker_id: impl Into<WorkerId>, deps: WorkerDeps, config: ExecutorConfig) -> Self {
        Self {
            worker_id: worker_id.into(),
            deps,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Execute a job this worker has just claimed.
    ///
    /// `shutdown` is the pool's abort token; the job's own token is a child
    /// of it and is also cancelled when the job's cancel flag is observed.
    pub async fn run(&self, job: Job, shutdown: &CancellationToken) -> Disposition {
        let metrics = &self.deps.metrics;
        metrics.job_started();
        if let Some(started_at) = job.started_at {
            metrics.observe_claim_latency(seconds_between(job.created_at, started_at));
        }
        tracing::info!(job_id = %job.id, worker_id = %self.worker_id, "Job claimed");
        self.publish(
            ProgressEvent::from_job(&job, self.deps.clock.now()).with_message(MSG_JOB_CLAIMED),
        );

        let run = Run {
            job: &job,
            token: shutdown.child_token(),
            deadline: Instant::now() + self.config.job_timeout,
        };

        let disposition = match self.execute(&run).await {
            Ok(outcome) => self.finish(&job, outcome).await,
            Err(Stop::CancelRequested) => self.finish(&job, JobOutcome::Canceled).await,
            Err(Stop::Deadline) => {
                let error = JobError::new(
                    JobErrorKind::Timeout,
                    format!("job exceeded its {}s deadline", self.config.job_timeout.as_secs()),
                );
                self.finish(&job, JobOutcome::Failed(error)).await
            }
            Err(Stop::OwnershipLost) => {
                tracing::warn!(job_id = %job.id, worker_id = %self.worker_id, "Lost claim on job, abandoning");
                Disposition::Abandoned
            }
            Err(Stop::Shutdown) => {
                tracing::warn!(job_id = %job.id, worker_id = %self.worker_id, "Shutdown interrupted job, leaving it to recovery");
                Disposition::Abandoned
            }
        };

        metrics.job_finished();
        disposition
    }

    /// All attempts. `Ok` carries the outcome to record.
    async fn execute(&self, run: &Run<'_>) -> Result<JobOutcome, Stop> {
        let max_attempts = 1 + self.config.max_backend_retries;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let failure = match self.attempt(run, attempt).await {
                Ok(refs) => return Ok(JobOutcome::Succeeded(refs)),
                Err(AttemptError::Stopped(stop)) => return Err(stop),
                Err(AttemptError::Failed(failure)) => failure,
            };

            if !failure.retryable || attempt >= max_attempts {
                tracing::warn!(
                    job_id = %run.job.id,
                    attempt,
                    error = %failure.error,
                    "Job failed",
                );
                return Ok(JobOutcome::Failed(failure.error));
            }

            let delay = self.config.backoff.delay_for(attempt);
            tracing::info!(
                job_id = %run.job.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure.error,
                "Retrying job after backend error",
            );
            self.deps.metrics.backend_retry();
            self.publish(
                ProgressEvent::new(run.job.id.clone(), JobStatus::Running, self.deps.clock.now())
                    .with_message(MSG_JOB_RETRYING),
            );
            self.pause(run, delay).await?;
        }
    }

    /// One backend submission, polled to completion.
    async fn attempt(&self, run: &Run<'_>, attempt: u32) -> Result<Vec<ArtifactRef>, AttemptError> {
        let job = run.job;
        let task_id = self
            .guarded(run, self.call(self.deps.backend.submit(&job.request_payload)))
            .await?
            .map_err(|e| AttemptError::Failed(Failure::backend(e)))?;
        tracing::debug!(job_id = %job.id, task_id = %task_id, attempt, "Submitted to backend");

        match self
            .deps
            .stores
            .jobs
            .record_backend_task(&job.id, &self.worker_id, &task_id, attempt)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_ownership_lost() => {
                self.cancel_backend(&task_id).await;
                return Err(Stop::OwnershipLost.into());
            }
            Err(e) => tracing::warn!(job_id = %job.id, error = %e, "Failed to record backend task"),
        }
        self.publish(
            ProgressEvent::new(job.id.clone(), JobStatus::Running, self.deps.clock.now())
                .with_message(MSG_JOB_SUBMITTED),
        );

        let outputs = loop {
            if let Err(stop) = self.pause(run, self.config.poll_interval).await {
                self.cancel_backend(&task_id).await;
                return Err(stop.into());
            }

            let poll = match self.guarded(run, self.call(self.deps.backend.poll(&task_id))).await {
                Ok(Ok(poll)) => poll,
                Ok(Err(e)) => {
                    self.cancel_backend(&task_id).await;
                    return Err(AttemptError::Failed(Failure::backend(e)));
                }
                Err(stop) => {
                    self.cancel_backend(&task_id).await;
                    return Err(stop.into());
                }
            };

            if !poll.done {
                if let Err(stop) = self.record_progress(run, poll.progress).await {
                    self.cancel_backend(&task_id).await;
                    return Err(stop.into());
                }
                continue;
            }
            match poll.error {
                Some(e) => return Err(AttemptError::Failed(Failure::backend(e))),
                None => break poll.outputs,
            }
        };

        self.publish(
            ProgressEvent::new(job.id.clone(), JobStatus::Running, self.deps.clock.now())
                .with_progress(1.0)
                .with_message(MSG_JOB_UPLOADING),
        );
        let mut refs = Vec::with_capacity(outputs.len());
        for output in outputs {
            let artifact = self
                .guarded(
                    run,
                    self.deps
                        .artifacts
                        .put(&job.id, output.bytes, &output.content_type),
                )
                .await?
                .map_err(|e| AttemptError::Failed(Failure::storage(e.to_string())))?;
            refs.push(artifact);
        }
        Ok(refs)
    }

    async fn record_progress(&self, run: &Run<'_>, progress: f32) -> Result<(), Stop> {
        match self
            .deps
            .stores
            .jobs
            .record_progress(&run.job.id, &self.worker_id, progress)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_ownership_lost() => return Err(Stop::OwnershipLost),
            Err(e) => tracing::warn!(job_id = %run.job.id, error = %e, "Failed to record progress"),
        }
        self.publish(
            ProgressEvent::new(run.job.id.clone(), JobStatus::Running, self.deps.clock.now())
                .with_progress(progress)
                .with_message(MSG_JOB_PROGRESS),
        );
        Ok(())
    }

    /// Wait `duration` in poll-interval steps, heartbeating after each step.
    async fn pause(&self, run: &Run<'_>, duration: Duration) -> Result<(), Stop> {
        let until = Instant::now() + duration;
        loop {
            let step_end = (Instant::now() + self.config.poll_interval)
                .min(until)
                .min(run.deadline);
            tokio::select! {
                _ = run.token.cancelled() => return Err(Stop::Shutdown),
                _ = tokio::time::sleep_until(step_end) => {}
            }
            if Instant::now() >= run.deadline {
                return Err(Stop::Deadline);
            }
            self.heartbeat(run).await?;
            if Instant::now() >= until {
                return Ok(());
            }
        }
    }

    /// Drive `fut` to completion, heartbeating every poll interval while it
    /// is in flight. `fut` is dropped if the job is stopped meanwhile.
    async fn guarded<T>(&self, run: &Run<'_>, fut: impl Future<Output = T>) -> Result<T, Stop> {
        tokio::pin!(fut);
        let period = self.config.poll_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                out = &mut fut => return Ok(out),
                _ = run.token.cancelled() => return Err(Stop::Shutdown),
                _ = tokio::time::sleep_until(run.deadline) => return Err(Stop::Deadline),
                _ = ticker.tick() => self.heartbeat(run).await?,
            }
        }
    }

    async fn heartbeat(&self, run: &Run<'_>) -> Result<(), Stop> {
        let result = self
            .deps
            .stores
            .jobs
            .heartbeat(&run.job.id, &self.worker_id, self.deps.clock.now())
            .await;
        match result {
            Ok(ack) if ack.cancel_requested => {
                tracing::info!(job_id = %run.job.id, "Cancel requested, stopping job");
                run.token.cancel();
                Err(Stop::CancelRequested)
            }
            Ok(_) => Ok(()),
            Err(e) if e.is_ownership_lost() => Err(Stop::OwnershipLost),
            Err(e) => {
                // A persistently failing store ends with the sweep taking
                // the job away, which surfaces as ownership lost.
                tracing::warn!(job_id = %run.job.id, error = %e, "Heartbeat failed");
                Ok(())
            }
        }
    }

    /// Record the terminal state, retrying transient store failures.
    async fn finish(&self, job: &Job, outcome: JobOutcome) -> Disposition {
        let mut attempt = 0;
        let saved = loop {
            attempt += 1;
            match self
                .deps
                .stores
                .jobs
                .complete(&job.id, &self.worker_id, outcome.clone(), self.deps.clock.now())
                .await
            {
                Ok(saved) => break saved,
                Err(e) if e.is_ownership_lost() => {
                    tracing::warn!(job_id = %job.id, "Lost claim before terminal write");
                    return Disposition::Abandoned;
                }
                Err(e) if attempt < FINISH_ATTEMPTS => {
                    tracing::warn!(job_id = %job.id, attempt, error = %e, "Terminal write failed, retrying");
                    tokio::time::sleep(self.config.backoff.delay_for(attempt)).await;
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "Terminal write failed, leaving job to recovery");
                    return Disposition::Abandoned;
                }
            }
        };

        self.record_terminal(&saved);
        Disposition::Finished(saved.status)
    }

    fn record_terminal(&self, job: &Job) {
        let metrics = &self.deps.metrics;
        let message = match (&job.status, &job.error) {
            (JobStatus::Succeeded, _) => {
                metrics.job_succeeded();
                MSG_JOB_SUCCEEDED.to_string()
            }
            (JobStatus::Canceled, _) => {
                metrics.job_canceled();
                MSG_JOB_CANCELED.to_string()
            }
            (_, Some(error)) => {
                metrics.job_failed(error.kind);
                error.to_string()
            }
            (status, None) => status.to_string(),
        };
        if let (Some(started), Some(completed)) = (job.started_at, job.completed_at) {
            metrics.observe_job_duration(seconds_between(started, completed));
        }
        tracing::info!(
            job_id = %job.id,
            worker_id = %self.worker_id,
            status = %job.status,
            attempts = job.attempts,
            "Job finished",
        );
        self.publish(ProgressEvent::from_job(job, self.deps.clock.now()).with_message(message));
    }

    /// Run one backend call under the hard call timeout.
    async fn call<T>(&self, fut: impl Future<Output = Result<T, BackendError>>) -> Result<T, BackendError> {
        match tokio::time::timeout(self.config.backend_call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(format!(
                "no answer within {}s",
                self.config.backend_call_timeout.as_secs()
            ))),
        }
    }

    async fn cancel_backend(&self, task_id: &BackendTaskId) {
        if let Err(e) = self.call(self.deps.backend.cancel(task_id)).await {
            tracing::warn!(task_id = %task_id, error = %e, "Backend cancel failed");
        }
    }

    fn publish(&self, event: ProgressEvent) {
        self.deps.hub.publish(event);
    }
}

fn seconds_between(from: Timestamp, to: Timestamp) -> f64 {
    (to - from).num_milliseconds().max(0) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use conductor_backend::fake::{Attempt, PollStep, ScriptedBackend};
    use conductor_backend::{BackendOutput, MemoryArtifactStore};
    use conductor_core::clock::ManualClock;
    use conductor_core::types::new_job_id;

    use super::*;

    struct Fixture {
        executor: JobExecutor,
        stores: Stores,
        backend: Arc<ScriptedBackend>,
        artifacts: Arc<MemoryArtifactStore>,
        metrics: OrchestratorMetrics,
        clock: Arc<ManualClock>,
    }

    fn fixture(backend: ScriptedBackend, max_backend_retries: u32) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let stores = Stores::in_memory(Duration::from_secs(60));
        let backend = Arc::new(backend);
        let artifacts = Arc::new(MemoryArtifactStore::new(Duration::from_secs(3600), dyn_clock.clone()));
        let metrics = OrchestratorMetrics::new().unwrap();
        let deps = WorkerDeps {
            stores: stores.clone(),
            backend: backend.clone(),
            artifacts: artifacts.clone(),
            hub: ProgressHub::default(),
            clock: dyn_clock,
            metrics: metrics.clone(),
        };
        let config = ExecutorConfig {
            poll_interval: Duration::from_millis(100),
            job_timeout: Duration::from_secs(10),
            backend_call_timeout: Duration::from_secs(1),
            max_backend_retries,
            backoff: Backoff::new(Duration::from_millis(50)),
        };
        Fixture {
            executor: JobExecutor::new("w1", deps, config),
            stores,
            backend,
            artifacts,
            metrics,
            clock,
        }
    }

    async fn claimed(f: &Fixture, payload: &[u8]) -> Job {
        let job = Job::new_queued(new_job_id(), "u1".into(), payload.to_vec(), f.clock.now());
        f.stores.jobs.insert(&job).await.unwrap();
        f.stores.jobs.claim(&job.id, "w1", f.clock.now()).await.unwrap().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn success_uploads_every_output() {
        let backend = ScriptedBackend::default();
        backend.script(
            b"two",
            [Attempt::succeed_after(
                0.4,
                vec![
                    BackendOutput::new(b"a".to_vec(), "image/png"),
                    BackendOutput::new(b"b".to_vec(), "image/png"),
                ],
            )],
        );
        let f = fixture(backend, 1);
        let job = claimed(&f, b"two").await;

        let disposition = f.executor.run(job.clone(), &CancellationToken::new()).await;

        assert_eq!(disposition, Disposition::Finished(JobStatus::Succeeded));
        let saved = f.stores.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(saved.result.as_ref().map(Vec::len), Some(2));
        assert!(saved.completed_at.is_some());
        assert_eq!(f.artifacts.len(), 2);
        assert_eq!(f.metrics.succeeded_count(), 1.0);
        assert_eq!(f.metrics.in_flight(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_fails_without_retry() {
        let backend = ScriptedBackend::new(Attempt::Reject(BackendError::Permanent("bad input".into())));
        let f = fixture(backend, 3);
        let job = claimed(&f, b"p").await;

        let disposition = f.executor.run(job.clone(), &CancellationToken::new()).await;

        assert_eq!(disposition, Disposition::Finished(JobStatus::Failed));
        assert_eq!(f.backend.submitted().len(), 1);
        let saved = f.stores.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(saved.error.map(|e| e.kind), Some(JobErrorKind::BackendPermanent));
        assert_eq!(f.metrics.failed_count(JobErrorKind::BackendPermanent), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_error_is_retried_then_succeeds() {
        let backend = ScriptedBackend::default();
        backend.script(
            b"p",
            [
                Attempt::Run(vec![PollStep::Error(BackendError::Transient("502".into()))]),
                Attempt::succeed_after(0.5, vec![BackendOutput::new(b"x".to_vec(), "text/plain")]),
            ],
        );
        let f = fixture(backend, 1);
        let job = claimed(&f, b"p").await;

        let disposition = f.executor.run(job.clone(), &CancellationToken::new()).await;

        assert_eq!(disposition, Disposition::Finished(JobStatus::Succeeded));
        assert_eq!(f.backend.submitted().len(), 2);
        assert_eq!(f.backend.canceled(), vec!["task-1".to_string()]);
        assert_eq!(f.metrics.backend_retry_count(), 1.0);
        assert_eq!(f.stores.jobs.get(&job.id).await.unwrap().unwrap().attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let backend = ScriptedBackend::new(Attempt::Reject(BackendError::Transient("busy".into())));
        let f = fixture(backend, 1);
        let job = claimed(&f, b"p").await;

        let disposition = f.executor.run(job.clone(), &CancellationToken::new()).await;

        assert_eq!(disposition, Disposition::Finished(JobStatus::Failed));
        assert_eq!(f.backend.submitted().len(), 2);
        let saved = f.stores.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(saved.error.map(|e| e.kind), Some(JobErrorKind::BackendTransient));
    }

    #[tokio::test(start_paused = true)]
    async fn storage_failure_is_transient_class() {
        let f = fixture(ScriptedBackend::default(), 1);
        f.artifacts.fail_next(2);
        let job = claimed(&f, b"p").await;

        let disposition = f.executor.run(job.clone(), &CancellationToken::new()).await;

        assert_eq!(disposition, Disposition::Finished(JobStatus::Failed));
        assert_eq!(f.backend.submitted().len(), 2);
        let saved = f.stores.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(saved.error.map(|e| e.kind), Some(JobErrorKind::Storage));
    }

    #[tokio::test(start_paused = true)]
    async fn job_deadline_fails_with_timeout() {
        let f = fixture(ScriptedBackend::new(Attempt::hang()), 0);
        let job = claimed(&f, b"p").await;

        let started = Instant::now();
        let disposition = f.executor.run(job.clone(), &CancellationToken::new()).await;

        assert_eq!(disposition, Disposition::Finished(JobStatus::Failed));
        assert!(Instant::now() - started <= Duration::from_secs(10) + Duration::from_millis(100));
        let saved = f.stores.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(saved.error.map(|e| e.kind), Some(JobErrorKind::Timeout));
        assert_eq!(f.backend.canceled().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_without_terminal_write() {
        let f = fixture(ScriptedBackend::new(Attempt::hang()), 0);
        let job = claimed(&f, b"p").await;
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let disposition = f.executor.run(job.clone(), &shutdown).await;

        assert_eq!(disposition, Disposition::Abandoned);
        let saved = f.stores.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(saved.status, JobStatus::Running);
        assert_eq!(f.metrics.in_flight(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_claim_is_abandoned_silently() {
        let f = fixture(ScriptedBackend::new(Attempt::hang()), 0);
        let job = claimed(&f, b"p").await;
        let hb = job.heartbeat_at.unwrap();
        f.stores
            .jobs
            .requeue_abandoned(&job.id, "w1", hb, f.clock.now())
            .await
            .unwrap();

        let disposition = f.executor.run(job.clone(), &CancellationToken::new()).await;

        assert_eq!(disposition, Disposition::Abandoned);
        let saved = f.stores.jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(saved.status, JobStatus::Queued);
    }
}
