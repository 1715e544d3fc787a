use std::collections::HashMap;

use async_trait::async_trait;
use conductor_core::error::CoreError;
use conductor_core::job::{CancelOutcome, Job, JobError, JobOutcome, JobStatus};
use conductor_core::types::{JobId, Timestamp};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::store::{HeartbeatAck, JobStore, StatusCounts};

/// In-memory Job State Store.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against an existing job under the lock.
    async fn with_job<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Job) -> Result<T, CoreError>,
    ) -> Result<T, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::JobNotFound(id.to_string()))?;
        Ok(f(job)?)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id.clone()));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.lock().await.get(id).cloned())
    }

    async fn claim(
        &self,
        id: &str,
        worker_id: &str,
        now: Timestamp,
    ) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.jobs.lock().await;
        Ok(jobs
            .get_mut(id)
            .and_then(|job| job.claim(worker_id, now).then(|| job.clone())))
    }

    async fn heartbeat(
        &self,
        id: &str,
        worker_id: &str,
        now: Timestamp,
    ) -> Result<HeartbeatAck, StoreError> {
        let cancel_requested = self.with_job(id, |job| job.heartbeat(worker_id, now)).await?;
        Ok(HeartbeatAck { cancel_requested })
    }

    async fn record_backend_task(
        &self,
        id: &str,
        worker_id: &str,
        task_id: &str,
        attempts: u32,
    ) -> Result<(), StoreError> {
        self.with_job(id, |job| job.record_backend_task(worker_id, task_id, attempts))
            .await
    }

    async fn record_progress(
        &self,
        id: &str,
        worker_id: &str,
        fraction: f32,
    ) -> Result<(), StoreError> {
        self.with_job(id, |job| job.record_progress(worker_id, fraction))
            .await
    }

    async fn complete(
        &self,
        id: &str,
        worker_id: &str,
        outcome: JobOutcome,
        now: Timestamp,
    ) -> Result<Job, StoreError> {
        self.with_job(id, |job| {
            job.complete(worker_id, outcome, now)?;
            Ok(job.clone())
        })
        .await
    }

    async fn request_cancel(&self, id: &str, now: Timestamp) -> Result<CancelOutcome, StoreError> {
        self.with_job(id, |job| Ok(job.request_cancel(now))).await
    }

    async fn requeue_abandoned(
        &self,
        id: &str,
        owner: &str,
        heartbeat_at: Timestamp,
        now: Timestamp,
    ) -> Result<Option<JobStatus>, StoreError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(id) {
            Some(job) if job.matches_claim(owner, heartbeat_at) => Ok(Some(job.requeue(now)?)),
            _ => Ok(None),
        }
    }

    async fn fail_abandoned(
        &self,
        id: &str,
        owner: &str,
        heartbeat_at: Timestamp,
        error: JobError,
        now: Timestamp,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(id) {
            Some(job) if job.matches_claim(owner, heartbeat_at) => {
                job.fail_abandoned(error, now)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_running(&self) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .values()
            .filter(|job| job.status == JobStatus::Running)
            .cloned()
            .collect())
    }

    async fn list_queued_before(&self, cutoff: Timestamp) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().await;
        let mut queued: Vec<Job> = jobs
            .values()
            .filter(|job| job.status == JobStatus::Queued && job.created_at < cutoff)
            .cloned()
            .collect();
        queued.sort_by_key(|job| job.created_at);
        Ok(queued)
    }

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        let jobs = self.jobs.lock().await;
        let mut counts = StatusCounts::default();
        for job in jobs.values() {
            *counts.0.entry(job.status).or_default() += 1;
        }
        Ok(counts)
    }
}
