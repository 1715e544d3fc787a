//! Repository for the `jobs` table.
//!
//! `claim` and `heartbeat` are single conditional `UPDATE`s. Every other
//! transition locks the row, applies the [`Job`] state machine in Rust and
//! writes the result back in the same transaction, so the SQL store cannot
//! drift from the in-memory one.

use async_trait::async_trait;
use conductor_core::error::CoreError;
use conductor_core::job::{CancelOutcome, Job, JobError, JobOutcome, JobStatus, StatusId};
use conductor_core::types::Timestamp;
use sqlx::{PgConnection, PgPool};

use super::{to_db_int, PgStore};
use crate::error::StoreError;
use crate::models::job::JobRow;
use crate::store::{HeartbeatAck, JobStore, StatusCounts};

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, owner_id, status_id, request_payload, \
    created_at, started_at, completed_at, \
    cancel_requested, retry_count, attempts, \
    result, error_kind, error_message, \
    worker_owner, heartbeat_at, backend_task_id, progress";

/// Provides state transitions for jobs.
pub struct JobRepo;

impl JobRepo {
    pub async fn insert(pool: &PgPool, job: &Job) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO jobs (id, owner_id, status_id, request_payload, created_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&job.id)
        .bind(&job.owner_id)
        .bind(job.status.id())
        .bind(&job.request_payload)
        .bind(job.created_at)
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate(job.id.clone()));
        }
        Ok(())
    }

    pub async fn find_by_id(pool: &PgPool, id: &str) -> Result<Option<Job>, StoreError> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    /// Compare-and-set `Queued -> Running`.
    pub async fn claim(
        pool: &PgPool,
        id: &str,
        worker_id: &str,
        now: Timestamp,
    ) -> Result<Option<Job>, StoreError> {
        let query = format!(
            "UPDATE jobs \
             SET status_id = $3, worker_owner = $2, heartbeat_at = $4, \
                 started_at = COALESCE(started_at, $4), updated_at = NOW() \
             WHERE id = $1 AND status_id = $5 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .bind(worker_id)
            .bind(JobStatus::Running.id())
            .bind(now)
            .bind(JobStatus::Queued.id())
            .fetch_optional(pool)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    pub async fn heartbeat(
        pool: &PgPool,
        id: &str,
        worker_id: &str,
        now: Timestamp,
    ) -> Result<HeartbeatAck, StoreError> {
        let row: Option<(bool,)> = sqlx::query_as(
            "UPDATE jobs SET heartbeat_at = $3, updated_at = NOW() \
             WHERE id = $1 AND worker_owner = $2 AND status_id = $4 \
             RETURNING cancel_requested",
        )
        .bind(id)
        .bind(worker_id)
        .bind(now)
        .bind(JobStatus::Running.id())
        .fetch_optional(pool)
        .await?;

        match row {
            Some((cancel_requested,)) => Ok(HeartbeatAck { cancel_requested }),
            None => Err(Self::not_owned(pool, id, worker_id).await),
        }
    }

    pub async fn record_backend_task(
        pool: &PgPool,
        id: &str,
        worker_id: &str,
        task_id: &str,
        attempts: u32,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET backend_task_id = $3, attempts = $4, updated_at = NOW() \
             WHERE id = $1 AND worker_owner = $2 AND status_id = $5",
        )
        .bind(id)
        .bind(worker_id)
        .bind(task_id)
        .bind(to_db_int(attempts))
        .bind(JobStatus::Running.id())
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Self::not_owned(pool, id, worker_id).await);
        }
        Ok(())
    }

    pub async fn record_progress(
        pool: &PgPool,
        id: &str,
        worker_id: &str,
        fraction: f32,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET progress = $3, updated_at = NOW() \
             WHERE id = $1 AND worker_owner = $2 AND status_id = $4",
        )
        .bind(id)
        .bind(worker_id)
        .bind(fraction.clamp(0.0, 1.0))
        .bind(JobStatus::Running.id())
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Self::not_owned(pool, id, worker_id).await);
        }
        Ok(())
    }

    pub async fn complete(
        pool: &PgPool,
        id: &str,
        worker_id: &str,
        outcome: JobOutcome,
        now: Timestamp,
    ) -> Result<Job, StoreError> {
        let mut tx = pool.begin().await?;
        let mut job = Self::lock(&mut *tx, id)
            .await?
            .ok_or_else(|| StoreError::JobNotFound(id.to_string()))?;
        job.complete(worker_id, outcome, now)?;
        Self::save(&mut *tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }

    pub async fn request_cancel(
        pool: &PgPool,
        id: &str,
        now: Timestamp,
    ) -> Result<CancelOutcome, StoreError> {
        let mut tx = pool.begin().await?;
        let mut job = Self::lock(&mut *tx, id)
            .await?
            .ok_or_else(|| StoreError::JobNotFound(id.to_string()))?;
        let outcome = job.request_cancel(now);
        if !matches!(outcome, CancelOutcome::AlreadyTerminal(_)) {
            Self::save(&mut *tx, &job).await?;
        }
        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn requeue_abandoned(
        pool: &PgPool,
        id: &str,
        owner: &str,
        heartbeat_at: Timestamp,
        now: Timestamp,
    ) -> Result<Option<JobStatus>, StoreError> {
        let mut tx = pool.begin().await?;
        let Some(mut job) = Self::lock(&mut *tx, id).await? else {
            return Ok(None);
        };
        if !job.matches_claim(owner, heartbeat_at) {
            return Ok(None);
        }
        let status = job.requeue(now)?;
        Self::save(&mut *tx, &job).await?;
        tx.commit().await?;
        Ok(Some(status))
    }

    pub async fn fail_abandoned(
        pool: &PgPool,
        id: &str,
        owner: &str,
        heartbeat_at: Timestamp,
        error: JobError,
        now: Timestamp,
    ) -> Result<bool, StoreError> {
        let mut tx = pool.begin().await?;
        let Some(mut job) = Self::lock(&mut *tx, id).await? else {
            return Ok(false);
        };
        if !job.matches_claim(owner, heartbeat_at) {
            return Ok(false);
        }
        job.fail_abandoned(error, now)?;
        Self::save(&mut *tx, &job).await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn list_by_status(pool: &PgPool, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE status_id = $1 ORDER BY created_at");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(status.id())
            .fetch_all(pool)
            .await?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }

    pub async fn list_queued_before(
        pool: &PgPool,
        cutoff: Timestamp,
    ) -> Result<Vec<Job>, StoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE status_id = $1 AND created_at < $2 \
               AND NOT EXISTS (SELECT 1 FROM job_queue q WHERE q.job_id = jobs.id) \
             ORDER BY created_at"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(JobStatus::Queued.id())
            .bind(cutoff)
            .fetch_all(pool)
            .await?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }

    pub async fn count_by_status(pool: &PgPool) -> Result<StatusCounts, StoreError> {
        let rows: Vec<(StatusId, i64)> =
            sqlx::query_as("SELECT status_id, COUNT(*) FROM jobs GROUP BY status_id")
                .fetch_all(pool)
                .await?;

        let mut counts = StatusCounts::default();
        for (status_id, count) in rows {
            let status = JobStatus::from_id(status_id)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown status_id {status_id}")))?;
            counts.0.insert(status, u64::try_from(count).unwrap_or(0));
        }
        Ok(counts)
    }

    /// Select a job row `FOR UPDATE` inside the caller's transaction.
    async fn lock(conn: &mut PgConnection, id: &str) -> Result<Option<Job>, StoreError> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(conn)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    /// Write every mutable column of `job` back.
    async fn save(conn: &mut PgConnection, job: &Job) -> Result<(), StoreError> {
        let result = job.result.as_ref().map(serde_json::to_value).transpose()?;
        sqlx::query(
            "UPDATE jobs SET \
                 status_id = $2, started_at = $3, completed_at = $4, \
                 cancel_requested = $5, retry_count = $6, attempts = $7, \
                 result = $8, error_kind = $9, error_message = $10, \
                 worker_owner = $11, heartbeat_at = $12, backend_task_id = $13, \
                 progress = $14, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(&job.id)
        .bind(job.status.id())
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.cancel_requested)
        .bind(to_db_int(job.retry_count))
        .bind(to_db_int(job.attempts))
        .bind(result)
        .bind(job.error.as_ref().map(|e| e.kind.as_str()))
        .bind(job.error.as_ref().map(|e| e.message.as_str()))
        .bind(&job.worker_owner)
        .bind(job.heartbeat_at)
        .bind(&job.backend_task_id)
        .bind(job.progress)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Explain why a worker-scoped update matched no row.
    async fn not_owned(pool: &PgPool, id: &str, worker_id: &str) -> StoreError {
        match Self::find_by_id(pool, id).await {
            Ok(Some(_)) => StoreError::Core(CoreError::OwnershipLost {
                job_id: id.to_string(),
                worker_id: worker_id.to_string(),
            }),
            Ok(None) => StoreError::JobNotFound(id.to_string()),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        JobRepo::insert(&self.pool, job).await
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        JobRepo::find_by_id(&self.pool, id).await
    }

    async fn claim(
        &self,
        id: &str,
        worker_id: &str,
        now: Timestamp,
    ) -> Result<Option<Job>, StoreError> {
        JobRepo::claim(&self.pool, id, worker_id, now).await
    }

    async fn heartbeat(
        &self,
        id: &str,
        worker_id: &str,
        now: Timestamp,
    ) -> Result<HeartbeatAck, StoreError> {
        JobRepo::heartbeat(&self.pool, id, worker_id, now).await
    }

    async fn record_backend_task(
        &self,
        id: &str,
        worker_id: &str,
        task_id: &str,
        attempts: u32,
    ) -> Result<(), StoreError> {
        JobRepo::record_backend_task(&self.pool, id, worker_id, task_id, attempts).await
    }

    async fn record_progress(
        &self,
        id: &str,
        worker_id: &str,
        fraction: f32,
    ) -> Result<(), StoreError> {
        JobRepo::record_progress(&self.pool, id, worker_id, fraction).await
    }

    async fn complete(
        &self,
        id: &str,
        worker_id: &str,
        outcome: JobOutcome,
        now: Timestamp,
    ) -> Result<Job, StoreError> {
        JobRepo::complete(&self.pool, id, worker_id, outcome, now).await
    }

    async fn request_cancel(&self, id: &str, now: Timestamp) -> Result<CancelOutcome, StoreError> {
        JobRepo::request_cancel(&self.pool, id, now).await
    }

    async fn requeue_abandoned(
        &self,
        id: &str,
        owner: &str,
        heartbeat_at: Timestamp,
        now: Timestamp,
    ) -> Result<Option<JobStatus>, StoreError> {
        JobRepo::requeue_abandoned(&self.pool, id, owner, heartbeat_at, now).await
    }

    async fn fail_abandoned(
        &self,
        id: &str,
        owner: &str,
        heartbeat_at: Timestamp,
        error: JobError,
        now: Timestamp,
    ) -> Result<bool, StoreError> {
        JobRepo::fail_abandoned(&self.pool, id, owner, heartbeat_at, error, now).await
    }

    async fn list_running(&self) -> Result<Vec<Job>, StoreError> {
        JobRepo::list_by_status(&self.pool, JobStatus::Running).await
    }

    async fn list_queued_before(&self, cutoff: Timestamp) -> Result<Vec<Job>, StoreError> {
        JobRepo::list_queued_before(&self.pool, cutoff).await
    }

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        JobRepo::count_by_status(&self.pool).await
    }
}
