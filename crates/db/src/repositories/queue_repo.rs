//! Repository for the `job_queue` table.
//!
//! Receiving a message sets its `visible_at` into the future and stamps a
//! fresh receipt, so concurrent receivers skip it (`FOR UPDATE SKIP
//! LOCKED`) until it is acked or the visibility timeout lapses.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::time::Instant;
use uuid::Uuid;

use super::PgStore;
use crate::error::StoreError;
use crate::models::queue::QueueRow;
use crate::store::{Delivery, WorkQueue};

pub struct QueueRepo;

impl QueueRepo {
    pub async fn push(pool: &PgPool, job_id: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO job_queue (job_id) VALUES ($1)")
            .bind(job_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Take the oldest visible message, if any, without waiting.
    pub async fn receive_now(
        pool: &PgPool,
        visibility_timeout: Duration,
    ) -> Result<Option<Delivery>, StoreError> {
        let row = sqlx::query_as::<_, QueueRow>(
            "UPDATE job_queue \
             SET visible_at = NOW() + make_interval(secs => $1), \
                 receipt = $2, \
                 delivery_count = delivery_count + 1 \
             WHERE id = ( \
                 SELECT id FROM job_queue \
                 WHERE visible_at <= NOW() \
                 ORDER BY id \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING job_id, receipt, delivery_count",
        )
        .bind(visibility_timeout.as_secs_f64())
        .bind(Uuid::new_v4())
        .fetch_optional(pool)
        .await?;
        Ok(row.map(Delivery::from))
    }

    pub async fn ack(pool: &PgPool, receipt: &str) -> Result<(), StoreError> {
        // A receipt we never issued cannot match a row.
        let Ok(receipt) = Uuid::parse_str(receipt) else {
            return Ok(());
        };
        sqlx::query("DELETE FROM job_queue WHERE receipt = $1")
            .bind(receipt)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn remove(pool: &PgPool, job_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM job_queue WHERE job_id = $1")
            .bind(job_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn contains(pool: &PgPool, job_id: &str) -> Result<bool, StoreError> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM job_queue WHERE job_id = $1)")
                .bind(job_id)
                .fetch_one(pool)
                .await?;
        Ok(exists)
    }

    pub async fn depth(pool: &PgPool) -> Result<u64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM job_queue WHERE visible_at <= NOW()")
                .fetch_one(pool)
                .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

#[async_trait]
impl WorkQueue for PgStore {
    async fn push(&self, job_id: &str) -> Result<(), StoreError> {
        QueueRepo::push(&self.pool, job_id).await
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, StoreError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(delivery) = QueueRepo::receive_now(&self.pool, self.visibility_timeout).await? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, receipt: &str) -> Result<(), StoreError> {
        QueueRepo::ack(&self.pool, receipt).await
    }

    async fn remove(&self, job_id: &str) -> Result<bool, StoreError> {
        QueueRepo::remove(&self.pool, job_id).await
    }

    async fn contains(&self, job_id: &str) -> Result<bool, StoreError> {
        QueueRepo::contains(&self.pool, job_id).await
    }

    async fn depth(&self) -> Result<u64, StoreError> {
        QueueRepo::depth(&self.pool).await
    }
}
