//! Repository for the `workers` table (live-worker registry).

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use conductor_core::clock::to_chrono;
use conductor_core::types::{Timestamp, WorkerId};
use sqlx::PgPool;

use super::PgStore;
use crate::error::StoreError;
use crate::store::WorkerRegistry;

pub struct WorkerRepo;

impl WorkerRepo {
    pub async fn beat(pool: &PgPool, worker_id: &str, now: Timestamp) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO workers (worker_id, last_seen_at) VALUES ($1, $2) \
             ON CONFLICT (worker_id) DO UPDATE SET last_seen_at = EXCLUDED.last_seen_at",
        )
        .bind(worker_id)
        .bind(now)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn deregister(pool: &PgPool, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM workers WHERE worker_id = $1")
            .bind(worker_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn seen_since(
        pool: &PgPool,
        cutoff: Timestamp,
    ) -> Result<HashSet<WorkerId>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT worker_id FROM workers WHERE last_seen_at >= $1")
                .bind(cutoff)
                .fetch_all(pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn delete_seen_before(pool: &PgPool, cutoff: Timestamp) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM workers WHERE last_seen_at < $1")
            .bind(cutoff)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl WorkerRegistry for PgStore {
    async fn beat(&self, worker_id: &str, now: Timestamp) -> Result<(), StoreError> {
        WorkerRepo::beat(&self.pool, worker_id, now).await
    }

    async fn deregister(&self, worker_id: &str) -> Result<(), StoreError> {
        WorkerRepo::deregister(&self.pool, worker_id).await
    }

    async fn live_workers(
        &self,
        now: Timestamp,
        stale_after: Duration,
    ) -> Result<HashSet<WorkerId>, StoreError> {
        let cutoff = now
            .checked_sub_signed(to_chrono(stale_after))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        WorkerRepo::seen_since(&self.pool, cutoff).await
    }

    async fn prune(&self, cutoff: Timestamp) -> Result<u64, StoreError> {
        WorkerRepo::delete_seen_before(&self.pool, cutoff).await
    }
}
