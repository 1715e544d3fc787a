//! Repository for the `idempotency_keys` table.

use async_trait::async_trait;
use conductor_core::error::CoreError;
use conductor_core::idempotency::{IdempotencyRecord, Reservation};
use conductor_core::types::Timestamp;
use sqlx::PgPool;

use super::PgStore;
use crate::error::StoreError;
use crate::store::IdempotencyStore;

/// A reserve can race with an expiring or released row; retry this often.
const MAX_RESERVE_ATTEMPTS: usize = 3;

pub struct IdempotencyRepo;

impl IdempotencyRepo {
    /// Insert the mapping, or take over an expired one.
    ///
    /// The upsert only overwrites rows whose `expires_at` has passed, so two
    /// concurrent reserves for a live key cannot both succeed.
    pub async fn reserve(
        pool: &PgPool,
        record: &IdempotencyRecord,
        now: Timestamp,
    ) -> Result<Reservation, StoreError> {
        for _ in 0..MAX_RESERVE_ATTEMPTS {
            let inserted: Option<(String,)> = sqlx::query_as(
                "INSERT INTO idempotency_keys (owner_id, client_key, job_id, created_at, expires_at) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (owner_id, client_key) DO UPDATE \
                 SET job_id = EXCLUDED.job_id, \
                     created_at = EXCLUDED.created_at, \
                     expires_at = EXCLUDED.expires_at \
                 WHERE idempotency_keys.expires_at <= $6 \
                 RETURNING job_id",
            )
            .bind(&record.owner_id)
            .bind(&record.client_key)
            .bind(&record.job_id)
            .bind(record.created_at)
            .bind(record.expires_at)
            .bind(now)
            .fetch_optional(pool)
            .await?;

            if inserted.is_some() {
                return Ok(Reservation::Reserved);
            }

            let existing: Option<(String,)> = sqlx::query_as(
                "SELECT job_id FROM idempotency_keys \
                 WHERE owner_id = $1 AND client_key = $2 AND expires_at > $3",
            )
            .bind(&record.owner_id)
            .bind(&record.client_key)
            .bind(now)
            .fetch_optional(pool)
            .await?;

            if let Some((job_id,)) = existing {
                return Ok(Reservation::Existing(job_id));
            }
        }

        Err(StoreError::Core(CoreError::Internal(format!(
            "idempotency key {} for owner {} kept changing during reserve",
            record.client_key, record.owner_id
        ))))
    }

    pub async fn release(
        pool: &PgPool,
        owner_id: &str,
        client_key: &str,
        job_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM idempotency_keys \
             WHERE owner_id = $1 AND client_key = $2 AND job_id = $3",
        )
        .bind(owner_id)
        .bind(client_key)
        .bind(job_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn purge_expired(pool: &PgPool, now: Timestamp) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= $1")
            .bind(now)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl IdempotencyStore for PgStore {
    async fn reserve(
        &self,
        record: IdempotencyRecord,
        now: Timestamp,
    ) -> Result<Reservation, StoreError> {
        IdempotencyRepo::reserve(&self.pool, &record, now).await
    }

    async fn release(
        &self,
        owner_id: &str,
        client_key: &str,
        job_id: &str,
    ) -> Result<(), StoreError> {
        IdempotencyRepo::release(&self.pool, owner_id, client_key, job_id).await
    }

    async fn purge_expired(&self, now: Timestamp) -> Result<u64, StoreError> {
        IdempotencyRepo::purge_expired(&self.pool, now).await
    }
}
