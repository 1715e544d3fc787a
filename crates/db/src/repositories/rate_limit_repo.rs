//! Repository for the `rate_limit_counters` table.

use async_trait::async_trait;
use conductor_core::rate_limit::{Quota, RateDecision, RateLimitCounter};
use conductor_core::types::Timestamp;
use sqlx::{PgConnection, PgPool};

use super::{to_db_int, PgStore};
use crate::error::StoreError;
use crate::models::rate_limit::RateLimitRow;
use crate::store::RateLimitStore;

const COLUMNS: &str = "owner_id, capacity, refill_period_ms, tokens_available, last_refill_at";

pub struct RateLimitRepo;

impl RateLimitRepo {
    /// Refill and decrement under a row lock so concurrent submitters for
    /// the same owner serialize on the bucket.
    pub async fn try_acquire(
        pool: &PgPool,
        owner_id: &str,
        quota: Quota,
        cost: u32,
        now: Timestamp,
    ) -> Result<RateDecision, StoreError> {
        let mut tx = pool.begin().await?;

        let fresh = RateLimitCounter::new(owner_id, quota, now);
        sqlx::query(
            "INSERT INTO rate_limit_counters (owner_id, capacity, refill_period_ms, tokens_available, last_refill_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (owner_id) DO NOTHING",
        )
        .bind(&fresh.owner_id)
        .bind(to_db_int(fresh.capacity))
        .bind(period_ms(&fresh))
        .bind(fresh.tokens_available)
        .bind(fresh.last_refill_at)
        .execute(&mut *tx)
        .await?;

        let query = format!("SELECT {COLUMNS} FROM rate_limit_counters WHERE owner_id = $1 FOR UPDATE");
        let row = sqlx::query_as::<_, RateLimitRow>(&query)
            .bind(owner_id)
            .fetch_one(&mut *tx)
            .await?;

        let mut bucket = RateLimitCounter::from(row);
        bucket.apply_quota(quota, now);
        let decision = bucket.try_take(cost, now);
        Self::save(&mut *tx, &bucket).await?;
        tx.commit().await?;

        Ok(decision)
    }

    pub async fn peek(
        pool: &PgPool,
        owner_id: &str,
        quota: Quota,
        now: Timestamp,
    ) -> Result<RateDecision, StoreError> {
        let query = format!("SELECT {COLUMNS} FROM rate_limit_counters WHERE owner_id = $1");
        let mut bucket = sqlx::query_as::<_, RateLimitRow>(&query)
            .bind(owner_id)
            .fetch_optional(pool)
            .await?
            .map(RateLimitCounter::from)
            .unwrap_or_else(|| RateLimitCounter::new(owner_id, quota, now));
        bucket.apply_quota(quota, now);
        Ok(bucket.peek(now))
    }

    async fn save(conn: &mut PgConnection, bucket: &RateLimitCounter) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE rate_limit_counters \
             SET capacity = $2, refill_period_ms = $3, tokens_available = $4, last_refill_at = $5 \
             WHERE owner_id = $1",
        )
        .bind(&bucket.owner_id)
        .bind(to_db_int(bucket.capacity))
        .bind(period_ms(bucket))
        .bind(bucket.tokens_available)
        .bind(bucket.last_refill_at)
        .execute(conn)
        .await?;
        Ok(())
    }
}

fn period_ms(bucket: &RateLimitCounter) -> i64 {
    i64::try_from(bucket.refill_period.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl RateLimitStore for PgStore {
    async fn try_acquire(
        &self,
        owner_id: &str,
        quota: Quota,
        cost: u32,
        now: Timestamp,
    ) -> Result<RateDecision, StoreError> {
        RateLimitRepo::try_acquire(&self.pool, owner_id, quota, cost, now).await
    }

    async fn peek(
        &self,
        owner_id: &str,
        quota: Quota,
        now: Timestamp,
    ) -> Result<RateDecision, StoreError> {
        RateLimitRepo::peek(&self.pool, owner_id, quota, now).await
    }
}
