//! Row model for the `rate_limit_counters` table.

use std::time::Duration;

use conductor_core::rate_limit::RateLimitCounter;
use conductor_core::types::Timestamp;
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct RateLimitRow {
    pub owner_id: String,
    pub capacity: i32,
    pub refill_period_ms: i64,
    pub tokens_available: f64,
    pub last_refill_at: Timestamp,
}

impl From<RateLimitRow> for RateLimitCounter {
    fn from(row: RateLimitRow) -> Self {
        Self {
            owner_id: row.owner_id,
            capacity: u32::try_from(row.capacity).unwrap_or(0),
            refill_period: Duration::from_millis(u64::try_from(row.refill_period_ms).unwrap_or(0)),
            tokens_available: row.tokens_available,
            last_refill_at: row.last_refill_at,
        }
    }
}
