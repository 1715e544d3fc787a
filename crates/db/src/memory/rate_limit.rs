use std::collections::HashMap;

use async_trait::async_trait;
use conductor_core::rate_limit::{Quota, RateDecision, RateLimitCounter};
use conductor_core::types::{OwnerId, Timestamp};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::store::RateLimitStore;

/// In-memory token buckets keyed by owner.
#[derive(Debug, Default)]
pub struct MemoryRateLimitStore {
    buckets: Mutex<HashMap<OwnerId, RateLimitCounter>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn try_acquire(
        &self,
        owner_id: &str,
        quota: Quota,
        cost: u32,
        now: Timestamp,
    ) -> Result<RateDecision, StoreError> {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(owner_id.to_string())
            .or_insert_with(|| RateLimitCounter::new(owner_id, quota, now));
        bucket.apply_quota(quota, now);
        Ok(bucket.try_take(cost, now))
    }

    async fn peek(
        &self,
        owner_id: &str,
        quota: Quota,
        now: Timestamp,
    ) -> Result<RateDecision, StoreError> {
        let buckets = self.buckets.lock().await;
        let mut bucket = buckets
            .get(owner_id)
            .cloned()
            .unwrap_or_else(|| RateLimitCounter::new(owner_id, quota, now));
        bucket.apply_quota(quota, now);
        Ok(bucket.peek(now))
    }
}
