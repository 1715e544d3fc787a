//! Per-owner admission control.
//!
//! The owner's quota comes from the [`QuotaProvider`]; the bucket itself
//! lives in the shared [`RateLimitStore`] so every submitter process sees
//! the same count.

use std::sync::Arc;

use conductor_backend::quota::{QuotaError, QuotaProvider};
use conductor_core::clock::Clock;
use conductor_core::rate_limit::RateDecision;
use conductor_db::{RateLimitStore, StoreError};

use crate::metrics::OrchestratorMetrics;

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    quotas: Arc<dyn QuotaProvider>,
    clock: Arc<dyn Clock>,
    metrics: OrchestratorMetrics,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        quotas: Arc<dyn QuotaProvider>,
        clock: Arc<dyn Clock>,
        metrics: OrchestratorMetrics,
    ) -> Self {
        Self {
            store,
            quotas,
            clock,
            metrics,
        }
    }

    /// Take `cost` tokens from the owner's bucket if available.
    pub async fn allow(&self, owner_id: &str, cost: u32) -> Result<RateDecision, RateLimitError> {
        let quota = self.quotas.quota_for(owner_id).await?;
        let decision = self
            .store
            .try_acquire(owner_id, quota, cost, self.clock.now())
            .await?;

        if !decision.allowed {
            self.metrics.rate_limited();
            tracing::warn!(
                owner_id,
                limit = decision.limit,
                retry_after_ms = decision.retry_after.map(|d| d.as_millis() as u64),
                "Rate limit exceeded",
            );
        }
        Ok(decision)
    }

    /// Current bucket state for the owner without consuming anything.
    pub async fn peek(&self, owner_id: &str) -> Result<RateDecision, RateLimitError> {
        let quota = self.quotas.quota_for(owner_id).await?;
        Ok(self.store.peek(owner_id, quota, self.clock.now()).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use conductor_backend::quota::{Tier, TierQuotaProvider, TierTable};
    use conductor_core::clock::ManualClock;
    use conductor_core::rate_limit::Quota;
    use conductor_db::memory::MemoryRateLimitStore;

    use super::*;

    fn limiter(clock: Arc<ManualClock>, quotas: TierQuotaProvider) -> (RateLimiter, OrchestratorMetrics) {
        let metrics = OrchestratorMetrics::new().unwrap();
        let limiter = RateLimiter::new(
            Arc::new(MemoryRateLimitStore::new()),
            Arc::new(quotas),
            clock,
            metrics.clone(),
        );
        (limiter, metrics)
    }

    #[tokio::test]
    async fn denial_is_counted_and_refill_readmits() {
        let clock = Arc::new(ManualClock::starting_now());
        let quotas = TierQuotaProvider::new(TierTable::uniform(Quota::per_hour(1)));
        let (limiter, metrics) = limiter(clock.clone(), quotas);

        assert!(limiter.allow("u2", 1).await.unwrap().allowed);
        let denied = limiter.allow("u2", 1).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(3600)));
        assert_eq!(metrics.rate_limited_count(), 1.0);

        clock.advance(Duration::from_secs(3600));
        assert!(limiter.allow("u2", 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn buckets_are_per_owner_and_follow_tier() {
        let clock = Arc::new(ManualClock::starting_now());
        let quotas = TierQuotaProvider::new(TierTable {
            free: Quota::per_hour(1),
            pro: Quota::per_hour(3),
            enterprise: Quota::per_hour(10),
        });
        quotas.set_tier("pro-user", Tier::Pro);
        let (limiter, _) = limiter(clock, quotas);

        assert!(limiter.allow("free-user", 1).await.unwrap().allowed);
        assert!(!limiter.allow("free-user", 1).await.unwrap().allowed);
        assert_eq!(limiter.allow("pro-user", 1).await.unwrap().remaining, 2);
        assert_eq!(limiter.peek("pro-user").await.unwrap().remaining, 2);
    }
}
