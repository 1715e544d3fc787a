use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use conductor_core::clock::to_chrono;
use conductor_core::types::{Timestamp, WorkerId};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::store::WorkerRegistry;

/// In-memory live-worker registry.
#[derive(Debug, Default)]
pub struct MemoryWorkerRegistry {
    last_seen: Mutex<HashMap<WorkerId, Timestamp>>,
}

impl MemoryWorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerRegistry for MemoryWorkerRegistry {
    async fn beat(&self, worker_id: &str, now: Timestamp) -> Result<(), StoreError> {
        self.last_seen.lock().await.insert(worker_id.to_string(), now);
        Ok(())
    }

    async fn deregister(&self, worker_id: &str) -> Result<(), StoreError> {
        self.last_seen.lock().await.remove(worker_id);
        Ok(())
    }

    async fn live_workers(
        &self,
        now: Timestamp,
        stale_after: Duration,
    ) -> Result<HashSet<WorkerId>, StoreError> {
        let cutoff = now
            .checked_sub_signed(to_chrono(stale_after))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        Ok(self
            .last_seen
            .lock()
            .await
            .iter()
            .filter(|(_, seen)| **seen >= cutoff)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn prune(&self, cutoff: Timestamp) -> Result<u64, StoreError> {
        let mut last_seen = self.last_seen.lock().await;
        let before = last_seen.len();
        last_seen.retain(|_, seen| *seen >= cutoff);
        Ok((before - last_seen.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[tokio::test]
    async fn stale_and_deregistered_workers_are_not_live() {
        let registry = MemoryWorkerRegistry::new();
        let now = Utc::now();
        registry.beat("fresh", now).await.unwrap();
        registry
            .beat("stale", now - chrono::Duration::seconds(120))
            .await
            .unwrap();
        registry.beat("gone", now).await.unwrap();
        registry.deregister("gone").await.unwrap();

        let live = registry
            .live_workers(now, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(live, HashSet::from(["fresh".to_string()]));
    }

    #[tokio::test]
    async fn prune_drops_only_old_rows() {
        let registry = MemoryWorkerRegistry::new();
        let now = Utc::now();
        registry.beat("fresh", now).await.unwrap();
        registry
            .beat("crashed", now - chrono::Duration::seconds(600))
            .await
            .unwrap();

        let pruned = registry
            .prune(now - chrono::Duration::seconds(300))
            .await
            .unwrap();

        assert_eq!(pruned, 1);
        let live = registry
            .live_workers(now, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(live, HashSet::from(["fresh".to_string()]));
    }
}
