use std::collections::HashMap;

use async_trait::async_trait;
use conductor_core::idempotency::{IdempotencyRecord, Reservation};
use conductor_core::types::{OwnerId, Timestamp};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::store::IdempotencyStore;

/// In-memory idempotency table keyed by `(owner_id, client_key)`.
#[derive(Debug, Default)]
pub struct MemoryIdempotencyStore {
    records: Mutex<HashMap<(OwnerId, String), IdempotencyRecord>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn reserve(
        &self,
        record: IdempotencyRecord,
        now: Timestamp,
    ) -> Result<Reservation, StoreError> {
        let mut records = self.records.lock().await;
        let key = (record.owner_id.clone(), record.client_key.clone());
        if let Some(existing) = records.get(&key).filter(|r| r.is_live(now)) {
            return Ok(Reservation::Existing(existing.job_id.clone()));
        }
        records.insert(key, record);
        Ok(Reservation::Reserved)
    }

    async fn release(
        &self,
        owner_id: &str,
        client_key: &str,
        job_id: &str,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let key = (owner_id.to_string(), client_key.to_string());
        if records.get(&key).is_some_and(|r| r.job_id == job_id) {
            records.remove(&key);
        }
        Ok(())
    }

    async fn purge_expired(&self, now: Timestamp) -> Result<u64, StoreError> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, r| r.is_live(now));
        Ok((before - records.len()) as u64)
    }
}
