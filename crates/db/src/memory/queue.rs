use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use conductor_core::types::JobId;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{Delivery, WorkQueue};

/// Default time a delivered message stays hidden before redelivery.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct Message {
    job_id: JobId,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Message>,
    /// receipt -> (message, instant it becomes visible again)
    in_flight: HashMap<String, (Message, Instant)>,
}

impl QueueState {
    /// Move messages whose visibility timeout lapsed back to the ready list.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, (_, visible_at))| *visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some((message, _)) = self.in_flight.remove(&receipt) {
                self.ready.push_back(message);
            }
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.in_flight.values().map(|(_, at)| *at).min()
    }
}

/// In-process FIFO work queue with SQS-style visibility timeouts.
///
/// Uses tokio's clock, so tests running with a paused runtime can drive
/// redelivery deterministically.
#[derive(Debug)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(DEFAULT_VISIBILITY_TIMEOUT)
    }
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn push(&self, job_id: &str) -> Result<(), StoreError> {
        self.state.lock().await.ready.push_back(Message {
            job_id: job_id.to_string(),
            delivery_count: 0,
        });
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, StoreError> {
        let deadline = Instant::now() + wait;
        loop {
            let wake_at = {
                let now = Instant::now();
                let mut state = self.state.lock().await;
                state.reclaim_expired(now);
                if let Some(mut message) = state.ready.pop_front() {
                    message.delivery_count += 1;
                    let receipt = Uuid::new_v4().to_string();
                    let delivery = Delivery {
                        job_id: message.job_id.clone(),
                        receipt: receipt.clone(),
                        delivery_count: message.delivery_count,
                    };
                    state
                        .in_flight
                        .insert(receipt, (message, now + self.visibility_timeout));
                    return Ok(Some(delivery));
                }
                if now >= deadline {
                    return Ok(None);
                }
                state
                    .next_expiry()
                    .map_or(deadline, |expiry| expiry.min(deadline))
            };

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, receipt: &str) -> Result<(), StoreError> {
        self.state.lock().await.in_flight.remove(receipt);
        Ok(())
    }

    async fn remove(&self, job_id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.ready.len() + state.in_flight.len();
        state.ready.retain(|m| m.job_id != job_id);
        state.in_flight.retain(|_, (m, _)| m.job_id != job_id);
        Ok(state.ready.len() + state.in_flight.len() < before)
    }

    async fn contains(&self, job_id: &str) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state.ready.iter().any(|m| m.job_id == job_id)
            || state.in_flight.values().any(|(m, _)| m.job_id == job_id))
    }

    async fn depth(&self) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        state.reclaim_expired(Instant::now());
        Ok(state.ready.len() as u64)
    }
}
