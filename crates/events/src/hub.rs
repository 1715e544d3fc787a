//! Per-job progress channels.
//!
//! Channels are created when the first subscriber arrives and removed when
//! the last subscriber leaves. A terminal event is kept for `linger` so that
//! subscribers arriving just after the job finished still see how it ended.
//! Publishing never blocks and never fails: with no subscribers the event is
//! dropped, and subscribers that fall behind skip ahead.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use conductor_core::job::{Job, JobStatus};
use conductor_core::types::{JobId, Timestamp};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// ProgressEvent
// ---------------------------------------------------------------------------

/// One observation of a job's lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Fraction complete in `0.0..=1.0`.
    pub progress: f32,
    pub message: Option<String>,
    pub timestamp: Timestamp,
}

impl ProgressEvent {
    pub fn new(job_id: impl Into<JobId>, status: JobStatus, timestamp: Timestamp) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            progress: 0.0,
            message: None,
            timestamp,
        }
    }

    /// Snapshot of a stored job, used when a subscriber arrives after the
    /// job already finished.
    pub fn from_job(job: &Job, timestamp: Timestamp) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status,
            progress: job.progress,
            message: job.error.as_ref().map(ToString::to_string),
            timestamp: job.completed_at.unwrap_or(timestamp),
        }
    }

    pub fn with_progress(mut self, progress: f32) -> Self {
        self.progress = progress.clamp(0.0, 1.0);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// ProgressHub
// ---------------------------------------------------------------------------

/// Default buffer capacity per job channel.
pub const DEFAULT_CAPACITY: usize = 64;

/// Default time a terminal event stays available to late subscribers.
pub const DEFAULT_LINGER: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Channel {
    sender: broadcast::Sender<ProgressEvent>,
    subscribers: usize,
    /// Set once the terminal event went out; the channel is pruned after
    /// `linger` from the given instant.
    terminal: Option<(ProgressEvent, Instant)>,
}

impl Channel {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: 0,
            terminal: None,
        }
    }
}

#[derive(Debug)]
struct Shared {
    channels: Mutex<HashMap<JobId, Channel>>,
    capacity: usize,
    linger: Duration,
}

impl Shared {
    fn with_channels<T>(&self, f: impl FnOnce(&mut HashMap<JobId, Channel>) -> T) -> T {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let linger = self.linger;
        channels.retain(|_, ch| match &ch.terminal {
            Some((_, at)) => now.duration_since(*at) < linger,
            None => true,
        });
        f(&mut channels)
    }
}

/// In-process progress fan-out, shared via `clone()`.
#[derive(Debug, Clone)]
pub struct ProgressHub {
    shared: Arc<Shared>,
}

impl ProgressHub {
    pub fn new(capacity: usize, linger: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                channels: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
                linger,
            }),
        }
    }

    /// Publish an event to the job's current subscribers.
    ///
    /// Events after the terminal one are ignored.
    pub fn publish(&self, event: ProgressEvent) {
        let capacity = self.shared.capacity;
        let linger = self.shared.linger;
        self.shared.with_channels(|channels| {
            if !channels.contains_key(&event.job_id) {
                if !event.is_terminal() || linger.is_zero() {
                    return;
                }
                channels.insert(event.job_id.clone(), Channel::new(capacity));
            }
            let Some(channel) = channels.get_mut(&event.job_id) else {
                return;
            };
            if channel.terminal.is_some() {
                return;
            }
            // Ignore the SendError: it only means there are zero receivers.
            let _ = channel.sender.send(event.clone());
            if event.is_terminal() {
                channel.terminal = Some((event, Instant::now()));
            }
        });
    }

    /// Subscribe to one job's events.
    ///
    /// If the job's terminal event was published within `linger`, the
    /// stream yields just that event.
    pub fn subscribe(&self, job_id: &str) -> ProgressStream {
        let capacity = self.shared.capacity;
        let receiver = self.shared.with_channels(|channels| {
            let channel = channels
                .entry(job_id.to_string())
                .or_insert_with(|| Channel::new(capacity));
            if let Some((event, _)) = &channel.terminal {
                return Err(event.clone());
            }
            channel.subscribers += 1;
            Ok(channel.sender.subscribe())
        });

        match receiver {
            Ok(receiver) => ProgressStream::live(
                receiver,
                Subscription {
                    shared: Arc::clone(&self.shared),
                    job_id: job_id.to_string(),
                },
            ),
            Err(terminal) => ProgressStream::once(terminal),
        }
    }

    /// Jobs with an open channel.
    pub fn active_channels(&self) -> usize {
        self.shared.with_channels(|channels| channels.len())
    }
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_LINGER)
    }
}

/// Drops the job's channel when its last live subscriber goes away.
struct Subscription {
    shared: Arc<Shared>,
    job_id: JobId,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut channels = self
            .shared
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(channel) = channels.get_mut(&self.job_id) {
            channel.subscribers = channel.subscribers.saturating_sub(1);
            if channel.subscribers == 0 && channel.terminal.is_none() {
                channels.remove(&self.job_id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ProgressStream
// ---------------------------------------------------------------------------

/// Events for one job, ending after the terminal event or when the channel
/// closes.
pub struct ProgressStream {
    inner: BoxStream<'static, ProgressEvent>,
}

impl ProgressStream {
    /// A stream that yields a single event and ends.
    pub fn once(event: ProgressEvent) -> Self {
        Self {
            inner: stream::once(async move { event }).boxed(),
        }
    }

    fn live(receiver: broadcast::Receiver<ProgressEvent>, subscription: Subscription) -> Self {
        let inner = stream::unfold(Some((receiver, subscription)), |state| async move {
            let (mut receiver, subscription) = state?;
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        let next = if event.is_terminal() {
                            None
                        } else {
                            Some((receiver, subscription))
                        };
                        return Some((event, next));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(job_id = %subscription.job_id, skipped, "Progress subscriber lagged");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Self {
            inner: inner.boxed(),
        }
    }
}

impl Stream for ProgressStream {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for ProgressStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressStream").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn running(job: &str, progress: f32) -> ProgressEvent {
        ProgressEvent::new(job, JobStatus::Running, Utc::now()).with_progress(progress)
    }

    fn done(job: &str) -> ProgressEvent {
        ProgressEvent::new(job, JobStatus::Succeeded, Utc::now()).with_progress(1.0)
    }

    #[tokio::test]
    async fn stream_ends_after_terminal_event() {
        let hub = ProgressHub::default();
        let stream = hub.subscribe("j1");

        hub.publish(running("j1", 0.25));
        hub.publish(running("j1", 0.5));
        hub.publish(done("j1"));

        let events: Vec<_> = stream.collect().await;
        let statuses: Vec<_> = events.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![JobStatus::Running, JobStatus::Running, JobStatus::Succeeded]
        );
        assert_eq!(events[1].progress, 0.5);
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let hub = ProgressHub::default();
        let a = hub.subscribe("j1");
        let b = hub.subscribe("j1");

        hub.publish(running("j1", 0.1));
        hub.publish(done("j1"));

        assert_eq!(a.collect::<Vec<_>>().await.len(), 2);
        assert_eq!(b.collect::<Vec<_>>().await.len(), 2);
    }

    #[tokio::test]
    async fn events_for_other_jobs_are_not_delivered() {
        let hub = ProgressHub::default();
        let stream = hub.subscribe("j1");
        hub.publish(done("j2"));
        hub.publish(done("j1"));

        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].job_id, "j1");
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let hub = ProgressHub::default();
        hub.publish(running("orphan", 0.3));
        assert_eq!(hub.active_channels(), 0);
    }

    #[tokio::test]
    async fn dropping_last_subscriber_removes_channel() {
        let hub = ProgressHub::default();
        let a = hub.subscribe("j1");
        let b = hub.subscribe("j1");
        assert_eq!(hub.active_channels(), 1);
        drop(a);
        assert_eq!(hub.active_channels(), 1);
        drop(b);
        assert_eq!(hub.active_channels(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_subscriber_gets_terminal_event_within_linger() {
        let hub = ProgressHub::new(8, Duration::from_secs(5));
        hub.publish(done("j1"));

        let replay: Vec<_> = hub.subscribe("j1").collect().await;
        assert_eq!(replay.len(), 1);
        assert!(replay[0].is_terminal());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(hub.active_channels(), 0);
    }

    #[tokio::test]
    async fn events_after_terminal_are_ignored() {
        let hub = ProgressHub::default();
        let stream = hub.subscribe("j1");
        hub.publish(done("j1"));
        hub.publish(running("j1", 0.9));

        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_ahead_to_terminal() {
        let hub = ProgressHub::new(2, DEFAULT_LINGER);
        let stream = hub.subscribe("j1");
        for i in 0..10 {
            hub.publish(running("j1", i as f32 / 10.0));
        }
        hub.publish(done("j1"));

        let events: Vec<_> = stream.collect().await;
        assert!(events.len() <= 2);
        assert!(events.last().is_some_and(ProgressEvent::is_terminal));
    }

    #[test]
    fn snapshot_of_failed_job_carries_error() {
        use conductor_core::job::{JobError, JobErrorKind};

        let now = Utc::now();
        let mut job = Job::new_queued("j1".into(), "u1".into(), b"{}".to_vec(), now);
        job.status = JobStatus::Failed;
        job.error = Some(JobError::new(JobErrorKind::Timeout, "deadline elapsed"));
        job.completed_at = Some(now);

        let event = ProgressEvent::from_job(&job, Utc::now());
        assert!(event.is_terminal());
        assert_eq!(event.timestamp, now);
        assert_eq!(event.message.as_deref(), Some("timeout: deadline elapsed"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "failed");
    }
}
