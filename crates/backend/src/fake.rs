//! Scripted in-process backend for tests.
//!
//! Each submitted payload consumes the next [`Attempt`] scripted for it (or
//! the default attempt). A running task answers polls from its list of
//! [`PollStep`]s and keeps repeating the last progress once the list is
//! exhausted, which models a task that never finishes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::client::{BackendClient, BackendError, BackendOutput, BackendPoll, BackendTaskId};

/// One answer to `poll`.
#[derive(Debug, Clone)]
pub enum PollStep {
    Progress(f32),
    Succeed(Vec<BackendOutput>),
    /// The task ended with this error.
    Fail(BackendError),
    /// The poll call itself fails.
    Error(BackendError),
}

/// What happens to one `submit` call.
#[derive(Debug, Clone)]
pub enum Attempt {
    Reject(BackendError),
    Run(Vec<PollStep>),
}

impl Attempt {
    /// Report `progress` once, then succeed with `outputs`.
    pub fn succeed_after(progress: f32, outputs: Vec<BackendOutput>) -> Self {
        Attempt::Run(vec![PollStep::Progress(progress), PollStep::Succeed(outputs)])
    }

    /// Report progress forever.
    pub fn hang() -> Self {
        Attempt::Run(vec![PollStep::Progress(0.1)])
    }
}

#[derive(Debug, Default)]
struct TaskState {
    steps: VecDeque<PollStep>,
    last_progress: f32,
    canceled: bool,
}

#[derive(Debug)]
struct FakeState {
    scripts: HashMap<Vec<u8>, VecDeque<Attempt>>,
    default_attempt: Attempt,
    tasks: HashMap<BackendTaskId, TaskState>,
    submitted: Vec<Vec<u8>>,
    canceled: Vec<BackendTaskId>,
    polls: usize,
}

/// A [`BackendClient`] whose behavior is scripted per payload.
#[derive(Debug)]
pub struct ScriptedBackend {
    state: Mutex<FakeState>,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new(Attempt::succeed_after(0.5, vec![BackendOutput::new(b"out".to_vec(), "text/plain")]))
    }
}

impl ScriptedBackend {
    /// A backend where every unscripted payload behaves like `default_attempt`.
    pub fn new(default_attempt: Attempt) -> Self {
        Self {
            state: Mutex::new(FakeState {
                scripts: HashMap::new(),
                default_attempt,
                tasks: HashMap::new(),
                submitted: Vec::new(),
                canceled: Vec::new(),
                polls: 0,
            }),
        }
    }

    /// Queue attempts for submissions of exactly `payload`.
    pub fn script(&self, payload: &[u8], attempts: impl IntoIterator<Item = Attempt>) {
        self.lock()
            .scripts
            .entry(payload.to_vec())
            .or_default()
            .extend(attempts);
    }

    /// Payloads received by `submit`, in order.
    pub fn submitted(&self) -> Vec<Vec<u8>> {
        self.lock().submitted.clone()
    }

    /// Task ids passed to `cancel`, in order.
    pub fn canceled(&self) -> Vec<BackendTaskId> {
        self.lock().canceled.clone()
    }

    pub fn poll_count(&self) -> usize {
        self.lock().polls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BackendClient for ScriptedBackend {
    async fn submit(&self, payload: &[u8]) -> Result<BackendTaskId, BackendError> {
        let mut state = self.lock();
        state.submitted.push(payload.to_vec());
        let scripted = state.scripts.get_mut(payload).and_then(VecDeque::pop_front);
        let attempt = match scripted {
            Some(attempt) => attempt,
            None => state.default_attempt.clone(),
        };

        match attempt {
            Attempt::Reject(err) => Err(err),
            Attempt::Run(steps) => {
                let task_id = format!("task-{}", state.submitted.len());
                state.tasks.insert(
                    task_id.clone(),
                    TaskState {
                        steps: steps.into(),
                        ..TaskState::default()
                    },
                );
                Ok(task_id)
            }
        }
    }

    async fn poll(&self, task_id: &str) -> Result<BackendPoll, BackendError> {
        let mut state = self.lock();
        state.polls += 1;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| BackendError::Permanent(format!("unknown task {task_id}")))?;

        if task.canceled {
            return Ok(BackendPoll::failed(BackendError::Permanent("canceled".into())));
        }

        // The last step repeats forever unless it ends the task.
        let step = if task.steps.len() > 1 {
            task.steps.pop_front()
        } else {
            task.steps.front().cloned()
        };

        match step {
            Some(PollStep::Progress(p)) => {
                task.last_progress = p;
                Ok(BackendPoll::running(p))
            }
            Some(PollStep::Succeed(outputs)) => Ok(BackendPoll::succeeded(outputs)),
            Some(PollStep::Fail(err)) => Ok(BackendPoll::failed(err)),
            Some(PollStep::Error(err)) => Err(err),
            None => Ok(BackendPoll::running(task.last_progress)),
        }
    }

    async fn cancel(&self, task_id: &str) -> Result<(), BackendError> {
        let mut state = self.lock();
        state.canceled.push(task_id.to_string());
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.canceled = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn scripted_attempts_are_consumed_in_order() {
        let backend = ScriptedBackend::default();
        backend.script(
            b"p",
            [
                Attempt::Reject(BackendError::Transient("busy".into())),
                Attempt::Run(vec![PollStep::Succeed(vec![])]),
            ],
        );

        assert_matches!(backend.submit(b"p").await, Err(BackendError::Transient(_)));
        let task = backend.submit(b"p").await.unwrap();
        assert!(backend.poll(&task).await.unwrap().done);
        assert_eq!(backend.submitted().len(), 2);
    }

    #[tokio::test]
    async fn hanging_task_repeats_progress_until_canceled() {
        let backend = ScriptedBackend::new(Attempt::hang());
        let task = backend.submit(b"x").await.unwrap();
        for _ in 0..3 {
            let poll = backend.poll(&task).await.unwrap();
            assert!(!poll.done);
            assert_eq!(poll.progress, 0.1);
        }
        backend.cancel(&task).await.unwrap();
        assert!(backend.poll(&task).await.unwrap().done);
        assert_eq!(backend.canceled(), vec![task]);
    }
}
