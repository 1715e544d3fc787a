//! Crash-recovery policy: what to do with a job whose worker went away.
//!
//! The sweep detects abandonment (stale heartbeat or an owner that is no
//! longer registered as live) and asks the configured [`RecoveryPolicy`]
//! whether to requeue or fail. The default requeues once and fails on the
//! second loss.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::to_chrono;
use crate::error::CoreError;
use crate::types::Timestamp;

/// Default number of recovery requeues before a job is failed.
pub const DEFAULT_MAX_REQUEUES: u32 = 1;

/// Policy applied to abandoned running jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum RecoveryPolicy {
    /// Requeue while `retry_count < max_requeues`, then fail.
    Requeue { max_requeues: u32 },
    /// Always fail with `WorkerLost`.
    Fail,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        RecoveryPolicy::Requeue {
            max_requeues: DEFAULT_MAX_REQUEUES,
        }
    }
}

/// What the sweep should do with one abandoned job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Requeue,
    Fail,
}

impl RecoveryPolicy {
    /// Decide for a job that has already been requeued `retry_count` times.
    pub fn decide(&self, retry_count: u32) -> RecoveryAction {
        match *self {
            RecoveryPolicy::Requeue { max_requeues } if retry_count < max_requeues => {
                RecoveryAction::Requeue
            }
            _ => RecoveryAction::Fail,
        }
    }

    /// Build from the `RECOVERY_POLICY` name plus the requeue budget.
    pub fn parse(name: &str, max_requeues: u32) -> Result<Self, CoreError> {
        match name.parse::<PolicyName>()? {
            PolicyName::Requeue => Ok(RecoveryPolicy::Requeue { max_requeues }),
            PolicyName::Fail => Ok(RecoveryPolicy::Fail),
        }
    }
}

impl fmt::Display for RecoveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryPolicy::Requeue { max_requeues } => write!(f, "requeue(max={max_requeues})"),
            RecoveryPolicy::Fail => f.write_str("fail"),
        }
    }
}

enum PolicyName {
    Requeue,
    Fail,
}

impl FromStr for PolicyName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "requeue" => Ok(PolicyName::Requeue),
            "fail" => Ok(PolicyName::Fail),
            other => Err(CoreError::Validation(format!(
                "Unknown recovery policy \"{other}\" (expected \"requeue\" or \"fail\")"
            ))),
        }
    }
}

/// True when a heartbeat taken at `heartbeat_at` is older than `threshold`.
///
/// A missing heartbeat on a running job is always stale.
pub fn is_stale(heartbeat_at: Option<Timestamp>, now: Timestamp, threshold: Duration) -> bool {
    match heartbeat_at {
        Some(hb) => now - hb > to_chrono(threshold),
        None => true,
    }
}

/// Default staleness threshold: the longest single call a worker makes plus
/// two heartbeat intervals, at least 10s.
pub fn default_stale_after(heartbeat_interval: Duration, longest_call: Duration) -> Duration {
    (longest_call + heartbeat_interval * 2).max(Duration::from_secs(10))
}
