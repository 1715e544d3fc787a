//! Wall-clock abstraction.
//!
//! Every component that stamps or compares times (heartbeats, token
//! refills, idempotency expiry, staleness checks) reads the time through a
//! [`Clock`] so that tests can drive time explicitly with [`ManualClock`].

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;

use crate::types::Timestamp;

/// Source of the current UTC time.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Timestamp;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Start at the current system time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += to_chrono(by);
    }

    /// Jump to an absolute instant.
    pub fn set(&self, to: Timestamp) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Convert a std duration into a chrono duration, saturating on overflow.
pub fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_moves_when_advanced() {
        let clock = ManualClock::starting_now();
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);

        clock.advance(Duration::from_secs(3600));
        assert_eq!(clock.now() - t0, chrono::Duration::hours(1));
    }

    #[test]
    fn manual_clock_set_jumps_to_instant() {
        let clock = ManualClock::starting_now();
        let target = clock.now() + chrono::Duration::days(2);
        clock.set(target);
        assert_eq!(clock.now(), target);
    }

    #[test]
    fn to_chrono_saturates() {
        assert_eq!(to_chrono(Duration::MAX), chrono::Duration::MAX);
        assert_eq!(to_chrono(Duration::from_millis(1500)), chrono::Duration::milliseconds(1500));
    }
}
