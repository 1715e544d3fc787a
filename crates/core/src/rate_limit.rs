//! Token-bucket arithmetic for per-owner admission control.
//!
//! A [`Quota`] is what the identity/quota provider resolves for an owner:
//! the bucket `capacity` and the period over which an empty bucket refills
//! completely. The refill rate is therefore `capacity / refill_period`
//! tokens per second. Refill is computed from whole milliseconds so that
//! exactly one refill period always yields exactly `capacity` tokens.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::to_chrono;
use crate::types::{OwnerId, Timestamp};

/// Tolerance applied when comparing fractional token counts.
const TOKEN_EPSILON: f64 = 1e-9;

/// Bucket parameters for one owner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quota {
    pub capacity: u32,
    /// Time for an empty bucket to refill to `capacity`.
    #[serde(with = "duration_ms")]
    pub refill_period: Duration,
}

impl Quota {
    pub fn new(capacity: u32, refill_period: Duration) -> Self {
        Self {
            capacity,
            refill_period,
        }
    }

    /// `capacity` requests per hour.
    pub fn per_hour(capacity: u32) -> Self {
        Self::new(capacity, Duration::from_secs(3600))
    }

    /// `capacity` requests per minute.
    pub fn per_minute(capacity: u32) -> Self {
        Self::new(capacity, Duration::from_secs(60))
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        let period = self.refill_period.as_secs_f64();
        if period <= 0.0 {
            f64::INFINITY
        } else {
            f64::from(self.capacity) / period
        }
    }

    fn period_ms(&self) -> i64 {
        i64::try_from(self.refill_period.as_millis()).unwrap_or(i64::MAX)
    }
}

/// The admission answer plus what the caller needs for response headers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    /// Whole tokens left after this decision.
    pub remaining: u32,
    pub limit: u32,
    /// When the bucket will be full again.
    pub reset_at: Timestamp,
    /// When a denied request of the same cost could next succeed.
    pub retry_after: Option<Duration>,
}

/// Persistent bucket state for one owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitCounter {
    pub owner_id: OwnerId,
    pub capacity: u32,
    #[serde(with = "duration_ms")]
    pub refill_period: Duration,
    pub tokens_available: f64,
    pub last_refill_at: Timestamp,
}

impl RateLimitCounter {
    /// A full bucket for a new owner.
    pub fn new(owner_id: impl Into<OwnerId>, quota: Quota, now: Timestamp) -> Self {
        Self {
            owner_id: owner_id.into(),
            capacity: quota.capacity,
            refill_period: quota.refill_period,
            tokens_available: f64::from(quota.capacity),
            last_refill_at: now,
        }
    }

    pub fn quota(&self) -> Quota {
        Quota::new(self.capacity, self.refill_period)
    }

    /// Adopt a (possibly changed) quota, e.g. after a tier upgrade.
    ///
    /// Tokens already earned are kept but clamped to the new capacity.
    pub fn apply_quota(&mut self, quota: Quota, now: Timestamp) {
        if quota == self.quota() {
            return;
        }
        self.refill(now);
        self.capacity = quota.capacity;
        self.refill_period = quota.refill_period;
        self.tokens_available = self.tokens_available.min(f64::from(quota.capacity));
    }

    /// Credit tokens for the time elapsed since `last_refill_at`.
    ///
    /// A clock that moved backwards credits nothing.
    pub fn refill(&mut self, now: Timestamp) {
        let elapsed_ms = (now - self.last_refill_at).num_milliseconds();
        if elapsed_ms <= 0 {
            return;
        }
        let capacity = f64::from(self.capacity);
        let earned = if self.refill_period.is_zero() {
            capacity
        } else {
            elapsed_ms as f64 * capacity / self.quota().period_ms() as f64
        };
        self.tokens_available = (self.tokens_available + earned).min(capacity);
        self.last_refill_at = now;
    }

    /// Refill, then take `cost` tokens if available.
    pub fn try_take(&mut self, cost: u32, now: Timestamp) -> RateDecision {
        self.refill(now);
        let cost_f = f64::from(cost);
        let allowed = self.tokens_available + TOKEN_EPSILON >= cost_f;
        if allowed {
            self.tokens_available = (self.tokens_available - cost_f).max(0.0);
        }
        let retry_after = (!allowed).then(|| self.time_until(cost_f));
        self.decision(allowed, retry_after, now)
    }

    /// Current state without consuming anything.
    pub fn peek(&mut self, now: Timestamp) -> RateDecision {
        self.refill(now);
        self.decision(true, None, now)
    }

    fn decision(&self, allowed: bool, retry_after: Option<Duration>, now: Timestamp) -> RateDecision {
        let reset_in = self.time_until(f64::from(self.capacity));
        RateDecision {
            allowed,
            remaining: (self.tokens_available + TOKEN_EPSILON).floor() as u32,
            limit: self.capacity,
            reset_at: now
                .checked_add_signed(to_chrono(reset_in))
                .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC),
            retry_after,
        }
    }

    /// Time until the bucket holds `target` tokens, rounded up to whole
    /// milliseconds.
    fn time_until(&self, target: f64) -> Duration {
        let missing = target - self.tokens_available;
        if missing <= TOKEN_EPSILON || self.refill_period.is_zero() {
            return Duration::ZERO;
        }
        if self.capacity == 0 {
            return Duration::MAX;
        }
        let ms = missing * self.quota().period_ms() as f64 / f64::from(self.capacity);
        Duration::from_millis(ms.ceil().min(u64::MAX as f64) as u64)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn capacity_admits_then_denies_without_elapsed_time() {
        let now = Utc::now();
        let mut bucket = RateLimitCounter::new("u1", Quota::per_minute(3), now);
        for expected_remaining in [2, 1, 0] {
            let d = bucket.try_take(1, now);
            assert!(d.allowed);
            assert_eq!(d.remaining, expected_remaining);
        }
        let denied = bucket.try_take(1, now);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(20)));
    }

    #[test]
    fn one_full_period_refills_exactly_capacity() {
        let now = Utc::now();
        let mut bucket = RateLimitCounter::new("u2", Quota::per_hour(1), now);
        assert!(bucket.try_take(1, now).allowed);
        assert!(!bucket.try_take(1, now).allowed);

        let later = now + chrono::Duration::hours(1);
        assert!(bucket.try_take(1, later).allowed);
        assert!(!bucket.try_take(1, later).allowed);
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let now = Utc::now();
        let mut bucket = RateLimitCounter::new("u", Quota::per_minute(5), now);
        bucket.refill(now + chrono::Duration::days(30));
        assert_eq!(bucket.tokens_available, 5.0);
    }

    #[test]
    fn partial_refill_is_proportional() {
        let now = Utc::now();
        let mut bucket = RateLimitCounter::new("u", Quota::per_minute(60), now);
        for _ in 0..60 {
            bucket.try_take(1, now);
        }
        let d = bucket.peek(now + chrono::Duration::seconds(10));
        assert_eq!(d.remaining, 10);
    }

    #[test]
    fn clock_going_backwards_credits_nothing() {
        let now = Utc::now();
        let mut bucket = RateLimitCounter::new("u", Quota::per_minute(1), now);
        bucket.try_take(1, now);
        bucket.refill(now - chrono::Duration::seconds(30));
        assert_eq!(bucket.tokens_available, 0.0);
        assert_eq!(bucket.last_refill_at, now);
    }

    #[test]
    fn reset_at_points_to_full_bucket() {
        let now = Utc::now();
        let mut bucket = RateLimitCounter::new("u", Quota::per_minute(2), now);
        let d = bucket.try_take(2, now);
        assert!(d.allowed);
        assert_eq!(d.reset_at, now + chrono::Duration::seconds(60));
    }

    #[test]
    fn apply_quota_clamps_tokens() {
        let now = Utc::now();
        let mut bucket = RateLimitCounter::new("u", Quota::per_minute(10), now);
        bucket.apply_quota(Quota::per_minute(2), now);
        assert_eq!(bucket.capacity, 2);
        assert_eq!(bucket.tokens_available, 2.0);
    }

    #[test]
    fn cost_above_one_is_charged_in_full() {
        let now = Utc::now();
        let mut bucket = RateLimitCounter::new("u", Quota::per_minute(5), now);
        assert!(bucket.try_take(4, now).allowed);
        assert!(!bucket.try_take(2, now).allowed);
        assert!(bucket.try_take(1, now).allowed);
    }

    #[test]
    fn refill_rate_is_capacity_over_period() {
        assert_eq!(Quota::per_minute(120).refill_rate(), 2.0);
    }
}
