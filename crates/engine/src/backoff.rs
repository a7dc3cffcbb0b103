//! Retry backoff policy.
//!
//! The delay before attempt `n + 1` is `base * 2^n`, capped at `max`, plus a
//! uniformly random jitter in `[0, jitter]` so that items failing together do
//! not get re-claimed together.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;

/// Exponential backoff with a cap and additive jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: Duration) -> Self {
        Self { base, max, jitter }
    }

    /// Deterministic part of the delay for an item that has failed
    /// `retry_count` times before this failure.
    pub fn capped_delay(&self, retry_count: i32) -> Duration {
        let exponent = retry_count.clamp(0, 31) as u32;
        let factor = 1u32 << exponent;
        self.base
            .checked_mul(factor)
            .map(|d| d.min(self.max))
            .unwrap_or(self.max)
    }

    /// Full delay including jitter.
    pub fn delay(&self, retry_count: i32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.capped_delay(retry_count) + jitter
    }

    /// When the next attempt becomes eligible for claiming.
    pub fn next_attempt_at(&self, now: DateTime<Utc>, retry_count: i32) -> DateTime<Utc> {
        let delay = TimeDelta::from_std(self.delay(retry_count))
            .unwrap_or_else(|_| TimeDelta::seconds(self.max.as_secs() as i64));
        now + delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            max: Duration::from_secs(3600),
            jitter: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> Backoff {
        Backoff::new(Duration::from_secs(10), Duration::from_secs(100), Duration::ZERO)
    }

    #[test]
    fn test_delay_doubles_per_retry() {
        let backoff = no_jitter();
        assert_eq!(backoff.capped_delay(0), Duration::from_secs(10));
        assert_eq!(backoff.capped_delay(1), Duration::from_secs(20));
        assert_eq!(backoff.capped_delay(2), Duration::from_secs(40));
        assert_eq!(backoff.capped_delay(3), Duration::from_secs(80));
    }

    #[test]
    fn test_delay_is_capped() {
        let backoff = no_jitter();
        assert_eq!(backoff.capped_delay(4), Duration::from_secs(100));
        assert_eq!(backoff.capped_delay(30), Duration::from_secs(100));
        assert_eq!(backoff.capped_delay(i32::MAX), Duration::from_secs(100));
    }

    #[test]
    fn test_negative_retry_count_treated_as_zero() {
        assert_eq!(no_jitter().capped_delay(-3), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let backoff = Backoff::new(
            Duration::from_secs(10),
            Duration::from_secs(100),
            Duration::from_millis(500),
        );
        for _ in 0..200 {
            let delay = backoff.delay(1);
            assert!(delay >= Duration::from_secs(20));
            assert!(delay <= Duration::from_millis(20_500));
        }
    }

    #[test]
    fn test_next_attempt_at_is_in_the_future() {
        let now = Utc::now();
        let at = no_jitter().next_attempt_at(now, 0);
        assert_eq!(at - now, TimeDelta::seconds(10));
    }
}
