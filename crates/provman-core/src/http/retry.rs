//! Backoff schedule for retried requests.
//!
//! Waits double from [`BASE_DELAY`] up to [`MAX_DELAY`]; each wait is then
//! spread uniformly over `[wait / 2, wait * 3 / 2]` so that many working
//! directories hitting one mirror do not retry in lockstep.

use std::time::Duration;

use rand::Rng;

/// Wait before the first retry.
pub const BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on a single wait, before spreading.
pub const MAX_DELAY: Duration = Duration::from_secs(30);

/// How many times a request is repeated and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    spread: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_retries(crate::config::DEFAULT_DOWNLOAD_RETRIES)
    }
}

impl RetryPolicy {
    /// Policy making `retries` further attempts after the first.
    pub fn from_retries(retries: u32) -> Self {
        Self {
            retries,
            base_delay: BASE_DELAY,
            max_delay: MAX_DELAY,
            spread: true,
        }
    }

    /// A single attempt.
    pub fn no_retry() -> Self {
        Self::from_retries(0).without_delay()
    }

    /// Same attempt count, no waiting between attempts.
    pub fn without_delay(self) -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            spread: false,
            ..self
        }
    }

    /// Same attempt count, fixed doubling waits with no random spread.
    pub fn without_spread(self) -> Self {
        Self {
            spread: false,
            ..self
        }
    }

    /// Retries after the first attempt.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Total attempts, including the first.
    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Wait before attempt `attempt` (0 is the first attempt).
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.max_delay.is_zero() {
            return Duration::ZERO;
        }
        let doubled = self
            .base_delay
            .saturating_mul(1 << (attempt - 1).min(16))
            .min(self.max_delay);
        if !self.spread {
            return doubled;
        }
        let half = doubled / 2;
        let extra = rand::rng().random_range(Duration::ZERO..=doubled);
        half + extra
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_map_to_attempts() {
        assert_eq!(RetryPolicy::from_retries(1).attempts(), 2);
        assert_eq!(RetryPolicy::from_retries(0).attempts(), 1);
        assert_eq!(RetryPolicy::default().attempts(), 3);
        assert_eq!(RetryPolicy::from_retries(4).retries(), 4);
        assert_eq!(RetryPolicy::no_retry().attempts(), 1);
    }

    #[test]
    fn first_attempt_has_no_delay() {
        assert_eq!(RetryPolicy::default().backoff(0), Duration::ZERO);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::from_retries(10).without_spread();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(9), MAX_DELAY);
        assert_eq!(policy.backoff(40), MAX_DELAY);
    }

    #[test]
    fn spread_stays_in_range() {
        let policy = RetryPolicy::from_retries(3);
        for _ in 0..50 {
            let d = policy.backoff(1);
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(1500), "{d:?}");
        }
    }

    #[test]
    fn without_delay_is_immediate() {
        let policy = RetryPolicy::from_retries(3).without_delay();
        assert_eq!(policy.backoff(2), Duration::ZERO);
        assert_eq!(policy.attempts(), 4);
    }
}
