//! Retry Scheduler: exponential backoff between delivery attempts.
//!
//! The delay after the n-th failed attempt is `base * 2^(n-1)`: with the
//! default 5 minute base that is 5, 10 and 20 minutes. Once a notification has
//! used `max_attempts` attempts no further retry is scheduled.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngExt;

/// Backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before a notification is failed for good.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Hard cap on a single delay.
    pub max_delay: Duration,
    /// When true, adds random jitter of [0, base_delay/2).
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5 * 60),
            max_delay: Duration::from_secs(24 * 60 * 60),
            jitter: false,
        }
    }
}

/// What to do after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Deliver again once `next_retry_at` has passed.
    RetryAt {
        delay: Duration,
        next_retry_at: DateTime<Utc>,
    },
    /// Attempts are exhausted.
    GiveUp,
}

#[derive(Debug, Clone, Default)]
pub struct RetryScheduler {
    policy: RetryPolicy,
}

impl RetryScheduler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    /// Backoff after the `failed_attempts`-th failure (1-based), without jitter.
    pub fn base_delay_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1);
        let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.policy
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.policy.max_delay)
            .min(self.policy.max_delay)
    }

    /// Backoff after the `failed_attempts`-th failure, with jitter if enabled.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let capped = self.base_delay_for(failed_attempts);
        if !self.policy.jitter {
            return capped;
        }

        let jitter_range_ms = u64::try_from(self.policy.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        let remaining_ms =
            u64::try_from(self.policy.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        capped + Duration::from_millis(jitter_ms)
    }

    /// Decide the follow-up for a notification that has now failed
    /// `attempt_count` times.
    pub fn decide(&self, attempt_count: u32, now: DateTime<Utc>) -> RetryDecision {
        if attempt_count >= self.policy.max_attempts {
            return RetryDecision::GiveUp;
        }

        let delay = self.delay_for(attempt_count);
        let next_retry_at =
            now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        RetryDecision::RetryAt {
            delay,
            next_retry_at,
        }
    }
}
