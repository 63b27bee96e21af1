//! Token-bucket admission control.
//!
//! The refill and the decrement happen in one atomic step inside the
//! [`RateBucketStore`], so concurrent checks for the same key can never both
//! spend the last token.

mod memory_bucket;
mod redis_bucket;

pub use memory_bucket::InMemoryBucketStore;
pub use redis_bucket::RedisBucketStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use herald_common::clock::Clock;
use herald_common::error::AppError;

/// Static bucket parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketConfig {
    /// Maximum tokens (burst size).
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_per_second: f64,
    /// Buckets untouched for this long are dropped and start full again.
    pub idle_ttl: Duration,
}

impl BucketConfig {
    pub fn per_minute(
        capacity: u32,
        refill_per_minute: f64,
        idle_ttl: Duration,
    ) -> Result<Self, AppError> {
        if capacity == 0 {
            return Err(AppError::Config(
                "rate limit capacity must be at least 1".to_string(),
            ));
        }
        if !refill_per_minute.is_finite() || refill_per_minute <= 0.0 {
            return Err(AppError::Config(format!(
                "rate limit refill must be a positive finite number, got {}",
                refill_per_minute
            )));
        }
        Ok(Self {
            capacity,
            refill_per_second: refill_per_minute / 60.0,
            idle_ttl,
        })
    }

    /// Tokens a bucket holds after `tokens` have been refilled for `elapsed`.
    pub fn refill(&self, tokens: f64, elapsed: Duration) -> f64 {
        (tokens + elapsed.as_secs_f64() * self.refill_per_second).min(f64::from(self.capacity))
    }

    /// Time until a bucket holding `tokens` has one whole token.
    pub fn time_until_token(&self, tokens: f64) -> Duration {
        if tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - tokens) / self.refill_per_second)
        }
    }
}

/// Bucket state after one acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub acquired: bool,
    pub tokens: f64,
}

/// Shared storage for buckets.
#[async_trait]
pub trait RateBucketStore: Send + Sync {
    /// Refill the bucket for `key` up to `now`, then take one token if present.
    async fn try_acquire(
        &self,
        key: &str,
        config: &BucketConfig,
        now: DateTime<Utc>,
    ) -> Result<BucketState, AppError>;
}

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after: Duration,
}

impl Admission {
    fn unlimited(capacity: u32) -> Self {
        Self {
            allowed: true,
            remaining: capacity,
            retry_after: Duration::ZERO,
        }
    }

    /// Whole seconds a rejected caller should wait, never zero.
    pub fn retry_after_secs(&self) -> u64 {
        // Absorb float noise from the refill division before rounding up.
        let secs = (self.retry_after.as_secs_f64() - 1e-9).ceil() as u64;
        secs.max(1)
    }
}

pub struct RateLimiter {
    store: Arc<dyn RateBucketStore>,
    config: BucketConfig,
    clock: Arc<dyn Clock>,
    fail_open: bool,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateBucketStore>, config: BucketConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
            fail_open: true,
        }
    }

    /// Reject requests instead of admitting them when the bucket store errors.
    pub fn fail_closed(mut self) -> Self {
        self.fail_open = false;
        self
    }

    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    pub async fn check(&self, key: &str) -> Result<Admission, AppError> {
        let state = match self
            .store
            .try_acquire(key, &self.config, self.clock.now())
            .await
        {
            Ok(state) => state,
            Err(e) if self.fail_open => {
                tracing::warn!(key, error = %e, "Rate limit store unavailable, admitting request");
                return Ok(Admission::unlimited(self.config.capacity));
            }
            Err(e) => return Err(e),
        };

        let admission = Admission {
            allowed: state.acquired,
            remaining: state.tokens.max(0.0).floor() as u32,
            retry_after: if state.acquired {
                Duration::ZERO
            } else {
                self.config.time_until_token(state.tokens)
            },
        };

        if !admission.allowed {
            tracing::debug!(
                key,
                retry_after_ms = admission.retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
        }
        Ok(admission)
    }
}
