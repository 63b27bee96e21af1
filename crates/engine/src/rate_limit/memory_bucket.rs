use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use herald_common::error::AppError;

use super::{BucketConfig, BucketState, RateBucketStore};

/// Idle buckets are swept once every this many acquires.
const SWEEP_EVERY: u64 = 1024;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill_at: DateTime<Utc>,
}

/// Process-local bucket store. The map lock is held only for the synchronous
/// refill-and-take, never across an await.
#[derive(Debug, Default)]
pub struct InMemoryBucketStore {
    buckets: Mutex<HashMap<String, Bucket>>,
    ops: AtomicU64,
}

impl InMemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn is_idle(bucket: &Bucket, config: &BucketConfig, now: DateTime<Utc>) -> bool {
    (now - bucket.last_refill_at)
        .to_std()
        .is_ok_and(|idle| idle >= config.idle_ttl)
}

#[async_trait]
impl RateBucketStore for InMemoryBucketStore {
    async fn try_acquire(
        &self,
        key: &str,
        config: &BucketConfig,
        now: DateTime<Utc>,
    ) -> Result<BucketState, AppError> {
        let mut buckets = self.buckets.lock();

        if self.ops.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            buckets.retain(|_, bucket| !is_idle(bucket, config, now));
        }

        let full = Bucket {
            tokens: f64::from(config.capacity),
            last_refill_at: now,
        };
        let bucket = buckets.entry(key.to_string()).or_insert(full);
        if is_idle(bucket, config, now) {
            *bucket = full;
        }

        // A clock that moved backwards refills nothing.
        let elapsed = (now - bucket.last_refill_at).to_std().unwrap_or_default();
        bucket.tokens = config.refill(bucket.tokens, elapsed);
        bucket.last_refill_at = now.max(bucket.last_refill_at);

        let acquired = bucket.tokens >= 1.0;
        if acquired {
            bucket.tokens -= 1.0;
        }

        Ok(BucketState {
            acquired,
            tokens: bucket.tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn config() -> BucketConfig {
        BucketConfig::per_minute(10, 10.0, Duration::from_secs(60)).unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_acquires_never_overadmit() {
        let store = Arc::new(InMemoryBucketStore::new());
        let now = Utc::now();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.try_acquire("hot", &config(), now).await.unwrap().acquired
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn test_idle_bucket_starts_full() {
        let store = InMemoryBucketStore::new();
        let start = Utc::now();
        for _ in 0..10 {
            store.try_acquire("k", &config(), start).await.unwrap();
        }

        let later = start + chrono::Duration::seconds(61);
        let state = store.try_acquire("k", &config(), later).await.unwrap();
        assert!(state.acquired);
        assert_eq!(state.tokens, 9.0);
    }

    #[tokio::test]
    async fn test_backwards_clock_does_not_refill() {
        let store = InMemoryBucketStore::new();
        let now = Utc::now();
        for _ in 0..10 {
            store.try_acquire("k", &config(), now).await.unwrap();
        }
        let earlier = now - chrono::Duration::seconds(30);
        let state = store.try_acquire("k", &config(), earlier).await.unwrap();
        assert!(!state.acquired);
    }
}
