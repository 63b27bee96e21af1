use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use redis::aio::ConnectionManager;

use herald_common::error::AppError;

use super::{BucketConfig, BucketState, RateBucketStore};

/// Refill and take one token in a single server-side step.
///
/// KEYS: bucket hash
/// ARGV: capacity, tokens_per_ms, now_ms, idle_ttl_ms
///
/// Token counts are returned as strings since Lua numbers are truncated to
/// integers in replies.
const ACQUIRE_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
    tokens = capacity
    ts = now
end

local elapsed = math.max(0, now - ts)
tokens = math.min(capacity, tokens + elapsed * rate)

local acquired = 0
if tokens >= 1 then
    tokens = tokens - 1
    acquired = 1
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', tostring(math.max(now, ts)))
redis.call('PEXPIRE', KEYS[1], ttl)
return {acquired, tostring(tokens)}
"#;

/// Bucket store shared by every API instance through Redis.
#[derive(Clone)]
pub struct RedisBucketStore {
    redis: ConnectionManager,
    prefix: String,
    script: Arc<Script>,
}

impl RedisBucketStore {
    pub fn new(redis: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
            script: Arc::new(Script::new(ACQUIRE_SCRIPT)),
        }
    }
}

#[async_trait]
impl RateBucketStore for RedisBucketStore {
    async fn try_acquire(
        &self,
        key: &str,
        config: &BucketConfig,
        now: DateTime<Utc>,
    ) -> Result<BucketState, AppError> {
        let ttl_ms = u64::try_from(config.idle_ttl.as_millis())
            .unwrap_or(u64::MAX)
            .max(1);

        let mut conn = self.redis.clone();
        let (acquired, tokens): (i64, String) = self
            .script
            .key(format!("{}:{}", self.prefix, key))
            .arg(config.capacity)
            .arg(config.refill_per_second / 1000.0)
            .arg(now.timestamp_millis())
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;

        let tokens = tokens
            .parse::<f64>()
            .map_err(|e| AppError::Internal(format!("Bad token count {:?}: {}", tokens, e)))?;

        Ok(BucketState {
            acquired: acquired == 1,
            tokens,
        })
    }
}
