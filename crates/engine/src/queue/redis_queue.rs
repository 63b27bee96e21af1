use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use herald_common::clock::Clock;
use herald_common::error::AppError;
use herald_common::types::{DeliveryJob, LeasedJob};

use super::{DeliveryQueue, QueueDepth};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Reclaim expired leases, then move the earliest visible job into the leased set.
///
/// KEYS: ready, leased, jobs, tokens (job -> token), leases (token -> job)
/// ARGV: now_ms, lease_expires_ms, new_token
const LEASE_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(expired) do
    local old = redis.call('HGET', KEYS[4], id)
    if old then
        redis.call('HDEL', KEYS[5], old)
    end
    redis.call('HDEL', KEYS[4], id)
    redis.call('ZREM', KEYS[2], id)
    redis.call('ZADD', KEYS[1], ARGV[1], id)
end

local ready = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #ready == 0 then
    return false
end

local id = ready[1]
redis.call('ZREM', KEYS[1], id)
redis.call('ZADD', KEYS[2], ARGV[2], id)
redis.call('HSET', KEYS[4], id, ARGV[3])
redis.call('HSET', KEYS[5], ARGV[3], id)
return {id, redis.call('HGET', KEYS[3], id)}
"#;

/// Add a job unless one for the same attempt is already waiting. A leased job
/// for the same attempt loses its lease and waits again.
///
/// KEYS: ready, leased, jobs, tokens, leases
/// ARGV: job_id, payload, visible_ms
const ENQUEUE_SCRIPT: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
    return 0
end
local old = redis.call('HGET', KEYS[4], ARGV[1])
if old then
    redis.call('HDEL', KEYS[5], old)
    redis.call('HDEL', KEYS[4], ARGV[1])
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[2])
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
return 1
"#;

/// Delete a job if `token` is still its current lease.
///
/// KEYS: leased, jobs, tokens, leases
/// ARGV: token
const ACK_SCRIPT: &str = r#"
local id = redis.call('HGET', KEYS[4], ARGV[1])
if not id then
    return 0
end
redis.call('HDEL', KEYS[4], ARGV[1])
if redis.call('HGET', KEYS[3], id) ~= ARGV[1] then
    return 0
end
redis.call('ZREM', KEYS[1], id)
redis.call('HDEL', KEYS[2], id)
redis.call('HDEL', KEYS[3], id)
return 1
"#;

/// Redis-backed queue.
///
/// Waiting jobs live in a sorted set scored by visibility time, leased jobs in
/// a sorted set scored by lease expiry. Jobs are keyed by notification and
/// attempt. Enqueue, lease and ack run as Lua scripts so a job is never
/// handed to two lease holders at once.
#[derive(Clone)]
pub struct RedisDeliveryQueue {
    redis: ConnectionManager,
    clock: Arc<dyn Clock>,
    prefix: String,
    poll_interval: Duration,
    enqueue_script: Arc<Script>,
    lease_script: Arc<Script>,
    ack_script: Arc<Script>,
}

impl RedisDeliveryQueue {
    pub fn new(redis: ConnectionManager, clock: Arc<dyn Clock>, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            clock,
            prefix: prefix.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            enqueue_script: Arc::new(Script::new(ENQUEUE_SCRIPT)),
            lease_script: Arc::new(Script::new(LEASE_SCRIPT)),
            ack_script: Arc::new(Script::new(ACK_SCRIPT)),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }

    async fn try_lease(&self, lease_for: Duration) -> Result<Option<LeasedJob>, AppError> {
        let now = self.clock.now();
        let lease_expires_at =
            now + chrono::Duration::from_std(lease_for).unwrap_or(chrono::Duration::MAX);
        let lease_token = Uuid::new_v4();

        let mut conn = self.redis.clone();
        let leased: Option<(String, String)> = self
            .lease_script
            .key(self.key("ready"))
            .key(self.key("leased"))
            .key(self.key("jobs"))
            .key(self.key("tokens"))
            .key(self.key("leases"))
            .arg(now.timestamp_millis())
            .arg(lease_expires_at.timestamp_millis())
            .arg(lease_token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(queue_error)?;

        let Some((job_id, payload)) = leased else {
            return Ok(None);
        };

        let job: DeliveryJob = serde_json::from_str(&payload).map_err(|e| {
            AppError::Internal(format!("Corrupt delivery job {}: {}", job_id, e))
        })?;

        Ok(Some(LeasedJob {
            job,
            lease_token,
            lease_expires_at,
        }))
    }
}

fn queue_error(e: redis::RedisError) -> AppError {
    AppError::QueueUnavailable(e.to_string())
}

#[async_trait]
impl DeliveryQueue for RedisDeliveryQueue {
    async fn enqueue(&self, job: DeliveryJob) -> Result<(), AppError> {
        let payload = serde_json::to_string(&job)
            .map_err(|e| AppError::Internal(format!("Failed to encode delivery job: {}", e)))?;

        let mut conn = self.redis.clone();
        let added: i64 = self
            .enqueue_script
            .key(self.key("ready"))
            .key(self.key("leased"))
            .key(self.key("jobs"))
            .key(self.key("tokens"))
            .key(self.key("leases"))
            .arg(job.job_id())
            .arg(payload)
            .arg(job.visible_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(queue_error)?;

        tracing::debug!(
            notification_id = %job.notification_id,
            attempt = job.attempt,
            visible_at = %job.visible_at,
            duplicate = added == 0,
            "Delivery job enqueued"
        );
        Ok(())
    }

    async fn lease(
        &self,
        wait: Duration,
        lease_for: Duration,
    ) -> Result<Option<LeasedJob>, AppError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(leased) = self.try_lease(lease_for).await? {
                return Ok(Some(leased));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, lease_token: Uuid) -> Result<bool, AppError> {
        let mut conn = self.redis.clone();
        let removed: i64 = self
            .ack_script
            .key(self.key("leased"))
            .key(self.key("jobs"))
            .key(self.key("tokens"))
            .key(self.key("leases"))
            .arg(lease_token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(queue_error)?;

        Ok(removed == 1)
    }

    async fn ping(&self) -> Result<(), AppError> {
        let mut conn = self.redis.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(queue_error)?;
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth, AppError> {
        let mut conn = self.redis.clone();
        let waiting: u64 = conn.zcard(self.key("ready")).await.map_err(queue_error)?;
        let leased: u64 = conn.zcard(self.key("leased")).await.map_err(queue_error)?;
        Ok(QueueDepth { waiting, leased })
    }
}
