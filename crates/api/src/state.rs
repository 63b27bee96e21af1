//! Shared application state for the Axum API server.

use std::sync::Arc;

use herald_common::clock::Clock;
use herald_common::config::{AppConfig, RateLimitKey};
use herald_engine::{
    AdminRecoveryService, BucketConfig, DeliveryQueue, HealthConfig, HealthMonitor,
    NotificationService, NotificationStore, RateBucketStore, RateLimiter, RetryPolicy,
    RetryScheduler,
};

use crate::middleware::auth::AuthValidator;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<NotificationService>,
    pub admin: Arc<AdminRecoveryService>,
    pub health: Arc<HealthMonitor>,
    pub rate_limiter: Arc<RateLimiter>,
    pub rate_limit_key: RateLimitKey,
    pub auth: Arc<dyn AuthValidator>,
}

/// Backends the API runs against.
pub struct Backends {
    pub store: Arc<dyn NotificationStore>,
    pub queue: Arc<dyn DeliveryQueue>,
    pub buckets: Arc<dyn RateBucketStore>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Wire services from configuration and the given backends.
    pub fn new(
        config: &AppConfig,
        backends: Backends,
        auth: Arc<dyn AuthValidator>,
    ) -> anyhow::Result<Self> {
        let Backends {
            store,
            queue,
            buckets,
            clock,
        } = backends;

        let scheduler = RetryScheduler::new(RetryPolicy {
            max_attempts: config.max_attempts,
            base_delay: config.retry_base_delay(),
            jitter: config.retry_jitter,
            ..RetryPolicy::default()
        });
        let service = Arc::new(NotificationService::new(
            store.clone(),
            queue.clone(),
            scheduler,
            clock.clone(),
        ));
        let admin = Arc::new(AdminRecoveryService::new(service.clone(), queue.clone()));
        let health = Arc::new(HealthMonitor::new(
            store,
            queue,
            HealthConfig {
                cache_ttl: config.health_cache_ttl(),
                reconnect_interval: config.health_reconnect_interval(),
                ..HealthConfig::default()
            },
        ));
        let bucket_config = BucketConfig::per_minute(
            config.rate_limit_capacity,
            config.rate_limit_refill_per_minute,
            config.rate_limit_bucket_ttl(),
        )?;
        let rate_limiter = Arc::new(RateLimiter::new(buckets, bucket_config, clock));

        Ok(Self {
            service,
            admin,
            health,
            rate_limiter,
            rate_limit_key: config.rate_limit_key,
            auth,
        })
    }
}
