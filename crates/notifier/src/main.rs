use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use herald_common::clock::SystemClock;
use herald_common::config::AppConfig;
use herald_common::types::ChannelType;
use herald_common::{db, redis_pool};
use herald_engine::{
    NotificationService, PgNotificationStore, RedisDeliveryQueue, RetryPolicy, RetryScheduler,
};
use herald_notifier::emitter::{EmitterRegistry, LogEmitter, ResendEmitter};
use herald_notifier::worker::{WorkerConfig, WorkerPool};

const QUEUE_PREFIX: &str = "herald:delivery";
const DEFAULT_EMAIL_FROM: &str = "Herald <noreply@herald.local>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_notifier=info,herald_engine=info".into()),
        )
        .json()
        .init();

    tracing::info!("Herald worker starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections)?;
    let redis = redis_pool::create_redis_pool(&config.redis_url, Duration::from_secs(2)).await?;

    let clock = Arc::new(SystemClock);
    let store = Arc::new(PgNotificationStore::new(pool));
    let queue = Arc::new(RedisDeliveryQueue::new(redis, clock.clone(), QUEUE_PREFIX));
    let scheduler = RetryScheduler::new(RetryPolicy {
        max_attempts: config.max_attempts,
        base_delay: config.retry_base_delay(),
        jitter: config.retry_jitter,
        ..RetryPolicy::default()
    });
    let service = Arc::new(NotificationService::new(
        store,
        queue.clone(),
        scheduler,
        clock,
    ));

    let emitters = match &config.resend_api_key {
        Some(api_key) => {
            let from = config
                .email_from
                .clone()
                .unwrap_or_else(|| DEFAULT_EMAIL_FROM.to_string());
            let resend = ResendEmitter::new(api_key.clone(), from, config.emitter_timeout())?;
            EmitterRegistry::new().with(ChannelType::Email, Arc::new(resend))
        }
        None => {
            tracing::warn!("RESEND_API_KEY not set, emails will be logged instead of delivered");
            EmitterRegistry::new().with(ChannelType::Email, Arc::new(LogEmitter::new()))
        }
    };

    let workers = Arc::new(WorkerPool::new(
        service,
        queue,
        emitters,
        WorkerConfig {
            concurrency: config.worker_concurrency,
            lease_for: config.lease_duration(),
            poll_wait: config.poll_wait(),
            send_timeout: config.emitter_timeout(),
        },
    ));

    let shutdown = CancellationToken::new();
    let running = tokio::spawn(workers.run(shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, finishing in-flight deliveries...");
    shutdown.cancel();
    running.await?;

    tracing::info!("Herald worker stopped.");
    Ok(())
}
