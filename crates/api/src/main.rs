//! Herald API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use herald_common::clock::SystemClock;
use herald_common::config::AppConfig;
use herald_common::db::create_pool;
use herald_common::redis_pool::create_redis_pool;
use herald_engine::rate_limit::RedisBucketStore;
use herald_engine::{PgNotificationStore, RedisDeliveryQueue};

use herald_api::middleware::auth::validator_from_config;
use herald_api::routes::create_router;
use herald_api::state::{AppState, Backends};

const QUEUE_PREFIX: &str = "herald:delivery";
const RATE_LIMIT_PREFIX: &str = "herald:ratelimit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("herald_api=debug,herald_engine=info,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Herald API server...");

    let config = AppConfig::from_env()?;
    config.validate_auth()?;

    // Connections are established lazily so the server starts degraded
    // rather than not at all when Postgres is down.
    let pool = create_pool(&config.database_url, config.db_max_connections)?;
    let redis = create_redis_pool(&config.redis_url, Duration::from_secs(2)).await?;
    tracing::info!("Backends configured");

    let clock = Arc::new(SystemClock);
    let backends = Backends {
        store: Arc::new(PgNotificationStore::new(pool)),
        queue: Arc::new(RedisDeliveryQueue::new(
            redis.clone(),
            clock.clone(),
            QUEUE_PREFIX,
        )),
        buckets: Arc::new(RedisBucketStore::new(redis, RATE_LIMIT_PREFIX)),
        clock,
    };
    let auth = validator_from_config(&config)?;
    let state = AppState::new(&config, backends, auth)?;
    let health = state.health.clone();

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.api_bind_addr).await?;
    tracing::info!("API server listening on {}", config.api_bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Received shutdown signal");
    })
    .await?;

    health.shutdown();
    tracing::info!("Herald API server stopped.");
    Ok(())
}
