use std::time::Duration;

use redis::Client;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};

/// Create a Redis connection manager for async operations.
///
/// Startup keeps retrying until Redis answers; afterwards the manager
/// reconnects on its own and individual commands surface errors.
pub async fn create_redis_pool(
    redis_url: &str,
    retry_interval: Duration,
) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(Duration::from_secs(5))
            .set_response_timeout(Duration::from_secs(5));
        match ConnectionManager::new_with_config(client.clone(), config).await {
            Ok(manager) => {
                tracing::info!(attempt, "Connected to Redis");
                return Ok(manager);
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "Redis not reachable, retrying");
                tokio::time::sleep(retry_interval).await;
            }
        }
    }
}
