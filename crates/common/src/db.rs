use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a PostgreSQL connection pool.
///
/// The pool connects lazily so the process starts even while the database is
/// unreachable; readiness reports `degraded` until the first probe succeeds.
pub fn create_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect_lazy(database_url)?;

    tracing::info!(max_connections, "PostgreSQL pool configured");
    Ok(pool)
}
