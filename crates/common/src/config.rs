use std::time::Duration;

use serde::Deserialize;

/// Which authentication strategy the HTTP layer uses. Selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Validate JWTs locally with the shared secret.
    Local,
    /// Ask the authorization server's introspection endpoint.
    Introspection,
}

/// Which request attribute identifies a rate-limit bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitKey {
    /// Client IP (first `X-Forwarded-For` hop, then the peer address).
    Ip,
    /// Authenticated principal, falling back to IP for anonymous requests.
    Principal,
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (delivery queue + rate-limit buckets)
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Address the API server binds to (default: 0.0.0.0:3000)
    pub api_bind_addr: String,

    /// Authentication strategy (default: local)
    pub auth_mode: AuthMode,

    /// JWT secret for local token validation
    pub jwt_secret: String,

    /// Token introspection endpoint, required when `auth_mode = introspection`
    pub auth_introspection_url: Option<String>,

    /// Resend API key for email delivery
    pub resend_api_key: Option<String>,

    /// Email sender address
    pub email_from: Option<String>,

    /// Number of concurrent delivery workers (default: 4)
    pub worker_concurrency: usize,

    /// Visibility timeout of a leased job in seconds (default: 60)
    pub worker_lease_seconds: u64,

    /// Upper bound on a single lease wait in milliseconds (default: 2000)
    pub worker_poll_wait_ms: u64,

    /// Timeout for a single emitter send in seconds (default: 30)
    pub emitter_timeout_seconds: u64,

    /// Delivery attempts before a notification is failed (default: 3)
    pub max_attempts: u32,

    /// Backoff after the first failed attempt in seconds (default: 300)
    pub retry_base_delay_seconds: u64,

    /// Add random jitter to retry delays (default: false)
    pub retry_jitter: bool,

    /// Token bucket capacity (default: 10)
    pub rate_limit_capacity: u32,

    /// Tokens added per minute (default: 10)
    pub rate_limit_refill_per_minute: f64,

    /// Rate-limit key source (default: ip)
    pub rate_limit_key: RateLimitKey,

    /// Seconds of inactivity after which a bucket is dropped (default: 120)
    pub rate_limit_bucket_ttl_seconds: u64,

    /// How long a readiness probe result is reused, in milliseconds (default: 5000)
    pub health_cache_ttl_ms: u64,

    /// Background reconnect probe interval while degraded, in milliseconds (default: 5000)
    pub health_reconnect_interval_ms: u64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let auth_mode = match env_or("AUTH_MODE", "local").to_lowercase().as_str() {
            "local" => AuthMode::Local,
            "introspection" => AuthMode::Introspection,
            other => anyhow::bail!("AUTH_MODE must be 'local' or 'introspection', got '{other}'"),
        };

        let rate_limit_key = match env_or("RATE_LIMIT_KEY", "ip").to_lowercase().as_str() {
            "ip" => RateLimitKey::Ip,
            "principal" => RateLimitKey::Principal,
            other => anyhow::bail!("RATE_LIMIT_KEY must be 'ip' or 'principal', got '{other}'"),
        };

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: env_or("REDIS_URL", "redis://localhost:6379"),
            db_max_connections: parse_env("DB_MAX_CONNECTIONS", "20")?,
            api_bind_addr: env_or("API_BIND_ADDR", "0.0.0.0:3000"),
            auth_mode,
            jwt_secret: std::env::var("JWT_SECRET").unwrap_or_default(),
            auth_introspection_url: std::env::var("AUTH_INTROSPECTION_URL").ok(),
            resend_api_key: std::env::var("RESEND_API_KEY").ok(),
            email_from: std::env::var("EMAIL_FROM").ok(),
            worker_concurrency: parse_env("WORKER_CONCURRENCY", "4")?,
            worker_lease_seconds: parse_env("WORKER_LEASE_SECONDS", "60")?,
            worker_poll_wait_ms: parse_env("WORKER_POLL_WAIT_MS", "2000")?,
            emitter_timeout_seconds: parse_env("EMITTER_TIMEOUT_SECONDS", "30")?,
            max_attempts: parse_env("MAX_ATTEMPTS", "3")?,
            retry_base_delay_seconds: parse_env("RETRY_BASE_DELAY_SECONDS", "300")?,
            retry_jitter: parse_env("RETRY_JITTER", "false")?,
            rate_limit_capacity: parse_env("RATE_LIMIT_CAPACITY", "10")?,
            rate_limit_refill_per_minute: parse_env("RATE_LIMIT_REFILL_PER_MINUTE", "10")?,
            rate_limit_key,
            rate_limit_bucket_ttl_seconds: parse_env("RATE_LIMIT_BUCKET_TTL_SECONDS", "120")?,
            health_cache_ttl_ms: parse_env("HEALTH_CACHE_TTL_MS", "5000")?,
            health_reconnect_interval_ms: parse_env("HEALTH_RECONNECT_INTERVAL_MS", "5000")?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that cannot work at runtime.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts == 0 {
            anyhow::bail!("MAX_ATTEMPTS must be at least 1");
        }
        if self.worker_concurrency == 0 {
            anyhow::bail!("WORKER_CONCURRENCY must be at least 1");
        }
        if self.rate_limit_capacity == 0 {
            anyhow::bail!("RATE_LIMIT_CAPACITY must be at least 1");
        }
        if !self.rate_limit_refill_per_minute.is_finite() || self.rate_limit_refill_per_minute <= 0.0
        {
            anyhow::bail!("RATE_LIMIT_REFILL_PER_MINUTE must be a positive number");
        }
        if self.emitter_timeout_seconds >= self.worker_lease_seconds {
            anyhow::bail!("EMITTER_TIMEOUT_SECONDS must be shorter than WORKER_LEASE_SECONDS");
        }
        Ok(())
    }

    /// Checks only the API binary needs; workers never authenticate callers.
    pub fn validate_auth(&self) -> anyhow::Result<()> {
        match self.auth_mode {
            AuthMode::Local if self.jwt_secret.is_empty() => {
                anyhow::bail!("JWT_SECRET environment variable is required when AUTH_MODE=local")
            }
            AuthMode::Introspection if self.auth_introspection_url.is_none() => anyhow::bail!(
                "AUTH_INTROSPECTION_URL environment variable is required when AUTH_MODE=introspection"
            ),
            _ => Ok(()),
        }
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.worker_lease_seconds)
    }

    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.worker_poll_wait_ms)
    }

    pub fn emitter_timeout(&self) -> Duration {
        Duration::from_secs(self.emitter_timeout_seconds)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs(self.retry_base_delay_seconds)
    }

    pub fn rate_limit_bucket_ttl(&self) -> Duration {
        Duration::from_secs(self.rate_limit_bucket_ttl_seconds)
    }

    pub fn health_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.health_cache_ttl_ms)
    }

    pub fn health_reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.health_reconnect_interval_ms)
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(name: &str, default: &str) -> anyhow::Result<T> {
    env_or(name, default).parse().map_err(|_| {
        anyhow::anyhow!(
            "{name} must be a valid {}",
            std::any::type_name::<T>().rsplit("::").next().unwrap_or("value")
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            database_url: "postgres://unused".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            db_max_connections: 5,
            api_bind_addr: "127.0.0.1:0".to_string(),
            auth_mode: AuthMode::Local,
            jwt_secret: "secret".to_string(),
            auth_introspection_url: None,
            resend_api_key: None,
            email_from: None,
            worker_concurrency: 2,
            worker_lease_seconds: 60,
            worker_poll_wait_ms: 100,
            emitter_timeout_seconds: 5,
            max_attempts: 3,
            retry_base_delay_seconds: 300,
            retry_jitter: false,
            rate_limit_capacity: 10,
            rate_limit_refill_per_minute: 10.0,
            rate_limit_key: RateLimitKey::Ip,
            rate_limit_bucket_ttl_seconds: 120,
            health_cache_ttl_ms: 5000,
            health_reconnect_interval_ms: 5000,
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_local_auth_requires_secret() {
        let mut config = base_config();
        config.jwt_secret.clear();
        assert!(config.validate().is_ok());
        assert!(config.validate_auth().is_err());
    }

    #[test]
    fn test_introspection_requires_url() {
        let mut config = base_config();
        config.auth_mode = AuthMode::Introspection;
        assert!(config.validate_auth().is_err());
        config.auth_introspection_url = Some("http://auth/introspect".to_string());
        assert!(config.validate_auth().is_ok());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = base_config();
        config.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_send_timeout_must_fit_in_lease() {
        let mut config = base_config();
        config.emitter_timeout_seconds = config.worker_lease_seconds;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_helpers() {
        let config = base_config();
        assert_eq!(config.retry_base_delay(), Duration::from_secs(300));
        assert_eq!(config.poll_wait(), Duration::from_millis(100));
    }
}
