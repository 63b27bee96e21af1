//! Liveness and degraded-but-available readiness.
//!
//! Readiness never fails the outer response: an unreachable dependency is
//! reported in the body while a background task keeps probing it.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use herald_common::error::AppError;

use crate::queue::DeliveryQueue;
use crate::store::NotificationStore;

pub const DATABASE: &str = "database";
pub const QUEUE: &str = "queue";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Liveness {
    pub status: &'static str,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReadyStatus {
    Ready,
    Degraded,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DependencyHealth {
    pub healthy: bool,
    pub message: String,
    pub response_time_ms: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Readiness {
    pub status: ReadyStatus,
    /// Always true: a degraded service still accepts traffic
    pub ready: bool,
    pub degraded: bool,
    pub dependencies: BTreeMap<&'static str, DependencyHealth>,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub cache_ttl: Duration,
    pub reconnect_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

type ProbeCache = Arc<Mutex<Option<(Instant, DependencyHealth)>>>;

pub struct HealthMonitor {
    store: Arc<dyn NotificationStore>,
    queue: Arc<dyn DeliveryQueue>,
    config: HealthConfig,
    database_cache: ProbeCache,
    queue_cache: ProbeCache,
    reconnecting: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        queue: Arc<dyn DeliveryQueue>,
        config: HealthConfig,
    ) -> Self {
        Self {
            store,
            queue,
            config,
            database_cache: Arc::default(),
            queue_cache: Arc::default(),
            reconnecting: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn check_live(&self) -> Liveness {
        Liveness { status: "alive" }
    }

    pub async fn check_ready(&self) -> Readiness {
        let database = self.check_database().await;
        let queue = self.check_queue().await;

        let degraded = !(database.healthy && queue.healthy);
        let mut dependencies = BTreeMap::new();
        dependencies.insert(DATABASE, database);
        dependencies.insert(QUEUE, queue);

        Readiness {
            status: if degraded {
                ReadyStatus::Degraded
            } else {
                ReadyStatus::Ready
            },
            ready: true,
            degraded,
            dependencies,
        }
    }

    /// Whether the background store reconnect task is running.
    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    /// Stop the background reconnect task, if any.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn check_database(&self) -> DependencyHealth {
        if let Some(cached) = self.cached(&self.database_cache) {
            return cached;
        }

        let health = probe("Database", self.config.probe_timeout, self.store.ping()).await;

        let was_healthy = self
            .database_cache
            .lock()
            .as_ref()
            .is_none_or(|(_, previous)| previous.healthy);
        if was_healthy && !health.healthy {
            tracing::warn!(message = %health.message, "Database connection lost, starting background monitor");
            self.start_reconnect_monitor();
        } else if !was_healthy && health.healthy {
            tracing::info!("Database connection recovered");
        }

        *self.database_cache.lock() = Some((Instant::now(), health.clone()));
        health
    }

    async fn check_queue(&self) -> DependencyHealth {
        if let Some(cached) = self.cached(&self.queue_cache) {
            return cached;
        }
        let health = probe("Queue", self.config.probe_timeout, self.queue.ping()).await;
        if !health.healthy {
            tracing::warn!(message = %health.message, "Delivery queue unreachable");
        }
        *self.queue_cache.lock() = Some((Instant::now(), health.clone()));
        health
    }

    fn cached(&self, cache: &ProbeCache) -> Option<DependencyHealth> {
        cache
            .lock()
            .as_ref()
            .filter(|(at, _)| at.elapsed() < self.config.cache_ttl)
            .map(|(_, health)| health.clone())
    }

    fn start_reconnect_monitor(&self) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let store = self.store.clone();
        let cache = self.database_cache.clone();
        let reconnecting = self.reconnecting.clone();
        let shutdown = self.shutdown.clone();
        let interval = self.config.reconnect_interval;
        let timeout = self.config.probe_timeout;

        tokio::spawn(async move {
            let mut attempts = 0u64;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                attempts += 1;
                match tokio::time::timeout(timeout, store.ping()).await {
                    Ok(Ok(())) => {
                        tracing::info!(attempts, "Database reachable again, stopping background monitor");
                        // Force the next readiness check to probe afresh.
                        *cache.lock() = None;
                        break;
                    }
                    Ok(Err(e)) => tracing::debug!(attempts, error = %e, "Database still unreachable"),
                    Err(_) => tracing::debug!(attempts, "Database probe timed out"),
                }
            }
            reconnecting.store(false, Ordering::SeqCst);
        });
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn probe<F>(name: &str, timeout: Duration, ping: F) -> DependencyHealth
where
    F: Future<Output = Result<(), AppError>>,
{
    let started = Instant::now();
    let result = tokio::time::timeout(timeout, ping).await;
    let response_time_ms = started.elapsed().as_secs_f64() * 1000.0;

    let (healthy, message) = match result {
        Ok(Ok(())) => (true, format!("{} connection successful", name)),
        Ok(Err(e)) => (false, format!("{} connection failed: {}", name, e)),
        Err(_) => (
            false,
            format!("{} probe timed out after {}ms", name, timeout.as_millis()),
        ),
    };

    DependencyHealth {
        healthy,
        message,
        response_time_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_common::clock::SystemClock;

    use crate::queue::InMemoryDeliveryQueue;
    use crate::store::InMemoryNotificationStore;

    fn monitor(
        config: HealthConfig,
    ) -> (
        HealthMonitor,
        Arc<InMemoryNotificationStore>,
        Arc<InMemoryDeliveryQueue>,
    ) {
        let store = Arc::new(InMemoryNotificationStore::new());
        let queue = Arc::new(InMemoryDeliveryQueue::new(Arc::new(SystemClock)));
        let monitor = HealthMonitor::new(store.clone(), queue.clone(), config);
        (monitor, store, queue)
    }

    fn uncached() -> HealthConfig {
        HealthConfig {
            cache_ttl: Duration::ZERO,
            reconnect_interval: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_live_is_unconditional() {
        let (monitor, store, _) = monitor(uncached());
        store.set_available(false);
        assert_eq!(monitor.check_live().status, "alive");
    }

    #[tokio::test]
    async fn test_ready_when_dependencies_reachable() {
        let (monitor, _, _) = monitor(uncached());
        let readiness = monitor.check_ready().await;
        assert_eq!(readiness.status, ReadyStatus::Ready);
        assert!(readiness.ready);
        assert!(!readiness.degraded);
        assert!(readiness.dependencies[DATABASE].healthy);
    }

    #[tokio::test]
    async fn test_store_outage_degrades_and_recovers() {
        let (monitor, store, _) = monitor(uncached());
        store.set_available(false);

        let readiness = monitor.check_ready().await;
        assert_eq!(readiness.status, ReadyStatus::Degraded);
        assert!(readiness.ready);
        assert!(readiness.degraded);
        assert!(!readiness.dependencies[DATABASE].healthy);
        assert!(monitor.is_reconnecting());

        store.set_available(true);
        for _ in 0..100 {
            if !monitor.is_reconnecting() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!monitor.is_reconnecting());
        assert_eq!(monitor.check_ready().await.status, ReadyStatus::Ready);
    }

    #[tokio::test]
    async fn test_queue_outage_degrades() {
        let (monitor, _, queue) = monitor(uncached());
        queue.set_available(false);
        let readiness = monitor.check_ready().await;
        assert!(readiness.degraded);
        assert!(!readiness.dependencies[QUEUE].healthy);
        assert!(readiness.dependencies[DATABASE].healthy);
    }

    #[tokio::test]
    async fn test_results_are_cached() {
        let config = HealthConfig {
            cache_ttl: Duration::from_secs(3600),
            ..uncached()
        };
        let (monitor, store, _) = monitor(config);

        assert_eq!(monitor.check_ready().await.status, ReadyStatus::Ready);
        store.set_available(false);
        assert_eq!(monitor.check_ready().await.status, ReadyStatus::Ready);
    }

    #[tokio::test]
    async fn test_readiness_serializes_lowercase_status() {
        let (monitor, _, _) = monitor(uncached());
        let value = serde_json::to_value(monitor.check_ready().await).unwrap();
        assert_eq!(value["status"], "ready");
        assert_eq!(value["dependencies"]["database"]["healthy"], true);
    }
}
