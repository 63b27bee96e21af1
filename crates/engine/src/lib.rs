pub mod admin;
pub mod health;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod service;
pub mod store;
pub mod validation;

pub use admin::{AdminRecoveryService, NotificationStats, RetryStatus, RetrySummary};
pub use health::{HealthConfig, HealthMonitor, Liveness, Readiness, ReadyStatus};
pub use queue::{DeliveryQueue, InMemoryDeliveryQueue, QueueDepth, RedisDeliveryQueue};
pub use rate_limit::{Admission, BucketConfig, RateBucketStore, RateLimiter};
pub use retry::{RetryDecision, RetryPolicy, RetryScheduler};
pub use service::{AttemptRecord, NotificationService};
pub use store::{InMemoryNotificationStore, NotificationStore, PgNotificationStore};
