//! Delivery Queue: at-least-once work queue with leased delivery.
//!
//! A leased job stays invisible to other workers until its lease expires; a
//! job that is not acked in time becomes leasable again. Jobs can be scheduled
//! for later visibility, which is how retry backoff delays re-delivery.

mod memory;
mod redis_queue;

pub use memory::InMemoryDeliveryQueue;
pub use redis_queue::RedisDeliveryQueue;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{DeliveryJob, LeasedJob};

/// Snapshot of queue occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    /// Jobs waiting, including those scheduled for later visibility
    pub waiting: u64,
    /// Jobs currently held under a lease
    pub leased: u64,
}

#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// Add a job; it becomes leasable at `job.visible_at`.
    ///
    /// Idempotent per notification attempt ([`DeliveryJob::job_id`]): if a job
    /// for the same attempt is already waiting, the push is a no-op. If that
    /// job is leased, the lease is revoked and the job waits again with the new
    /// schedule, so the old holder's `ack` returns `false`.
    async fn enqueue(&self, job: DeliveryJob) -> Result<(), AppError>;

    /// Wait up to `wait` for a visible job and lease it for `lease_for`.
    async fn lease(
        &self,
        wait: Duration,
        lease_for: Duration,
    ) -> Result<Option<LeasedJob>, AppError>;

    /// Remove a leased job for good. Returns `false` if the lease is unknown.
    async fn ack(&self, lease_token: Uuid) -> Result<bool, AppError>;

    async fn ping(&self) -> Result<(), AppError>;

    async fn depth(&self) -> Result<QueueDepth, AppError>;
}
