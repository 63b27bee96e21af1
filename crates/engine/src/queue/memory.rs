use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use herald_common::clock::Clock;
use herald_common::error::AppError;
use herald_common::types::{DeliveryJob, LeasedJob};

use super::{DeliveryQueue, QueueDepth};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Default)]
struct QueueState {
    next_seq: u64,
    waiting: Vec<(u64, DeliveryJob)>,
    leased: HashMap<Uuid, (u64, DeliveryJob, DateTime<Utc>)>,
}

impl QueueState {
    fn reclaim_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<Uuid> = self
            .leased
            .iter()
            .filter(|(_, (_, _, expires_at))| *expires_at <= now)
            .map(|(token, _)| *token)
            .collect();

        for token in expired {
            if let Some((seq, job, _)) = self.leased.remove(&token) {
                tracing::debug!(
                    notification_id = %job.notification_id,
                    "Lease expired, job visible again"
                );
                self.waiting.push((seq, job));
            }
        }
    }

    fn take_visible(&mut self, now: DateTime<Utc>) -> Option<(u64, DeliveryJob)> {
        let index = self
            .waiting
            .iter()
            .enumerate()
            .filter(|(_, (_, job))| job.visible_at <= now)
            .min_by_key(|(_, (seq, job))| (job.visible_at, *seq))
            .map(|(i, _)| i)?;
        Some(self.waiting.swap_remove(index))
    }
}

/// Process-local queue with the same lease semantics as the Redis queue.
#[derive(Debug)]
pub struct InMemoryDeliveryQueue {
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    notify: Notify,
    poll_interval: Duration,
    unavailable: AtomicBool,
}

impl InMemoryDeliveryQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate an outage: every operation fails with `QueueUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Jobs not yet acked, leased or not.
    pub fn pending_jobs(&self) -> Vec<DeliveryJob> {
        let state = self.state.lock();
        state
            .waiting
            .iter()
            .map(|(_, job)| job.clone())
            .chain(state.leased.values().map(|(_, job, _)| job.clone()))
            .collect()
    }

    fn check_available(&self) -> Result<(), AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::QueueUnavailable(
                "in-memory queue marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn try_lease(&self, lease_for: Duration) -> Option<LeasedJob> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.reclaim_expired(now);

        let (seq, job) = state.take_visible(now)?;
        let lease_token = Uuid::new_v4();
        let lease_expires_at =
            now + chrono::Duration::from_std(lease_for).unwrap_or(chrono::Duration::MAX);
        state
            .leased
            .insert(lease_token, (seq, job.clone(), lease_expires_at));

        Some(LeasedJob {
            job,
            lease_token,
            lease_expires_at,
        })
    }
}

#[async_trait]
impl DeliveryQueue for InMemoryDeliveryQueue {
    async fn enqueue(&self, job: DeliveryJob) -> Result<(), AppError> {
        self.check_available()?;
        {
            let mut state = self.state.lock();
            let same_attempt = |other: &DeliveryJob| {
                other.notification_id == job.notification_id && other.attempt == job.attempt
            };
            if state.waiting.iter().any(|(_, waiting)| same_attempt(waiting)) {
                tracing::debug!(
                    notification_id = %job.notification_id,
                    attempt = job.attempt,
                    "Job for this attempt already waiting"
                );
                return Ok(());
            }
            state.leased.retain(|_, (_, leased, _)| !same_attempt(leased));

            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiting.push((seq, job));
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn lease(
        &self,
        wait: Duration,
        lease_for: Duration,
    ) -> Result<Option<LeasedJob>, AppError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            self.check_available()?;
            if let Some(leased) = self.try_lease(lease_for) {
                return Ok(Some(leased));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let nap = self.poll_interval.min(deadline - now);
            let _ = tokio::time::timeout(nap, self.notify.notified()).await;
        }
    }

    async fn ack(&self, lease_token: Uuid) -> Result<bool, AppError> {
        self.check_available()?;
        Ok(self.state.lock().leased.remove(&lease_token).is_some())
    }

    async fn ping(&self) -> Result<(), AppError> {
        self.check_available()
    }

    async fn depth(&self) -> Result<QueueDepth, AppError> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(QueueDepth {
            waiting: state.waiting.len() as u64,
            leased: state.leased.len() as u64,
        })
    }
}
