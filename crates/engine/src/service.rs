//! Notification Service: owner of the notification state machine.
//!
//! ```text
//! PENDING ──enqueue──▶ QUEUED ──success──▶ SENT
//!                        │ ▲
//!                        │ └── transient failure, attempts left (delayed re-enqueue)
//!                        └──── attempts exhausted / permanent failure ──▶ FAILED
//! ```
//!
//! Every write is conditional on the version that was read, so concurrent
//! writers cannot both move the same notification. A writer that loses the
//! race re-reads and re-evaluates.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use herald_common::clock::Clock;
use herald_common::error::AppError;
use herald_common::types::{
    AttemptOutcome, DeliveryJob, NewNotification, Notification, NotificationFilter,
    NotificationStatus,
};

use crate::queue::DeliveryQueue;
use crate::retry::{RetryDecision, RetryScheduler};
use crate::store::NotificationStore;
use crate::validation::{validate_payload, validate_recipient};

/// Re-reads allowed after losing a version race before giving up.
const MAX_WRITE_RETRIES: usize = 5;

/// What `record_attempt_result` did with a reported outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptRecord {
    Sent(Notification),
    RetryScheduled(Notification),
    Failed(Notification),
    /// The report did not match the current attempt and was ignored.
    Stale(Notification),
}

impl AttemptRecord {
    pub fn notification(&self) -> &Notification {
        match self {
            AttemptRecord::Sent(n)
            | AttemptRecord::RetryScheduled(n)
            | AttemptRecord::Failed(n)
            | AttemptRecord::Stale(n) => n,
        }
    }
}

pub struct NotificationService {
    store: Arc<dyn NotificationStore>,
    queue: Arc<dyn DeliveryQueue>,
    scheduler: RetryScheduler,
    clock: Arc<dyn Clock>,
}

impl NotificationService {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        queue: Arc<dyn DeliveryQueue>,
        scheduler: RetryScheduler,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            queue,
            scheduler,
            clock,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.scheduler.max_attempts()
    }

    /// Validate, persist as PENDING, then enqueue.
    ///
    /// ### Errors
    /// - [AppError::Validation] when the recipient or payload is invalid; nothing is stored
    /// - [AppError::QueueUnavailable] when the queue rejects the job; the
    ///   notification stays stored as PENDING
    pub async fn create(&self, input: NewNotification) -> Result<Notification, AppError> {
        let recipient = input.recipient.trim().to_string();
        validate_recipient(input.channel_type, &recipient)?;
        validate_payload(input.channel_type, &input.payload)?;

        let now = self.clock.now();
        let notification = Notification {
            id: Uuid::new_v4(),
            channel_type: input.channel_type,
            recipient,
            payload: input.payload,
            status: NotificationStatus::Pending,
            attempt_count: 0,
            next_retry_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            queued_at: None,
            sent_at: None,
            failed_at: None,
            version: 0,
        };

        self.store.insert(&notification).await?;

        tracing::info!(
            notification_id = %notification.id,
            channel_type = %notification.channel_type,
            "Notification created"
        );

        self.enqueue(&notification).await
    }

    /// Push a delivery job and move PENDING to QUEUED.
    ///
    /// The job is pushed before the status is written, so a queue outage leaves
    /// the stored record untouched. Already queued notifications are returned
    /// unchanged.
    pub async fn enqueue(&self, notification: &Notification) -> Result<Notification, AppError> {
        match notification.status {
            NotificationStatus::Pending => {}
            NotificationStatus::Queued => {
                tracing::debug!(
                    notification_id = %notification.id,
                    "Notification already queued"
                );
                return Ok(notification.clone());
            }
            status => {
                return Err(AppError::InvalidState(format!(
                    "Notification {} is {} and cannot be enqueued",
                    notification.id, status
                )));
            }
        }

        let job = DeliveryJob::immediate(
            notification.id,
            notification.attempt_count,
            self.clock.now(),
        );
        if let Err(e) = self.queue.enqueue(job).await {
            tracing::warn!(
                notification_id = %notification.id,
                error = %e,
                "Delivery queue rejected job, notification left PENDING"
            );
            return Err(AppError::QueueUnavailable(format!(
                "Notification {} saved as PENDING but could not be queued: {}",
                notification.id, e
            )));
        }

        self.mark_queued(notification.id).await
    }

    /// PENDING -> QUEUED. A no-op for notifications that already moved on.
    ///
    /// Workers call this when they lease a job before `enqueue` recorded the
    /// transition itself.
    pub async fn mark_queued(&self, id: Uuid) -> Result<Notification, AppError> {
        for _ in 0..MAX_WRITE_RETRIES {
            let current = self.get(id).await?;
            if current.status != NotificationStatus::Pending {
                return Ok(current);
            }

            let now = self.clock.now();
            let mut next = current.clone();
            next.status = NotificationStatus::Queued;
            next.queued_at = Some(now);
            next.updated_at = now;

            match self.store.update(&next).await {
                Ok(stored) => {
                    tracing::info!(notification_id = %id, "Notification queued");
                    return Ok(stored);
                }
                Err(AppError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(AppError::Conflict(format!(
            "Notification {} kept changing while being queued",
            id
        )))
    }

    /// Apply the outcome of delivery attempt number `attempt` (the
    /// `attempt_count` the job was produced with).
    ///
    /// Reports for a notification that is not QUEUED, or whose attempt count
    /// has moved past `attempt`, are stale and ignored.
    pub async fn record_attempt_result(
        &self,
        id: Uuid,
        attempt: u32,
        outcome: AttemptOutcome,
    ) -> Result<AttemptRecord, AppError> {
        let max_attempts = self.max_attempts();

        for _ in 0..MAX_WRITE_RETRIES {
            let current = self.get(id).await?;
            if current.status != NotificationStatus::Queued || current.attempt_count != attempt {
                tracing::debug!(
                    notification_id = %id,
                    attempt,
                    status = %current.status,
                    attempt_count = current.attempt_count,
                    "Ignoring stale attempt result"
                );
                return Ok(AttemptRecord::Stale(current));
            }

            let now = self.clock.now();
            let attempts = (current.attempt_count + 1).min(max_attempts);
            let mut next = current.clone();
            next.updated_at = now;
            next.attempt_count = attempts;

            let wrap: fn(Notification) -> AttemptRecord = match &outcome {
                AttemptOutcome::Success => {
                    next.status = NotificationStatus::Sent;
                    next.sent_at = Some(now);
                    next.failed_at = None;
                    next.error_message = None;
                    next.next_retry_at = None;
                    AttemptRecord::Sent
                }
                AttemptOutcome::TransientFailure(message) => {
                    match self.scheduler.decide(attempts, now) {
                        RetryDecision::RetryAt {
                            delay,
                            next_retry_at,
                        } => {
                            next.error_message = Some(message.clone());
                            next.next_retry_at = Some(next_retry_at);

                            // The delayed job goes out before the record is
                            // written. Enqueue is idempotent per
                            // (notification, attempt), so a writer that loses
                            // the race or retries leaves no second job.
                            let job = DeliveryJob::delayed(id, attempts, now, next_retry_at);
                            self.queue.enqueue(job).await.map_err(|e| {
                                AppError::QueueUnavailable(format!(
                                    "Could not schedule retry for notification {}: {}",
                                    id, e
                                ))
                            })?;

                            tracing::warn!(
                                notification_id = %id,
                                attempt_count = attempts,
                                delay_secs = delay.as_secs(),
                                error = %message,
                                "Delivery failed, retry scheduled"
                            );
                            AttemptRecord::RetryScheduled
                        }
                        RetryDecision::GiveUp => {
                            Self::finalize_failed(
                                &mut next,
                                now,
                                format!("Failed after {} attempts: {}", attempts, message),
                            );
                            AttemptRecord::Failed
                        }
                    }
                }
                AttemptOutcome::PermanentFailure(message) => {
                    // A permanent failure exhausts the attempt budget at once.
                    next.attempt_count = max_attempts;
                    Self::finalize_failed(&mut next, now, message.clone());
                    AttemptRecord::Failed
                }
            };

            match self.store.update(&next).await {
                Ok(stored) => {
                    match stored.status {
                        NotificationStatus::Sent => tracing::info!(
                            notification_id = %id,
                            attempt_count = stored.attempt_count,
                            "Notification sent"
                        ),
                        NotificationStatus::Failed => tracing::error!(
                            notification_id = %id,
                            attempt_count = stored.attempt_count,
                            error = stored.error_message.as_deref().unwrap_or_default(),
                            "Notification failed permanently"
                        ),
                        _ => {}
                    }
                    return Ok(wrap(stored));
                }
                Err(AppError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(AppError::Conflict(format!(
            "Notification {} kept changing while recording attempt {}",
            id, attempt
        )))
    }

    fn finalize_failed(next: &mut Notification, now: DateTime<Utc>, message: String) {
        next.status = NotificationStatus::Failed;
        next.failed_at = Some(now);
        next.error_message = Some(message);
        next.next_retry_at = None;
        next.sent_at = None;
    }

    /// FAILED -> PENDING -> QUEUED as one unit, for administrative recovery.
    ///
    /// The attempt budget and error are cleared. When the queue rejects the
    /// job the reset is rolled back, so the notification is still FAILED and
    /// the next recovery run picks it up again.
    pub async fn reset_failed(&self, id: Uuid) -> Result<Notification, AppError> {
        let (failed, pending) = self.reset_to_pending(id).await?;

        match self.enqueue(&pending).await {
            Ok(queued) => Ok(queued),
            Err(e @ AppError::QueueUnavailable(_)) => {
                let mut restore = failed;
                restore.version = pending.version;
                restore.updated_at = self.clock.now();
                if let Err(rollback) = self.store.update(&restore).await {
                    tracing::error!(
                        notification_id = %id,
                        error = %rollback,
                        "Could not restore FAILED status after queue error"
                    );
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Version-conditional FAILED -> PENDING. Returns the record as it was
    /// before the reset and the stored PENDING record.
    async fn reset_to_pending(&self, id: Uuid) -> Result<(Notification, Notification), AppError> {
        for _ in 0..MAX_WRITE_RETRIES {
            let current = self.get(id).await?;
            if current.status != NotificationStatus::Failed {
                return Err(AppError::InvalidState(format!(
                    "Notification {} is {}, only FAILED notifications can be retried",
                    id, current.status
                )));
            }

            let mut reset = current.clone();
            reset.status = NotificationStatus::Pending;
            reset.attempt_count = 0;
            reset.error_message = None;
            reset.next_retry_at = None;
            reset.queued_at = None;
            reset.sent_at = None;
            reset.failed_at = None;
            reset.updated_at = self.clock.now();

            match self.store.update(&reset).await {
                Ok(pending) => return Ok((current, pending)),
                Err(AppError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(AppError::Conflict(format!(
            "Notification {} kept changing while being reset",
            id
        )))
    }

    pub async fn get(&self, id: Uuid) -> Result<Notification, AppError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))
    }

    pub async fn list(&self, filter: &NotificationFilter) -> Result<Vec<Notification>, AppError> {
        self.store.scan(filter).await
    }
}
