//! Worker Pool: independent tasks that drain the delivery queue.
//!
//! Each worker leases one job at a time and reports the attempt outcome back
//! through [`NotificationService`]. A job is acked only after its outcome is
//! recorded; if recording fails the lease runs out and the job comes back.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use herald_common::error::AppError;
use herald_common::types::{AttemptOutcome, LeasedJob, Notification, NotificationStatus};
use herald_engine::{AttemptRecord, DeliveryQueue, NotificationService};

use crate::emitter::EmitterRegistry;
use crate::render::render;

/// Pause after a queue error before leasing again.
const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub lease_for: Duration,
    pub poll_wait: Duration,
    pub send_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            lease_for: Duration::from_secs(60),
            poll_wait: Duration::from_secs(2),
            send_timeout: Duration::from_secs(30),
        }
    }
}

/// What a worker did with one leased job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The attempt outcome was recorded and the job acked.
    Recorded(AttemptRecord),
    /// The job no longer matched its notification and was dropped.
    Skipped,
    /// The job was left leased so it is redelivered after expiry.
    Retained,
}

pub struct WorkerPool {
    service: Arc<NotificationService>,
    queue: Arc<dyn DeliveryQueue>,
    emitters: Arc<EmitterRegistry>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(
        service: Arc<NotificationService>,
        queue: Arc<dyn DeliveryQueue>,
        emitters: EmitterRegistry,
        config: WorkerConfig,
    ) -> Self {
        Self {
            service,
            queue,
            emitters: Arc::new(emitters),
            config,
        }
    }

    /// Run `concurrency` workers until `shutdown` fires. In-flight jobs finish
    /// before this returns.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.concurrency {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move { pool.worker_loop(worker_id, shutdown).await });
        }
        tracing::info!(concurrency = self.config.concurrency, "Worker pool started");

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
        tracing::info!("Worker pool stopped");
    }

    async fn worker_loop(&self, worker_id: usize, shutdown: CancellationToken) {
        loop {
            let leased = tokio::select! {
                _ = shutdown.cancelled() => break,
                leased = self.queue.lease(self.config.poll_wait, self.config.lease_for) => leased,
            };

            match leased {
                Ok(Some(job)) => {
                    self.process(job).await;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(worker_id, error = %e, "Failed to lease delivery job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(QUEUE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        tracing::debug!(worker_id, "Worker stopped");
    }

    /// Handle one leased job end to end.
    pub async fn process(&self, leased: LeasedJob) -> JobOutcome {
        let id = leased.job.notification_id;
        let attempt = leased.job.attempt;

        let notification = match self.service.get(id).await {
            Ok(n) => n,
            Err(AppError::NotFound(_)) => {
                tracing::warn!(notification_id = %id, "Job references unknown notification, dropping");
                self.ack(&leased).await;
                return JobOutcome::Skipped;
            }
            Err(e) => {
                tracing::warn!(notification_id = %id, error = %e, "Could not load notification, leaving job leased");
                return JobOutcome::Retained;
            }
        };

        let notification = match self.claim(notification, attempt).await {
            Ok(Some(n)) => n,
            Ok(None) => {
                self.ack(&leased).await;
                return JobOutcome::Skipped;
            }
            Err(e) => {
                tracing::warn!(notification_id = %id, error = %e, "Could not mark notification queued");
                return JobOutcome::Retained;
            }
        };

        let outcome = self.attempt(&notification).await;
        tracing::debug!(notification_id = %id, attempt, %outcome, "Delivery attempt finished");

        match self
            .service
            .record_attempt_result(id, attempt, outcome)
            .await
        {
            Ok(record) => {
                self.ack(&leased).await;
                JobOutcome::Recorded(record)
            }
            Err(e) => {
                tracing::error!(
                    notification_id = %id,
                    attempt,
                    error = %e,
                    "Failed to record attempt outcome, job will be redelivered"
                );
                JobOutcome::Retained
            }
        }
    }

    /// Decide whether the job still describes the notification's next attempt.
    async fn claim(
        &self,
        notification: Notification,
        attempt: u32,
    ) -> Result<Option<Notification>, AppError> {
        if notification.status.is_terminal() || notification.attempt_count != attempt {
            tracing::debug!(
                notification_id = %notification.id,
                status = %notification.status,
                attempt_count = notification.attempt_count,
                job_attempt = attempt,
                "Skipping stale delivery job"
            );
            return Ok(None);
        }

        if notification.status == NotificationStatus::Pending {
            let queued = self.service.mark_queued(notification.id).await?;
            if queued.status != NotificationStatus::Queued || queued.attempt_count != attempt {
                return Ok(None);
            }
            return Ok(Some(queued));
        }

        Ok(Some(notification))
    }

    async fn attempt(&self, notification: &Notification) -> AttemptOutcome {
        let Some(emitter) = self.emitters.get(notification.channel_type) else {
            return AttemptOutcome::PermanentFailure(format!(
                "No emitter configured for channel {}",
                notification.channel_type
            ));
        };

        let message = match render(notification) {
            Ok(message) => message,
            Err(e) => return AttemptOutcome::PermanentFailure(format!("Render failed: {}", e)),
        };

        match tokio::time::timeout(
            self.config.send_timeout,
            emitter.send(&notification.recipient, &message),
        )
        .await
        {
            Ok(Ok(())) => AttemptOutcome::Success,
            Ok(Err(e)) => {
                tracing::warn!(
                    notification_id = %notification.id,
                    emitter = emitter.name(),
                    error = %e,
                    "Emitter send failed"
                );
                e.classify()
            }
            Err(_) => AttemptOutcome::TransientFailure(format!(
                "Send timed out after {}ms",
                self.config.send_timeout.as_millis()
            )),
        }
    }

    async fn ack(&self, leased: &LeasedJob) {
        match self.queue.ack(leased.lease_token).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(
                notification_id = %leased.job.notification_id,
                "Lease expired before ack"
            ),
            Err(e) => tracing::warn!(
                notification_id = %leased.job.notification_id,
                error = %e,
                "Failed to ack delivery job"
            ),
        }
    }
}
