//! Admin Recovery Service: puts FAILED notifications back into the pipeline
//! and reports on the state of the backlog.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{Notification, NotificationFilter, NotificationStatus};

use crate::queue::{DeliveryQueue, QueueDepth};
use crate::service::NotificationService;

/// Page size used when walking the whole store for reports.
const SCAN_PAGE: usize = 500;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    pub queued: usize,
    pub errors: usize,
    pub total_eligible: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryStatus {
    pub failed: u64,
    pub queued: u64,
    pub pending: u64,
    /// Nothing is in flight, so a bulk retry cannot race running workers
    pub safe_to_retry: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusBreakdown {
    pub pending: u64,
    pub queued: u64,
    pub sent: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailureBreakdown {
    pub total: u64,
    pub by_error_type: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryStatistics {
    pub total_retried: u64,
    pub currently_retrying: u64,
    pub exhausted_retries: u64,
    pub average_retries_before_success: f64,
    pub retry_success_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NotificationStats {
    pub total_notifications: u64,
    pub status_breakdown: StatusBreakdown,
    pub type_breakdown: BTreeMap<String, u64>,
    pub success_rate: f64,
    pub average_send_time_seconds: f64,
    /// Mean time from creation to reaching FAILED
    pub average_failure_time_seconds: f64,
    pub failed_notifications: FailureBreakdown,
    pub retry_statistics: RetryStatistics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueDepth>,
}

/// Bucket a failure message into a coarse category for reporting.
pub fn error_category(message: Option<&str>) -> &'static str {
    let Some(message) = message.filter(|m| !m.trim().is_empty()) else {
        return "unknown";
    };
    let lower = message.to_lowercase();
    let has_any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has_any(&["smtp", "mail server"]) {
        "smtp_error"
    } else if lower.contains("invalid") && lower.contains("email") {
        "invalid_email"
    } else if has_any(&["timeout", "timed out"]) {
        "timeout"
    } else if has_any(&["connection", "network"]) {
        "connection_error"
    } else if has_any(&["authentication", "auth"]) {
        "authentication_error"
    } else if has_any(&["rate limit", "throttle"]) {
        "rate_limit"
    } else {
        "other"
    }
}

/// Failed attempts that preceded the current state.
fn failed_attempts(n: &Notification) -> u32 {
    match n.status {
        NotificationStatus::Sent => n.attempt_count.saturating_sub(1),
        _ => n.attempt_count,
    }
}

pub struct AdminRecoveryService {
    service: Arc<NotificationService>,
    queue: Arc<dyn DeliveryQueue>,
}

impl AdminRecoveryService {
    pub fn new(service: Arc<NotificationService>, queue: Arc<dyn DeliveryQueue>) -> Self {
        Self { service, queue }
    }

    /// Reset and re-enqueue FAILED notifications, oldest first.
    ///
    /// A notification that cannot be recovered is logged and counted in
    /// `errors`; it stays FAILED and the batch moves on.
    pub async fn retry_failed(&self, limit: Option<usize>) -> Result<RetrySummary, AppError> {
        let failed = self
            .service
            .list(&NotificationFilter::with_status(NotificationStatus::Failed))
            .await?;

        let total_eligible = failed.len();
        let batch = limit.unwrap_or(total_eligible).min(total_eligible);
        let mut summary = RetrySummary {
            total_eligible,
            ..RetrySummary::default()
        };

        for notification in failed.into_iter().take(batch) {
            let id = notification.id;
            match self.service.reset_failed(id).await {
                Ok(_) => summary.queued += 1,
                Err(e) => {
                    tracing::warn!(notification_id = %id, error = %e, "Failed to requeue notification");
                    summary.errors += 1;
                }
            }
        }
        summary.remaining = total_eligible - summary.queued;

        tracing::info!(
            queued = summary.queued,
            errors = summary.errors,
            total_eligible = summary.total_eligible,
            remaining = summary.remaining,
            "Bulk retry of failed notifications finished"
        );

        Ok(summary)
    }

    pub async fn retry_one(&self, id: Uuid) -> Result<Notification, AppError> {
        let requeued = self.service.reset_failed(id).await?;
        tracing::info!(notification_id = %id, "Failed notification requeued");
        Ok(requeued)
    }

    pub async fn retry_status(&self) -> Result<RetryStatus, AppError> {
        let breakdown = self.status_breakdown().await?;
        Ok(RetryStatus {
            failed: breakdown.failed,
            queued: breakdown.queued,
            pending: breakdown.pending,
            safe_to_retry: breakdown.queued == 0,
        })
    }

    async fn status_breakdown(&self) -> Result<StatusBreakdown, AppError> {
        let mut breakdown = StatusBreakdown::default();
        self.for_each_notification(|n| match n.status {
            NotificationStatus::Pending => breakdown.pending += 1,
            NotificationStatus::Queued => breakdown.queued += 1,
            NotificationStatus::Sent => breakdown.sent += 1,
            NotificationStatus::Failed => breakdown.failed += 1,
        })
        .await?;
        Ok(breakdown)
    }

    pub async fn stats(&self) -> Result<NotificationStats, AppError> {
        let mut stats = NotificationStats::default();
        let mut send_time_total = 0.0;
        let mut send_time_count = 0u64;
        let mut failure_time_total = 0.0;
        let mut failure_time_count = 0u64;
        let mut retried_and_sent = 0u64;
        let mut retries_before_success = 0u64;

        self.for_each_notification(|n| {
            stats.total_notifications += 1;
            *stats
                .type_breakdown
                .entry(n.channel_type.to_string())
                .or_default() += 1;

            let retries = failed_attempts(n);
            if retries > 0 {
                stats.retry_statistics.total_retried += 1;
            }

            match n.status {
                NotificationStatus::Pending => stats.status_breakdown.pending += 1,
                NotificationStatus::Queued => {
                    stats.status_breakdown.queued += 1;
                    if retries > 0 {
                        stats.retry_statistics.currently_retrying += 1;
                    }
                }
                NotificationStatus::Sent => {
                    stats.status_breakdown.sent += 1;
                    if let (Some(queued_at), Some(sent_at)) = (n.queued_at, n.sent_at) {
                        send_time_total += (sent_at - queued_at).num_milliseconds() as f64 / 1000.0;
                        send_time_count += 1;
                    }
                    if retries > 0 {
                        retried_and_sent += 1;
                        retries_before_success += u64::from(retries);
                    }
                }
                NotificationStatus::Failed => {
                    stats.status_breakdown.failed += 1;
                    stats.retry_statistics.exhausted_retries += 1;
                    stats.failed_notifications.total += 1;
                    if let Some(failed_at) = n.failed_at {
                        failure_time_total +=
                            (failed_at - n.created_at).num_milliseconds() as f64 / 1000.0;
                        failure_time_count += 1;
                    }
                    *stats
                        .failed_notifications
                        .by_error_type
                        .entry(error_category(n.error_message.as_deref()).to_string())
                        .or_default() += 1;
                }
            }
        })
        .await?;

        stats.success_rate = ratio(stats.status_breakdown.sent, stats.total_notifications);
        stats.average_send_time_seconds = if send_time_count > 0 {
            send_time_total / send_time_count as f64
        } else {
            0.0
        };
        stats.average_failure_time_seconds = if failure_time_count > 0 {
            failure_time_total / failure_time_count as f64
        } else {
            0.0
        };
        stats.retry_statistics.average_retries_before_success =
            ratio(retries_before_success, retried_and_sent);
        stats.retry_statistics.retry_success_rate =
            ratio(retried_and_sent, stats.retry_statistics.total_retried);

        stats.queue = match self.queue.depth().await {
            Ok(depth) => Some(depth),
            Err(e) => {
                tracing::warn!(error = %e, "Queue depth unavailable for stats");
                None
            }
        };

        Ok(stats)
    }

    async fn for_each_notification<F>(&self, mut visit: F) -> Result<(), AppError>
    where
        F: FnMut(&Notification),
    {
        let mut offset = 0;
        loop {
            let filter = NotificationFilter {
                limit: Some(SCAN_PAGE),
                offset: Some(offset),
                ..NotificationFilter::default()
            };
            let page = self.service.list(&filter).await?;
            page.iter().for_each(&mut visit);
            if page.len() < SCAN_PAGE {
                return Ok(());
            }
            offset += page.len();
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}
