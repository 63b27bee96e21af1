use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery channel of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum ChannelType {
    Email,
    Sms,
    Push,
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelType::Email => write!(f, "EMAIL"),
            ChannelType::Sms => write!(f, "SMS"),
            ChannelType::Push => write!(f, "PUSH"),
        }
    }
}

/// Notification delivery status.
///
/// `Pending -> Queued -> Sent` on success, `Queued -> Queued` while retrying,
/// `Queued -> Failed` once attempts are exhausted or a failure is permanent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum NotificationStatus {
    Pending,
    Queued,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, NotificationStatus::Sent | NotificationStatus::Failed)
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationStatus::Pending => write!(f, "PENDING"),
            NotificationStatus::Queued => write!(f, "QUEUED"),
            NotificationStatus::Sent => write!(f, "SENT"),
            NotificationStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// A unit of outbound message work tracked through a bounded-retry lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub channel_type: ChannelType,
    pub recipient: String,
    /// Structured content used to render the message
    pub payload: serde_json::Value,
    pub status: NotificationStatus,
    pub attempt_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    /// When the notification last reached FAILED
    pub failed_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, bumped by every store write
    #[serde(skip_serializing, default)]
    pub version: i64,
}

/// Input for creating a notification.
#[derive(Debug, Clone, Deserialize)]
pub struct NewNotification {
    pub channel_type: ChannelType,
    pub recipient: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Filter for scanning notifications. Omitted fields mean "no constraint".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationFilter {
    pub status: Option<NotificationStatus>,
    pub channel_type: Option<ChannelType>,
    pub recipient: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl NotificationFilter {
    pub fn with_status(status: NotificationStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Whether a notification satisfies the non-paging constraints.
    pub fn matches(&self, notification: &Notification) -> bool {
        self.status.is_none_or(|s| s == notification.status)
            && self
                .channel_type
                .is_none_or(|c| c == notification.channel_type)
            && self
                .recipient
                .as_deref()
                .is_none_or(|r| r == notification.recipient)
    }
}

/// Queue entry referencing a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub notification_id: Uuid,
    /// The notification's `attempt_count` when this job was produced
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    /// The job is invisible to lease holders before this instant
    pub visible_at: DateTime<Utc>,
}

impl DeliveryJob {
    /// A job that is visible immediately.
    pub fn immediate(notification_id: Uuid, attempt: u32, now: DateTime<Utc>) -> Self {
        Self::delayed(notification_id, attempt, now, now)
    }

    /// Identity of the job in the queue. There is at most one live job per
    /// notification attempt.
    pub fn job_id(&self) -> String {
        format!("{}:{}", self.notification_id, self.attempt)
    }

    /// A job that becomes visible at `visible_at`.
    pub fn delayed(
        notification_id: Uuid,
        attempt: u32,
        now: DateTime<Utc>,
        visible_at: DateTime<Utc>,
    ) -> Self {
        Self {
            notification_id,
            attempt,
            enqueued_at: now,
            visible_at,
        }
    }
}

/// A job held under an exclusive, time-bounded lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeasedJob {
    pub job: DeliveryJob,
    pub lease_token: Uuid,
    pub lease_expires_at: DateTime<Utc>,
}

/// Result of a single delivery attempt as reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    TransientFailure(String),
    PermanentFailure(String),
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptOutcome::Success => write!(f, "success"),
            AttemptOutcome::TransientFailure(msg) => write!(f, "transient failure: {}", msg),
            AttemptOutcome::PermanentFailure(msg) => write!(f, "permanent failure: {}", msg),
        }
    }
}

/// Authenticated caller, produced by the auth gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub subject: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Principal {
    pub const ADMIN_ROLE: &'static str = "admin";

    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == Self::ADMIN_ROLE)
    }
}
