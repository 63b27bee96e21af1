use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{ChannelType, Notification, NotificationFilter, NotificationStatus};

use super::NotificationStore;

/// Postgres-backed store.
///
/// Expects an existing table:
///
/// ```sql
/// notifications (
///     id uuid primary key, channel_type text, recipient text, payload jsonb,
///     status text, attempt_count int4, next_retry_at timestamptz,
///     error_message text, created_at timestamptz, updated_at timestamptz,
///     queued_at timestamptz, sent_at timestamptz, failed_at timestamptz,
///     version int8
/// )
/// ```
#[derive(Debug, Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct NotificationRow {
    id: Uuid,
    channel_type: ChannelType,
    recipient: String,
    payload: serde_json::Value,
    status: NotificationStatus,
    attempt_count: i32,
    next_retry_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    queued_at: Option<DateTime<Utc>>,
    sent_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    version: i64,
}

impl From<NotificationRow> for Notification {
    fn from(row: NotificationRow) -> Self {
        Notification {
            id: row.id,
            channel_type: row.channel_type,
            recipient: row.recipient,
            payload: row.payload,
            status: row.status,
            attempt_count: u32::try_from(row.attempt_count).unwrap_or(0),
            next_retry_at: row.next_retry_at,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
            queued_at: row.queued_at,
            sent_at: row.sent_at,
            failed_at: row.failed_at,
            version: row.version,
        }
    }
}

/// Connection-level failures mean the store is unreachable; everything else is
/// reported as a database error.
fn store_error(e: sqlx::Error) -> AppError {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => AppError::StoreUnavailable(e.to_string()),
        other => AppError::Database(other),
    }
}

fn attempt_count_param(notification: &Notification) -> i32 {
    i32::try_from(notification.attempt_count).unwrap_or(i32::MAX)
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn get(&self, id: Uuid) -> Result<Option<Notification>, AppError> {
        let row: Option<NotificationRow> =
            sqlx::query_as("SELECT * FROM notifications WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(store_error)?;

        Ok(row.map(Notification::from))
    }

    async fn insert(&self, notification: &Notification) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO notifications (
                id, channel_type, recipient, payload, status, attempt_count,
                next_retry_at, error_message, created_at, updated_at, queued_at, sent_at,
                failed_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(notification.id)
        .bind(notification.channel_type)
        .bind(&notification.recipient)
        .bind(&notification.payload)
        .bind(notification.status)
        .bind(attempt_count_param(notification))
        .bind(notification.next_retry_at)
        .bind(&notification.error_message)
        .bind(notification.created_at)
        .bind(notification.updated_at)
        .bind(notification.queued_at)
        .bind(notification.sent_at)
        .bind(notification.failed_at)
        .bind(notification.version)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(())
    }

    async fn update(&self, notification: &Notification) -> Result<Notification, AppError> {
        let row: Option<NotificationRow> = sqlx::query_as(
            r#"
            UPDATE notifications
            SET status = $2,
                attempt_count = $3,
                next_retry_at = $4,
                error_message = $5,
                updated_at = $6,
                queued_at = $7,
                sent_at = $8,
                failed_at = $9,
                version = version + 1
            WHERE id = $1 AND version = $10
            RETURNING *
            "#,
        )
        .bind(notification.id)
        .bind(notification.status)
        .bind(attempt_count_param(notification))
        .bind(notification.next_retry_at)
        .bind(&notification.error_message)
        .bind(notification.updated_at)
        .bind(notification.queued_at)
        .bind(notification.sent_at)
        .bind(notification.failed_at)
        .bind(notification.version)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        match row {
            Some(row) => Ok(row.into()),
            None => match self.get(notification.id).await? {
                Some(current) => Err(AppError::Conflict(format!(
                    "Notification {} changed (expected version {}, found {})",
                    notification.id, notification.version, current.version
                ))),
                None => Err(AppError::NotFound(format!(
                    "Notification {} not found",
                    notification.id
                ))),
            },
        }
    }

    async fn scan(&self, filter: &NotificationFilter) -> Result<Vec<Notification>, AppError> {
        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT * FROM notifications WHERE TRUE");

        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status);
        }
        if let Some(channel_type) = filter.channel_type {
            query.push(" AND channel_type = ").push_bind(channel_type);
        }
        if let Some(recipient) = &filter.recipient {
            query.push(" AND recipient = ").push_bind(recipient.clone());
        }

        query.push(" ORDER BY created_at ASC, id ASC");

        if let Some(limit) = filter.limit {
            query
                .push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        if let Some(offset) = filter.offset {
            query
                .push(" OFFSET ")
                .push_bind(i64::try_from(offset).unwrap_or(i64::MAX));
        }

        let rows: Vec<NotificationRow> = query
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;

        Ok(rows.into_iter().map(Notification::from).collect())
    }

    async fn ping(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}
