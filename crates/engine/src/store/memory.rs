use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{Notification, NotificationFilter};

use super::NotificationStore;

/// Process-local store used by tests and single-node runs.
#[derive(Debug, Default)]
pub struct InMemoryNotificationStore {
    records: RwLock<HashMap<Uuid, Notification>>,
    unavailable: AtomicBool,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails with `StoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn check_available(&self) -> Result<(), AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::StoreUnavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn get(&self, id: Uuid) -> Result<Option<Notification>, AppError> {
        self.check_available()?;
        Ok(self.records.read().get(&id).cloned())
    }

    async fn insert(&self, notification: &Notification) -> Result<(), AppError> {
        self.check_available()?;
        let mut records = self.records.write();
        if records.contains_key(&notification.id) {
            return Err(AppError::Conflict(format!(
                "Notification {} already exists",
                notification.id
            )));
        }
        records.insert(notification.id, notification.clone());
        Ok(())
    }

    async fn update(&self, notification: &Notification) -> Result<Notification, AppError> {
        self.check_available()?;
        let mut records = self.records.write();
        let stored = records.get_mut(&notification.id).ok_or_else(|| {
            AppError::NotFound(format!("Notification {} not found", notification.id))
        })?;

        if stored.version != notification.version {
            return Err(AppError::Conflict(format!(
                "Notification {} changed (expected version {}, found {})",
                notification.id, notification.version, stored.version
            )));
        }

        let mut next = notification.clone();
        next.version += 1;
        // Identity and content are immutable after creation.
        next.channel_type = stored.channel_type;
        next.recipient = stored.recipient.clone();
        next.payload = stored.payload.clone();
        next.created_at = stored.created_at;
        *stored = next.clone();
        Ok(next)
    }

    async fn scan(&self, filter: &NotificationFilter) -> Result<Vec<Notification>, AppError> {
        self.check_available()?;
        let mut matching: Vec<Notification> = self
            .records
            .read()
            .values()
            .filter(|n| filter.matches(n))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let offset = filter.offset.unwrap_or(0);
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn ping(&self) -> Result<(), AppError> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use herald_common::types::{ChannelType, NotificationStatus};

    fn make_notification(offset_secs: i64) -> Notification {
        let now = Utc::now() + Duration::seconds(offset_secs);
        Notification {
            id: Uuid::new_v4(),
            channel_type: ChannelType::Email,
            recipient: "a@example.com".to_string(),
            payload: serde_json::json!({"subject": "x"}),
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
        }
    }

    #[tokio::test]
    async fn test_update_bumps_version() {
        let store = InMemoryNotificationStore::new();
        let n = make_notification(0);
        store.insert(&n).await.unwrap();

        let mut next = n.clone();
        next.status = NotificationStatus::Queued;
        let stored = store.update(&next).await.unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(
            store.get(n.id).await.unwrap().unwrap().status,
            NotificationStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = InMemoryNotificationStore::new();
        let n = make_notification(0);
        store.insert(&n).await.unwrap();

        let mut first = n.clone();
        first.status = NotificationStatus::Queued;
        store.update(&first).await.unwrap();

        // Second writer still holds version 0
        let mut second = n.clone();
        second.status = NotificationStatus::Failed;
        let err = store.update(&second).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let store = InMemoryNotificationStore::new();
        let err = store.update(&make_notification(0)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_scan_orders_and_pages() {
        let store = InMemoryNotificationStore::new();
        let older = make_notification(-10);
        let newer = make_notification(0);
        store.insert(&newer).await.unwrap();
        store.insert(&older).await.unwrap();

        let all = store.scan(&NotificationFilter::default()).await.unwrap();
        assert_eq!(all[0].id, older.id);

        let page = store
            .scan(&NotificationFilter {
                limit: Some(1),
                offset: Some(1),
                ..NotificationFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, newer.id);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_everything() {
        let store = InMemoryNotificationStore::new();
        store.set_available(false);
        assert!(matches!(
            store.ping().await,
            Err(AppError::StoreUnavailable(_))
        ));
        assert!(store.get(Uuid::new_v4()).await.is_err());
        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }
}
