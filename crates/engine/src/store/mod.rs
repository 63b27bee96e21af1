//! Notification Store: the durable record of notification state.
//!
//! The store exposes plain CRUD shapes. It never owns a schema; the Postgres
//! implementation reads and writes an externally managed `notifications` table.
//! Every update is conditional on the `version` the caller read, which is the
//! compare-and-swap the Notification Service relies on for single-writer
//! status transitions.

mod memory;
mod postgres;

pub use memory::InMemoryNotificationStore;
pub use postgres::PgNotificationStore;

use async_trait::async_trait;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{Notification, NotificationFilter};

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Notification>, AppError>;

    async fn insert(&self, notification: &Notification) -> Result<(), AppError>;

    /// Replace the mutable fields of a notification if its stored version still
    /// equals `notification.version`.
    ///
    /// Returns the stored record with the bumped version. Fails with
    /// [`AppError::Conflict`] when another writer got there first and
    /// [`AppError::NotFound`] when the record does not exist.
    async fn update(&self, notification: &Notification) -> Result<Notification, AppError>;

    /// Notifications matching `filter`, oldest first.
    async fn scan(&self, filter: &NotificationFilter) -> Result<Vec<Notification>, AppError>;

    /// Lightweight connectivity probe.
    async fn ping(&self) -> Result<(), AppError>;
}
