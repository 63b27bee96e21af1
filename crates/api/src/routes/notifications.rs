//! Notification creation and lookup.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{
    ChannelType, NewNotification, Notification, NotificationFilter, NotificationStatus,
};

use crate::middleware::auth::AuthUser;
use crate::state::AppState;

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 200;

/// Routes that write, subject to rate limiting.
pub fn write_router() -> Router<AppState> {
    Router::new().route("/api/notifications", post(create_notification))
}

pub fn read_router() -> Router<AppState> {
    Router::new()
        .route("/api/notifications", get(list_notifications))
        .route("/api/notifications/{id}", get(get_notification))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<NotificationStatus>,
    pub channel_type: Option<ChannelType>,
    pub recipient: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct NotificationPage {
    pub items: Vec<Notification>,
    pub count: usize,
    pub limit: usize,
    pub offset: usize,
}

/// POST /api/notifications - Create and enqueue a notification.
async fn create_notification(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    Json(input): Json<NewNotification>,
) -> Result<(StatusCode, Json<Notification>), AppError> {
    let notification = state.service.create(input).await?;
    tracing::info!(
        notification_id = %notification.id,
        subject = %principal.subject,
        "Notification accepted"
    );
    Ok((StatusCode::CREATED, Json(notification)))
}

/// GET /api/notifications/:id
async fn get_notification(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Notification>, AppError> {
    Ok(Json(state.service.get(id).await?))
}

/// GET /api/notifications - Filtered, paginated listing, oldest first.
async fn list_notifications(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<NotificationPage>, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    if limit == 0 || limit > MAX_PAGE_SIZE {
        return Err(AppError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_PAGE_SIZE
        )));
    }
    let offset = query.offset.unwrap_or(0);

    let filter = NotificationFilter {
        status: query.status,
        channel_type: query.channel_type,
        recipient: query.recipient,
        limit: Some(limit),
        offset: Some(offset),
    };
    let items = state.service.list(&filter).await?;

    Ok(Json(NotificationPage {
        count: items.len(),
        items,
        limit,
        offset,
    }))
}
