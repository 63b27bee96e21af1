//! Administrative recovery of failed notifications. Admin role required.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::Notification;
use herald_engine::{NotificationStats, RetryStatus, RetrySummary};

use crate::middleware::auth::AdminUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/admin/notifications/retry-failed",
            post(retry_failed),
        )
        .route("/api/admin/notifications/{id}/retry", post(retry_one))
        .route(
            "/api/admin/notifications/retry-status",
            get(retry_status),
        )
        .route("/api/admin/notifications/stats", get(stats))
}

#[derive(Debug, Deserialize)]
pub struct RetryFailedQuery {
    pub limit: Option<usize>,
}

/// POST /api/admin/notifications/retry-failed?limit=N
async fn retry_failed(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Query(query): Query<RetryFailedQuery>,
) -> Result<Json<RetrySummary>, AppError> {
    if query.limit == Some(0) {
        return Err(AppError::Validation("limit must be at least 1".to_string()));
    }
    tracing::info!(admin = %admin.subject, limit = ?query.limit, "Bulk retry requested");
    Ok(Json(state.admin.retry_failed(query.limit).await?))
}

/// POST /api/admin/notifications/:id/retry
async fn retry_one(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Notification>, AppError> {
    tracing::info!(admin = %admin.subject, notification_id = %id, "Single retry requested");
    Ok(Json(state.admin.retry_one(id).await?))
}

/// GET /api/admin/notifications/retry-status
async fn retry_status(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Json<RetryStatus>, AppError> {
    Ok(Json(state.admin.retry_status().await?))
}

/// GET /api/admin/notifications/stats
async fn stats(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Json<NotificationStats>, AppError> {
    Ok(Json(state.admin.stats().await?))
}
