//! Token-bucket admission for write and admin endpoints.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use herald_common::config::RateLimitKey;
use herald_common::error::AppError;
use herald_common::types::Principal;

use crate::state::AppState;

pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Client address: first `X-Forwarded-For` hop, else the socket peer.
fn client_ip(request: &Request) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// Bucket key for the request, and the caller when the key came from a
/// validated token. In principal mode an unauthenticated request falls back
/// to its address; the handler rejects it anyway.
async fn bucket_key(
    state: &AppState,
    bearer: Option<String>,
    ip: String,
) -> (String, Option<Principal>) {
    if state.rate_limit_key == RateLimitKey::Principal
        && let Some(token) = bearer
        && let Ok(principal) = state.auth.validate(&token).await
    {
        return (format!("principal:{}", principal.subject), Some(principal));
    }
    (format!("ip:{}", ip), None)
}

pub async fn rate_limit(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    // The body is not Sync; no borrow of the request may live across an await.
    let bearer = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string());
    let (key, principal) = bucket_key(&state, bearer, client_ip(&request)).await;
    // The auth extractors reuse this instead of validating the token again.
    if let Some(principal) = principal {
        request.extensions_mut().insert(principal);
    }
    let path = request.uri().path().to_string();

    let admission = match state.rate_limiter.check(&key).await {
        Ok(admission) => admission,
        Err(e) => return e.into_response(),
    };

    if !admission.allowed {
        tracing::warn!(%key, %path, "Rate limit exceeded");
        return AppError::RateLimited {
            retry_after_secs: admission.retry_after_secs(),
        }
        .into_response();
    }

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(REMAINING_HEADER, HeaderValue::from(admission.remaining));
    response
}
