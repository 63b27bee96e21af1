//! Liveness and readiness probes. Both answer 200; a degraded dependency
//! shows up only in the readiness body.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use herald_engine::{Liveness, Readiness};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
}

async fn live(State(state): State<AppState>) -> Json<Liveness> {
    Json(state.health.check_live())
}

async fn ready(State(state): State<AppState>) -> Json<Readiness> {
    Json(state.health.check_ready().await)
}
