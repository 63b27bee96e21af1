pub mod admin;
pub mod health;
pub mod notifications;

use axum::Router;
use axum::middleware::from_fn_with_state;

use crate::middleware::rate_limit::rate_limit;
use crate::state::AppState;

/// Build the complete API router with all routes.
pub fn create_router(state: AppState) -> Router {
    let limited = Router::new()
        .merge(notifications::write_router())
        .merge(admin::router())
        .route_layer(from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .merge(health::router())
        .merge(notifications::read_router())
        .merge(limited)
        .with_state(state)
}
