//! API route modules.

pub mod health;
pub mod proxy;

use axum::Router;

use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/proxy", proxy::router(&state))
        .nest("/api/health", health::router(&state))
        .nest("/health", health::liveness_router())
        .with_state(state)
}
