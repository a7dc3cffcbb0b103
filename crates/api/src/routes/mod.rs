pub mod auth;
pub mod health;
pub mod processor;
pub mod queue;
pub mod realtime;
pub mod stats;
pub mod webhooks;

use axum::Router;

use crate::state::AppState;

/// Build the complete API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(auth::router())
        .merge(queue::router())
        .merge(stats::router())
        .merge(processor::router())
        .merge(webhooks::router())
        .merge(realtime::router())
        .with_state(state)
}
