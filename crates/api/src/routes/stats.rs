//! Caller-scoped delivery statistics.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use herald_common::error::AppError;
use herald_engine::stats::DeliveryStats;

use crate::middleware::auth::AuthUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/email/stats", get(caller_stats))
}

/// GET /api/email/stats
async fn caller_stats(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<DeliveryStats>, AppError> {
    let stats = state.stats.compute_stats(Some(&auth.scope())).await?;
    Ok(Json(stats))
}
