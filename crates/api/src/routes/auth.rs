//! Token refresh for authenticated callers.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use uuid::Uuid;

use herald_common::error::AppError;

use crate::middleware::auth::{AuthUser, encode_jwt};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/auth/refresh", post(refresh_token))
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
    pub user_id: Uuid,
    pub expires_in_hours: u64,
}

/// POST /api/auth/refresh: trade a valid token for one with a fresh expiry.
async fn refresh_token(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<TokenResponse>, AppError> {
    let token = encode_jwt(
        auth.user_id,
        &state.config.jwt_secret,
        state.config.jwt_expiry_hours,
    )?;

    tracing::info!(user_id = %auth.user_id, "Token refreshed");

    Ok(Json(TokenResponse {
        token,
        user_id: auth.user_id,
        expires_in_hours: state.config.jwt_expiry_hours,
    }))
}
