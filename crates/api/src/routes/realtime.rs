//! Real-time channel membership for the caller.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use herald_common::error::AppError;
use herald_engine::realtime::ChannelRegistry;

use crate::middleware::auth::AuthUser;
use crate::state::AppState;

const MAX_CHANNEL_NAME_LEN: usize = 128;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/realtime/channels", get(list_channels))
        .route(
            "/api/realtime/channels/{channel}",
            post(join_channel).delete(leave_channel),
        )
}

fn validate_channel(channel: &str, auth: &AuthUser) -> Result<(), AppError> {
    if channel.trim().is_empty() || channel.len() > MAX_CHANNEL_NAME_LEN {
        return Err(AppError::Validation(format!(
            "channel name must be 1 to {} characters",
            MAX_CHANNEL_NAME_LEN
        )));
    }
    if channel.starts_with("user:") && channel != ChannelRegistry::user_channel(&auth.scope()) {
        return Err(AppError::Validation(
            "cannot join another user's personal channel".to_string(),
        ));
    }
    Ok(())
}

/// GET /api/realtime/channels
async fn list_channels(State(state): State<AppState>, auth: AuthUser) -> Json<serde_json::Value> {
    Json(json!({ "channels": state.registry.channels_for(&auth.scope()) }))
}

/// POST /api/realtime/channels/{channel}
async fn join_channel(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(channel): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    validate_channel(&channel, &auth)?;
    let added = state.registry.register(&auth.scope(), &channel);
    Ok(Json(json!({ "channel": channel, "subscribed": true, "added": added })))
}

/// DELETE /api/realtime/channels/{channel}
async fn leave_channel(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(channel): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.registry.remove(&auth.scope(), &channel) {
        return Err(AppError::NotFound(format!(
            "Not subscribed to channel {}",
            channel
        )));
    }
    Ok(Json(json!({ "channel": channel, "subscribed": false })))
}
