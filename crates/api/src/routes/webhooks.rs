//! Unauthenticated provider callbacks and tracking pings.
//!
//! Both endpoints acknowledge every request, including malformed ones, so
//! providers do not retry deliveries we cannot use.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use herald_engine::tracker::TrackingPing;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/email/webhook", post(provider_webhook))
        .route("/api/email/track/{id}", post(tracking_ping))
}

/// POST /api/email/webhook
async fn provider_webhook(State(state): State<AppState>, body: Bytes) -> Json<serde_json::Value> {
    match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(payload) => {
            let outcome = state.tracker.handle_webhook(&payload).await;
            tracing::debug!(?outcome, "Webhook processed");
        }
        Err(e) => tracing::warn!(error = %e, "Discarding unparseable webhook body"),
    }
    Json(json!({ "status": "received" }))
}

#[derive(Debug, Default, Deserialize)]
struct TrackingBody {
    #[serde(default = "default_tracking_event")]
    event_type: String,
    user_agent: Option<String>,
    click_url: Option<String>,
}

fn default_tracking_event() -> String {
    "opened".to_string()
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// POST /api/email/track/{id}
async fn tracking_ping(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Ok(queue_item_id) = Uuid::parse_str(&id) else {
        tracing::warn!(id = %id, "Tracking ping for malformed item id");
        return StatusCode::NO_CONTENT;
    };

    let body: TrackingBody = if body.is_empty() {
        TrackingBody {
            event_type: default_tracking_event(),
            ..Default::default()
        }
    } else {
        match serde_json::from_slice(&body) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unparseable tracking body");
                return StatusCode::NO_CONTENT;
            }
        }
    };

    let ip_address = header(&headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_string()));

    state
        .tracker
        .record_tracking(TrackingPing {
            queue_item_id,
            event_type: body.event_type,
            user_agent: body.user_agent.or_else(|| header(&headers, "user-agent")),
            ip_address,
            click_url: body.click_url,
        })
        .await;

    StatusCode::NO_CONTENT
}
