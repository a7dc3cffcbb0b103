//! Dispatcher operator routes.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;

use herald_common::error::AppError;
use herald_engine::stats::DeliveryStats;
use herald_engine::store::StatusCounts;
use herald_notifier::dispatcher::TickReport;

use crate::middleware::auth::AuthUser;
use crate::state::AppState;

/// Channel receiving a summary after every manual dispatch.
pub const QUEUE_CHANNEL: &str = "email-queue";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/email/processor/stats", get(processor_stats))
        .route("/api/email/processor/process", post(process_queue))
}

#[derive(Debug, Serialize)]
struct ProcessorStats {
    counts: StatusCounts,
    total: i64,
    stats: DeliveryStats,
    sender: &'static str,
    dispatch_enabled: bool,
    batch_size: u32,
    concurrency: usize,
}

/// GET /api/email/processor/stats
async fn processor_stats(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> Result<Json<ProcessorStats>, AppError> {
    let counts = state.stats.counts(None).await?;
    let stats = state.stats.compute_stats(None).await?;
    let config = state.dispatcher.config();
    Ok(Json(ProcessorStats {
        total: counts.total(),
        counts,
        stats,
        sender: state.dispatcher.sender_name(),
        dispatch_enabled: state.config.dispatch_enabled,
        batch_size: config.batch_size,
        concurrency: config.concurrency,
    }))
}

/// POST /api/email/processor/process
///
/// Runs one dispatch tick immediately, independent of the background loop.
async fn process_queue(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<TickReport>, AppError> {
    tracing::info!(user_id = %auth.user_id, "Manual dispatch triggered");
    let report = state.dispatcher.tick().await?;

    let receivers = state.registry.broadcast(
        QUEUE_CHANNEL,
        json!({
            "type": "queue_processed",
            "triggered_by": auth.user_id,
            "report": report,
        }),
    );
    tracing::debug!(receivers, "Published dispatch summary");

    Ok(Json(report))
}
