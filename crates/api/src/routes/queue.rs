//! Email queue routes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{DeliveryEvent, NewQueueItem, QueueItem};
use herald_engine::store::ListFilter;

use crate::compose::{self, AlertEmailRequest, TestEmailRequest};
use crate::extract::ApiJson;
use crate::middleware::auth::AuthUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/email/queue", post(enqueue_email).get(list_queue))
        .route("/api/email/queue/alert", post(enqueue_alert))
        .route("/api/email/queue/{id}", get(get_queue_item))
        .route("/api/email/test", post(enqueue_test))
        .route("/api/email/correlation/{id}", get(list_by_correlation))
}

#[derive(Debug, Serialize)]
struct EnqueuedResponse {
    id: Uuid,
}

#[derive(Debug, Serialize)]
struct QueueItemDetail {
    item: QueueItem,
    events: Vec<DeliveryEvent>,
}

/// Items owned by someone else are reported as missing.
fn visible_to(item: &QueueItem, auth: &AuthUser) -> bool {
    item.owner().is_none_or(|owner| owner == auth.scope())
}

/// POST /api/email/queue
async fn enqueue_email(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(mut request): ApiJson<NewQueueItem>,
) -> Result<(StatusCode, Json<EnqueuedResponse>), AppError> {
    request.metadata = compose::with_owner(request.metadata.take(), &auth.scope());
    let id = state.store.enqueue(request).await?;
    tracing::info!(queue_item_id = %id, user_id = %auth.user_id, "Email queued");
    Ok((StatusCode::CREATED, Json(EnqueuedResponse { id })))
}

/// POST /api/email/queue/alert
async fn enqueue_alert(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(request): ApiJson<AlertEmailRequest>,
) -> Result<(StatusCode, Json<EnqueuedResponse>), AppError> {
    let trigger_id = request.trigger_id;
    let id = state
        .store
        .enqueue(compose::alert_email(request, &auth.scope()))
        .await?;
    tracing::info!(queue_item_id = %id, trigger_id = %trigger_id, "Alert email queued");
    Ok((StatusCode::CREATED, Json(EnqueuedResponse { id })))
}

/// POST /api/email/test
async fn enqueue_test(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(request): ApiJson<TestEmailRequest>,
) -> Result<(StatusCode, Json<EnqueuedResponse>), AppError> {
    let id = state
        .store
        .enqueue(compose::test_email(request, &auth.scope()))
        .await?;
    tracing::info!(queue_item_id = %id, "Test email queued");
    Ok((StatusCode::CREATED, Json(EnqueuedResponse { id })))
}

/// GET /api/email/queue?status=&limit=&offset=
async fn list_queue(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(mut filter): Query<ListFilter>,
) -> Result<Json<Vec<QueueItem>>, AppError> {
    filter.scope = Some(auth.scope());
    Ok(Json(state.store.list(&filter).await?))
}

/// GET /api/email/queue/{id}
async fn get_queue_item(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<QueueItemDetail>, AppError> {
    let item = state.store.get(id).await?;
    if !visible_to(&item, &auth) {
        return Err(AppError::NotFound(format!("Queue item {} not found", id)));
    }
    let events = state.store.events_for(id).await?;
    Ok(Json(QueueItemDetail { item, events }))
}

/// GET /api/email/correlation/{id}
async fn list_by_correlation(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(correlation_id): Path<Uuid>,
) -> Result<Json<Vec<QueueItem>>, AppError> {
    let items = state
        .store
        .list_by_correlation(correlation_id)
        .await?
        .into_iter()
        .filter(|item| visible_to(item, &auth))
        .collect();
    Ok(Json(items))
}
