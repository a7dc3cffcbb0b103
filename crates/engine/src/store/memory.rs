//! In-process queue store.
//!
//! A single async mutex serialises every operation, which gives the claim path
//! the same no-double-claim guarantee the Postgres backend gets from
//! `SKIP LOCKED`, but only within one process.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{DeliveryEvent, EventType, NewQueueItem, QueueItem, QueueStatus};

use super::{
    EngagementCounts, FailureOutcome, ListFilter, QueueStore, StatusCounts, Transition,
    dispatch_order,
};
use crate::backoff::Backoff;

#[derive(Debug, Default)]
struct State {
    items: HashMap<Uuid, QueueItem>,
    events: Vec<DeliveryEvent>,
}

impl State {
    fn claimed_item(&mut self, id: Uuid, claim_id: Uuid) -> Result<&mut QueueItem, AppError> {
        match self.items.get_mut(&id) {
            Some(item) if item.status != QueueStatus::Sending => Err(AppError::NotFound(format!(
                "Queue item {} is {}, not sending",
                id, item.status
            ))),
            Some(item) if item.claim_id != Some(claim_id) => Err(AppError::NotFound(format!(
                "Queue item {} is no longer held by claim {}",
                id, claim_id
            ))),
            Some(item) => Ok(item),
            None => Err(AppError::NotFound(format!("Queue item {} not found", id))),
        }
    }

    /// Shared `sent -> target` logic for provider confirmations.
    fn settle(
        &mut self,
        id: Uuid,
        target: QueueStatus,
        at: DateTime<Utc>,
        reason: Option<&str>,
    ) -> Result<Transition, AppError> {
        let item = self
            .items
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Queue item {} not found", id)))?;

        if item.status == target {
            return Ok(Transition::AlreadyApplied);
        }
        if item.status != QueueStatus::Sent {
            return Err(AppError::NotFound(format!(
                "Queue item {} is {}, cannot become {}",
                id, item.status, target
            )));
        }

        item.status = target;
        item.updated_at = Utc::now();
        let event_type = match target {
            QueueStatus::Delivered => {
                item.delivered_at = Some(at);
                EventType::Delivered
            }
            QueueStatus::Bounced => {
                item.error_message = reason.map(str::to_string);
                EventType::Bounced
            }
            _ => {
                item.error_message = reason.map(str::to_string);
                EventType::Failed
            }
        };

        let mut event = DeliveryEvent::new(id, event_type, json!({ "reason": reason }));
        event.occurred_at = at;
        self.events.push(event);
        Ok(Transition::Applied)
    }

    fn in_scope(item: &QueueItem, scope: Option<&str>) -> bool {
        scope.is_none_or(|owner| item.owner() == Some(owner))
    }
}

/// Queue store kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    state: Mutex<State>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite `updated_at` of an item, for exercising the stale sweep.
    pub async fn touch(&self, id: Uuid, updated_at: DateTime<Utc>) {
        if let Some(item) = self.state.lock().await.items.get_mut(&id) {
            item.updated_at = updated_at;
        }
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue(&self, item: NewQueueItem) -> Result<Uuid, AppError> {
        item.validate()?;
        let item = item.into_item(Utc::now());
        let id = item.id;
        self.state.lock().await.items.insert(id, item);
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<QueueItem, AppError> {
        self.state
            .lock()
            .await
            .items
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Queue item {} not found", id)))
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<QueueItem>, AppError> {
        let state = self.state.lock().await;
        let mut items: Vec<QueueItem> = state
            .items
            .values()
            .filter(|item| filter.status.is_none_or(|s| item.status == s))
            .filter(|item| State::in_scope(item, filter.scope.as_deref()))
            .cloned()
            .collect();
        items.sort_by(dispatch_order);
        Ok(items
            .into_iter()
            .skip(filter.offset() as usize)
            .take(filter.limit() as usize)
            .collect())
    }

    async fn list_by_correlation(&self, correlation_id: Uuid) -> Result<Vec<QueueItem>, AppError> {
        let state = self.state.lock().await;
        let mut items: Vec<QueueItem> = state
            .items
            .values()
            .filter(|item| item.correlation_id == Some(correlation_id))
            .cloned()
            .collect();
        items.sort_by_key(|item| item.created_at);
        Ok(items)
    }

    async fn find_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<QueueItem>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .items
            .values()
            .find(|item| item.provider_message_id.as_deref() == Some(provider_message_id))
            .cloned())
    }

    async fn claim_batch(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<QueueItem>, AppError> {
        let mut state = self.state.lock().await;

        let mut due: Vec<&QueueItem> = state
            .items
            .values()
            .filter(|item| {
                item.status.is_claimable()
                    && item.scheduled_at <= now
                    && item.retry_count < item.max_retries
            })
            .collect();
        due.sort_by(|a, b| dispatch_order(a, b));
        let ids: Vec<Uuid> = due.iter().take(limit as usize).map(|item| item.id).collect();

        let claimed_at = Utc::now();
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(item) = state.items.get_mut(&id) {
                item.status = QueueStatus::Sending;
                item.claim_id = Some(Uuid::new_v4());
                item.updated_at = claimed_at;
                claimed.push(item.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_sent(
        &self,
        id: Uuid,
        claim_id: Uuid,
        sent_at: DateTime<Utc>,
        provider_message_id: &str,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        let item = state.claimed_item(id, claim_id)?;
        item.status = QueueStatus::Sent;
        item.claim_id = None;
        item.sent_at = Some(sent_at);
        item.provider_message_id = Some(provider_message_id.to_string());
        item.updated_at = Utc::now();

        let mut event = DeliveryEvent::new(
            id,
            EventType::Sent,
            json!({ "provider_message_id": provider_message_id }),
        );
        event.occurred_at = sent_at;
        state.events.push(event);
        Ok(())
    }

    async fn mark_retry_or_failed(
        &self,
        id: Uuid,
        claim_id: Uuid,
        error_message: &str,
        backoff: &Backoff,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, AppError> {
        let mut state = self.state.lock().await;
        let item = state.claimed_item(id, claim_id)?;
        item.claim_id = None;

        let previous = item.retry_count;
        let retry_count = (previous + 1).min(item.max_retries);
        item.retry_count = retry_count;
        item.error_message = Some(error_message.to_string());
        item.updated_at = Utc::now();

        let outcome = if retry_count < item.max_retries {
            let next_attempt_at = backoff.next_attempt_at(now, previous);
            item.status = QueueStatus::Retry;
            item.scheduled_at = next_attempt_at;
            FailureOutcome::Retry {
                retry_count,
                next_attempt_at,
            }
        } else {
            item.status = QueueStatus::Failed;
            FailureOutcome::Failed { retry_count }
        };

        let detail = match outcome {
            FailureOutcome::Retry {
                next_attempt_at, ..
            } => json!({
                "error": error_message,
                "retry_count": retry_count,
                "next_attempt_at": next_attempt_at,
            }),
            FailureOutcome::Failed { .. } => json!({
                "error": error_message,
                "retry_count": retry_count,
                "terminal": true,
            }),
        };
        state
            .events
            .push(DeliveryEvent::new(id, EventType::Failed, detail));
        Ok(outcome)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        claim_id: Uuid,
        error_message: &str,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        let item = state.claimed_item(id, claim_id)?;
        item.status = QueueStatus::Failed;
        item.claim_id = None;
        item.retry_count = (item.retry_count + 1).min(item.max_retries);
        item.error_message = Some(error_message.to_string());
        item.updated_at = Utc::now();

        let detail = json!({
            "error": error_message,
            "retry_count": item.retry_count,
            "terminal": true,
            "permanent": true,
        });
        state
            .events
            .push(DeliveryEvent::new(id, EventType::Failed, detail));
        Ok(())
    }

    async fn mark_delivered(
        &self,
        id: Uuid,
        delivered_at: DateTime<Utc>,
    ) -> Result<Transition, AppError> {
        self.state
            .lock()
            .await
            .settle(id, QueueStatus::Delivered, delivered_at, None)
    }

    async fn mark_bounced(&self, id: Uuid, reason: &str) -> Result<Transition, AppError> {
        self.state
            .lock()
            .await
            .settle(id, QueueStatus::Bounced, Utc::now(), Some(reason))
    }

    async fn mark_rejected(&self, id: Uuid, reason: &str) -> Result<Transition, AppError> {
        self.state
            .lock()
            .await
            .settle(id, QueueStatus::Failed, Utc::now(), Some(reason))
    }

    async fn recover_stale(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, AppError> {
        let mut state = self.state.lock().await;
        let mut recovered = Vec::new();
        for item in state.items.values_mut() {
            if item.status == QueueStatus::Sending && item.updated_at < older_than {
                item.status = QueueStatus::Retry;
                item.claim_id = None;
                item.scheduled_at = now;
                item.updated_at = now;
                item.error_message = Some("claim expired".to_string());
                recovered.push(item.id);
            }
        }
        Ok(recovered)
    }

    async fn append_event(&self, event: DeliveryEvent) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if !state.items.contains_key(&event.queue_item_id) {
            return Err(AppError::NotFound(format!(
                "Queue item {} not found",
                event.queue_item_id
            )));
        }
        state.events.push(event);
        Ok(())
    }

    async fn events_for(&self, id: Uuid) -> Result<Vec<DeliveryEvent>, AppError> {
        let state = self.state.lock().await;
        let mut events: Vec<DeliveryEvent> = state
            .events
            .iter()
            .filter(|e| e.queue_item_id == id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.occurred_at);
        Ok(events)
    }

    async fn count_by_status(&self, scope: Option<&str>) -> Result<StatusCounts, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .items
            .values()
            .filter(|item| State::in_scope(item, scope))
            .map(|item| (item.status, 1))
            .collect())
    }

    async fn engagement_counts(&self, scope: Option<&str>) -> Result<EngagementCounts, AppError> {
        let state = self.state.lock().await;
        let mut opened = HashSet::new();
        let mut clicked = HashSet::new();
        for event in &state.events {
            let Some(item) = state.items.get(&event.queue_item_id) else {
                continue;
            };
            if !State::in_scope(item, scope) {
                continue;
            }
            match event.event_type {
                EventType::Opened => {
                    opened.insert(event.queue_item_id);
                }
                EventType::Clicked => {
                    clicked.insert(event.queue_item_id);
                }
                _ => {}
            }
        }
        Ok(EngagementCounts {
            opened: opened.len() as i64,
            clicked: clicked.len() as i64,
        })
    }
}
