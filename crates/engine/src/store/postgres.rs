//! PostgreSQL queue store.
//!
//! The claim path is a single `UPDATE ... FROM (SELECT ... FOR UPDATE SKIP LOCKED)`
//! statement: rows locked by a concurrent claimer are skipped rather than
//! waited on, and the status flip happens under the same row lock, so no two
//! dispatcher replicas can claim the same item.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{
    DeliveryEvent, EventType, NewQueueItem, OWNER_METADATA_KEY, QueueItem, QueueStatus,
};

use super::{
    EngagementCounts, FailureOutcome, ListFilter, QueueStore, StatusCounts, Transition,
    dispatch_order,
};
use crate::backoff::Backoff;

/// Queue store backed by the `email_queue` and `email_delivery_events` tables.
#[derive(Debug, Clone)]
pub struct PgQueueStore {
    pool: PgPool,
}

impl PgQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_event(
        tx: &mut Transaction<'_, Postgres>,
        event: &DeliveryEvent,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO email_delivery_events (id, queue_item_id, event_type, occurred_at, detail)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.id)
        .bind(event.queue_item_id)
        .bind(event.event_type.to_string())
        .bind(event.occurred_at)
        .bind(&event.detail)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Lock a `sending` row held by `claim_id` for a dispatcher-side transition.
    async fn lock_claimed(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        claim_id: Uuid,
    ) -> Result<(i32, i32), AppError> {
        let row: Option<(QueueStatus, Option<Uuid>, i32, i32)> = sqlx::query_as(
            "SELECT status, claim_id, retry_count, max_retries FROM email_queue WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;

        match row {
            Some((QueueStatus::Sending, Some(held), retry_count, max_retries)) if held == claim_id => {
                Ok((retry_count, max_retries))
            }
            Some((QueueStatus::Sending, _, _, _)) => Err(AppError::NotFound(format!(
                "Queue item {} is no longer held by claim {}",
                id, claim_id
            ))),
            Some((status, _, _, _)) => Err(AppError::NotFound(format!(
                "Queue item {} is {}, not sending",
                id, status
            ))),
            None => Err(AppError::NotFound(format!("Queue item {} not found", id))),
        }
    }

    /// Shared `sent -> target` logic for provider confirmations.
    async fn settle(
        &self,
        id: Uuid,
        target: QueueStatus,
        at: DateTime<Utc>,
        reason: Option<&str>,
    ) -> Result<Transition, AppError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(QueueStatus,)> =
            sqlx::query_as("SELECT status FROM email_queue WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        let current = match current {
            Some((status,)) => status,
            None => return Err(AppError::NotFound(format!("Queue item {} not found", id))),
        };
        if current == target {
            return Ok(Transition::AlreadyApplied);
        }
        if current != QueueStatus::Sent {
            return Err(AppError::NotFound(format!(
                "Queue item {} is {}, cannot become {}",
                id, current, target
            )));
        }

        let event_type = match target {
            QueueStatus::Delivered => {
                sqlx::query(
                    "UPDATE email_queue SET status = $2, delivered_at = $3, updated_at = NOW() WHERE id = $1",
                )
                .bind(id)
                .bind(target.to_string())
                .bind(at)
                .execute(&mut *tx)
                .await?;
                EventType::Delivered
            }
            _ => {
                sqlx::query(
                    "UPDATE email_queue SET status = $2, error_message = $3, updated_at = NOW() WHERE id = $1",
                )
                .bind(id)
                .bind(target.to_string())
                .bind(reason)
                .execute(&mut *tx)
                .await?;
                if target == QueueStatus::Bounced {
                    EventType::Bounced
                } else {
                    EventType::Failed
                }
            }
        };

        let mut event = DeliveryEvent::new(id, event_type, json!({ "reason": reason }));
        event.occurred_at = at;
        Self::insert_event(&mut tx, &event).await?;

        tx.commit().await?;
        Ok(Transition::Applied)
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn enqueue(&self, item: NewQueueItem) -> Result<Uuid, AppError> {
        item.validate()?;
        let item = item.into_item(Utc::now());

        sqlx::query(
            r#"
            INSERT INTO email_queue (
                id, recipient_address, subject, body_html, body_text, template_id,
                status, priority, scheduled_at, retry_count, max_retries,
                correlation_id, metadata, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
            "#,
        )
        .bind(item.id)
        .bind(&item.recipient_address)
        .bind(&item.subject)
        .bind(&item.body_html)
        .bind(&item.body_text)
        .bind(&item.template_id)
        .bind(item.status.to_string())
        .bind(item.priority)
        .bind(item.scheduled_at)
        .bind(item.retry_count)
        .bind(item.max_retries)
        .bind(item.correlation_id)
        .bind(&item.metadata)
        .bind(item.created_at)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            item_id = %item.id,
            priority = item.priority,
            scheduled_at = %item.scheduled_at,
            "Email queued"
        );

        Ok(item.id)
    }

    async fn get(&self, id: Uuid) -> Result<QueueItem, AppError> {
        sqlx::query_as("SELECT * FROM email_queue WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Queue item {} not found", id)))
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<QueueItem>, AppError> {
        let items: Vec<QueueItem> = sqlx::query_as(
            r#"
            SELECT * FROM email_queue
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR metadata->>$3 = $2)
            ORDER BY priority DESC, scheduled_at ASC, created_at ASC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(filter.status.map(|s| s.to_string()))
        .bind(filter.scope.as_deref())
        .bind(OWNER_METADATA_KEY)
        .bind(filter.limit())
        .bind(filter.offset())
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    async fn list_by_correlation(&self, correlation_id: Uuid) -> Result<Vec<QueueItem>, AppError> {
        let items: Vec<QueueItem> = sqlx::query_as(
            "SELECT * FROM email_queue WHERE correlation_id = $1 ORDER BY created_at ASC",
        )
        .bind(correlation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    async fn find_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<QueueItem>, AppError> {
        let item: Option<QueueItem> =
            sqlx::query_as("SELECT * FROM email_queue WHERE provider_message_id = $1")
                .bind(provider_message_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(item)
    }

    async fn claim_batch(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<QueueItem>, AppError> {
        let mut items: Vec<QueueItem> = sqlx::query_as(
            r#"
            UPDATE email_queue q
            SET status = 'sending', claim_id = gen_random_uuid(), updated_at = NOW()
            FROM (
                SELECT id FROM email_queue
                WHERE status IN ('pending', 'retry')
                  AND scheduled_at <= $1
                  AND retry_count < max_retries
                ORDER BY priority DESC, scheduled_at ASC, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            ) due
            WHERE q.id = due.id
            RETURNING q.*
            "#,
        )
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Storage(format!("claim failed: {}", e)))?;

        // RETURNING does not preserve the subquery order
        items.sort_by(dispatch_order);

        if !items.is_empty() {
            tracing::debug!(claimed = items.len(), limit, "Claimed queue items");
        }
        Ok(items)
    }

    async fn mark_sent(
        &self,
        id: Uuid,
        claim_id: Uuid,
        sent_at: DateTime<Utc>,
        provider_message_id: &str,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE email_queue
            SET status = 'sent', sent_at = $3, provider_message_id = $4,
                claim_id = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'sending' AND claim_id = $2
            "#,
        )
        .bind(id)
        .bind(claim_id)
        .bind(sent_at)
        .bind(provider_message_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "Queue item {} is not sending under claim {}",
                id, claim_id
            )));
        }

        let mut event = DeliveryEvent::new(
            id,
            EventType::Sent,
            json!({ "provider_message_id": provider_message_id }),
        );
        event.occurred_at = sent_at;
        Self::insert_event(&mut tx, &event).await?;

        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;
        let (previous, max_retries) = Self::lock_claimed(&mut tx, id, claim_id).await?;

        let retry_count = (previous + 1).min(max_retries);
        let (outcome, detail) = if retry_count < max_retries {
            let next_attempt_at = backoff.next_attempt_at(now, previous);
            sqlx::query(
                r#"
                UPDATE email_queue
                SET status = 'retry', retry_count = $2, error_message = $3,
                    scheduled_at = $4, claim_id = NULL, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(retry_count)
            .bind(error_message)
            .bind(next_attempt_at)
            .execute(&mut *tx)
            .await?;
            (
                FailureOutcome::Retry {
                    retry_count,
                    next_attempt_at,
                },
                json!({
                    "error": error_message,
                    "retry_count": retry_count,
                    "next_attempt_at": next_attempt_at,
                }),
            )
        } else {
            sqlx::query(
                r#"
                UPDATE email_queue
                SET status = 'failed', retry_count = $2, error_message = $3,
                    claim_id = NULL, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(retry_count)
            .bind(error_message)
            .execute(&mut *tx)
            .await?;
            (
                FailureOutcome::Failed { retry_count },
                json!({
                    "error": error_message,
                    "retry_count": retry_count,
                    "terminal": true,
                }),
            )
        };

        Self::insert_event(&mut tx, &DeliveryEvent::new(id, EventType::Failed, detail)).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        claim_id: Uuid,
        error_message: &str,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        let (previous, max_retries) = Self::lock_claimed(&mut tx, id, claim_id).await?;
        let retry_count = (previous + 1).min(max_retries);

        sqlx::query(
            r#"
            UPDATE email_queue
            SET status = 'failed', retry_count = $2, error_message = $3,
                claim_id = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(retry_count)
        .bind(error_message)
        .execute(&mut *tx)
        .await?;

        let detail = json!({
            "error": error_message,
            "retry_count": retry_count,
            "terminal": true,
            "permanent": true,
        });
        Self::insert_event(&mut tx, &DeliveryEvent::new(id, EventType::Failed, detail)).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn mark_delivered(
        &self,
        id: Uuid,
        delivered_at: DateTime<Utc>,
    ) -> Result<Transition, AppError> {
        self.settle(id, QueueStatus::Delivered, delivered_at, None).await
    }

    async fn mark_bounced(&self, id: Uuid, reason: &str) -> Result<Transition, AppError> {
        self.settle(id, QueueStatus::Bounced, Utc::now(), Some(reason))
            .await
    }

    async fn mark_rejected(&self, id: Uuid, reason: &str) -> Result<Transition, AppError> {
        self.settle(id, QueueStatus::Failed, Utc::now(), Some(reason))
            .await
    }

    async fn recover_stale(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, AppError> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE email_queue
            SET status = 'retry', scheduled_at = $2, updated_at = $2,
                claim_id = NULL, error_message = 'claim expired'
            WHERE id IN (
                SELECT id FROM email_queue
                WHERE status = 'sending' AND updated_at < $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            "#,
        )
        .bind(older_than)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Storage(format!("stale recovery failed: {}", e)))?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn append_event(&self, event: DeliveryEvent) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        Self::insert_event(&mut tx, &event).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn events_for(&self, id: Uuid) -> Result<Vec<DeliveryEvent>, AppError> {
        let events: Vec<DeliveryEvent> = sqlx::query_as(
            "SELECT * FROM email_delivery_events WHERE queue_item_id = $1 ORDER BY occurred_at ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    async fn count_by_status(&self, scope: Option<&str>) -> Result<StatusCounts, AppError> {
        let rows: Vec<(QueueStatus, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) FROM email_queue
            WHERE ($1::text IS NULL OR metadata->>$2 = $1)
            GROUP BY status
            "#,
        )
        .bind(scope)
        .bind(OWNER_METADATA_KEY)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn engagement_counts(&self, scope: Option<&str>) -> Result<EngagementCounts, AppError> {
        let rows: Vec<(EventType, i64)> = sqlx::query_as(
            r#"
            SELECT e.event_type, COUNT(DISTINCT e.queue_item_id)
            FROM email_delivery_events e
            JOIN email_queue q ON q.id = e.queue_item_id
            WHERE e.event_type IN ('opened', 'clicked')
              AND ($1::text IS NULL OR q.metadata->>$2 = $1)
            GROUP BY e.event_type
            "#,
        )
        .bind(scope)
        .bind(OWNER_METADATA_KEY)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = EngagementCounts::default();
        for (event_type, n) in rows {
            match event_type {
                EventType::Opened => counts.opened = n,
                EventType::Clicked => counts.clicked = n,
                _ => {}
            }
        }
        Ok(counts)
    }
}
