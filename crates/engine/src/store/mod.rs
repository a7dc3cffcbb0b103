//! Queue store: the durable owner of queue items and their delivery log.
//!
//! Every status change goes through this trait. Transitions are guarded by the
//! current status inside the backend, so callers never need their own locks:
//!
//! - the dispatcher moves items `pending/retry -> sending -> sent | retry | failed`
//! - the status tracker moves items `sent -> delivered | bounced | failed`
//!
//! Each transition appends the matching `DeliveryEvent` atomically with the
//! status write.
//!
//! `claim_batch` stamps every claimed item with a fresh `claim_id`. The three
//! dispatcher-side transitions only apply while that token is still current,
//! so an attempt whose claim was reverted by `recover_stale` (and possibly
//! re-claimed elsewhere) cannot overwrite the newer attempt's outcome.

pub mod memory;
pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{DeliveryEvent, NewQueueItem, QueueItem, QueueStatus};

use crate::backoff::Backoff;

pub use memory::MemoryQueueStore;
pub use postgres::PgQueueStore;

/// Default page size for `list`.
pub const DEFAULT_LIST_LIMIT: i64 = 50;
/// Largest page `list` will return.
pub const MAX_LIST_LIMIT: i64 = 500;

/// Result of applying a provider-confirmed terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The item moved from `sent` to the requested status.
    Applied,
    /// The item was already in the requested status; nothing changed.
    AlreadyApplied,
}

/// What `mark_retry_or_failed` decided for the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retry {
        retry_count: i32,
        next_attempt_at: DateTime<Utc>,
    },
    Failed {
        retry_count: i32,
    },
}

/// Filter for `list`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListFilter {
    pub status: Option<QueueStatus>,
    /// Owning identity (`metadata.user_id`)
    pub scope: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ListFilter {
    pub fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }

    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

/// Item counts per status. Every status is present, zero when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StatusCounts(HashMap<QueueStatus, i64>);

impl StatusCounts {
    pub fn get(&self, status: QueueStatus) -> i64 {
        self.0.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> i64 {
        self.0.values().sum()
    }
}

impl Default for StatusCounts {
    fn default() -> Self {
        Self(QueueStatus::ALL.into_iter().map(|s| (s, 0)).collect())
    }
}

impl FromIterator<(QueueStatus, i64)> for StatusCounts {
    fn from_iter<I: IntoIterator<Item = (QueueStatus, i64)>>(iter: I) -> Self {
        let mut counts = Self::default();
        for (status, n) in iter {
            *counts.0.entry(status).or_insert(0) += n;
        }
        counts
    }
}

/// Distinct items with at least one tracking event of each kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngagementCounts {
    pub opened: i64,
    pub clicked: i64,
}

/// Durable queue of outbound email.
#[async_trait]
pub trait QueueStore: Send + Sync + std::fmt::Debug {
    /// Insert a new `pending` item. Fails with `Validation` on bad input.
    async fn enqueue(&self, item: NewQueueItem) -> Result<Uuid, AppError>;

    async fn get(&self, id: Uuid) -> Result<QueueItem, AppError>;

    /// Items ordered by `priority DESC, scheduled_at ASC`.
    async fn list(&self, filter: &ListFilter) -> Result<Vec<QueueItem>, AppError>;

    async fn list_by_correlation(&self, correlation_id: Uuid) -> Result<Vec<QueueItem>, AppError>;

    async fn find_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<QueueItem>, AppError>;

    /// Atomically claim up to `limit` due items and flip them to `sending`.
    ///
    /// Due means `status IN (pending, retry) AND scheduled_at <= now AND
    /// retry_count < max_retries`. Returned in dispatch order:
    /// `priority DESC, scheduled_at ASC, created_at ASC`. Two concurrent
    /// callers never receive the same item. Each returned item carries a new
    /// `claim_id`.
    async fn claim_batch(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<QueueItem>, AppError>;

    /// `sending -> sent`. `NotFound` if the item is unknown, not `sending`,
    /// or held under a different claim.
    async fn mark_sent(
        &self,
        id: Uuid,
        claim_id: Uuid,
        sent_at: DateTime<Utc>,
        provider_message_id: &str,
    ) -> Result<(), AppError>;

    /// Record a retryable failure of a `sending` item: increments
    /// `retry_count`, then either re-schedules it as `retry` using `backoff`
    /// or, with the budget exhausted, moves it to `failed`. Same claim guard
    /// as `mark_sent`.
    async fn mark_retry_or_failed(
        &self,
        id: Uuid,
        claim_id: Uuid,
        error_message: &str,
        backoff: &Backoff,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, AppError>;

    /// Record a non-retryable failure: `sending -> failed` regardless of budget.
    async fn mark_failed(
        &self,
        id: Uuid,
        claim_id: Uuid,
        error_message: &str,
    ) -> Result<(), AppError>;

    /// `sent -> delivered`. Re-applying is a no-op that keeps `delivered_at`.
    async fn mark_delivered(
        &self,
        id: Uuid,
        delivered_at: DateTime<Utc>,
    ) -> Result<Transition, AppError>;

    /// `sent -> bounced`. Re-applying is a no-op.
    async fn mark_bounced(&self, id: Uuid, reason: &str) -> Result<Transition, AppError>;

    /// `sent -> failed` as reported by the provider after acceptance.
    async fn mark_rejected(&self, id: Uuid, reason: &str) -> Result<Transition, AppError>;

    /// Revert `sending` items last touched before `older_than` back to
    /// `retry`, eligible at `now`, and drop their claim. Returns the ids that
    /// were reverted.
    async fn recover_stale(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, AppError>;

    /// Append to the delivery log without touching item status.
    async fn append_event(&self, event: DeliveryEvent) -> Result<(), AppError>;

    /// Delivery log of one item, oldest first.
    async fn events_for(&self, id: Uuid) -> Result<Vec<DeliveryEvent>, AppError>;

    /// Per-status counts, optionally restricted to one owner.
    async fn count_by_status(&self, scope: Option<&str>) -> Result<StatusCounts, AppError>;

    /// Distinct opened/clicked items, optionally restricted to one owner.
    async fn engagement_counts(&self, scope: Option<&str>) -> Result<EngagementCounts, AppError>;
}

/// Shared ordering used by the claim path and `list`.
pub(crate) fn dispatch_order(a: &QueueItem, b: &QueueItem) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.scheduled_at.cmp(&b.scheduled_at))
        .then(a.created_at.cmp(&b.created_at))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_filter_clamps_limit() {
        let filter = ListFilter {
            limit: Some(10_000),
            offset: Some(-5),
            ..Default::default()
        };
        assert_eq!(filter.limit(), MAX_LIST_LIMIT);
        assert_eq!(filter.offset(), 0);
        assert_eq!(ListFilter::default().limit(), DEFAULT_LIST_LIMIT);
    }

    #[test]
    fn test_status_counts_default_to_zero() {
        let counts: StatusCounts = vec![(QueueStatus::Sent, 3), (QueueStatus::Sent, 2)]
            .into_iter()
            .collect();
        assert_eq!(counts.get(QueueStatus::Sent), 5);
        assert_eq!(counts.get(QueueStatus::Bounced), 0);
        assert_eq!(counts.total(), 5);
    }

    #[test]
    fn test_status_counts_serialize_as_map() {
        let counts: StatusCounts = vec![(QueueStatus::Failed, 1)].into_iter().collect();
        let json = serde_json::to_value(&counts).unwrap();
        assert_eq!(json["failed"], 1);
        assert_eq!(json["pending"], 0);
    }
}
