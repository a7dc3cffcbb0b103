//! Delivery statistics.
//!
//! Rates are computed over processed items only (`sent + delivered + bounced +
//! failed`); items still pending, retrying or in flight do not dilute them.
//! Counts are read without locking, so a snapshot taken mid-tick may lag the
//! batch being dispatched.

use std::sync::Arc;

use serde::Serialize;

use herald_common::error::AppError;
use herald_common::types::QueueStatus;

use crate::store::{EngagementCounts, QueueStore, StatusCounts};

/// Counts and rates for one scope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryStats {
    pub pending: i64,
    pub sending: i64,
    pub retry: i64,
    pub sent: i64,
    pub delivered: i64,
    pub bounced: i64,
    pub failed: i64,
    pub opened: i64,
    pub clicked: i64,
    /// `delivered / processed`, 0 when nothing was processed
    pub delivery_rate: f64,
    /// `bounced / processed`, 0 when nothing was processed
    pub bounce_rate: f64,
    /// `failed / processed`, 0 when nothing was processed
    pub failure_rate: f64,
}

impl DeliveryStats {
    pub fn from_counts(counts: &StatusCounts, engagement: EngagementCounts) -> Self {
        let sent = counts.get(QueueStatus::Sent);
        let delivered = counts.get(QueueStatus::Delivered);
        let bounced = counts.get(QueueStatus::Bounced);
        let failed = counts.get(QueueStatus::Failed);
        let processed = sent + delivered + bounced + failed;

        Self {
            pending: counts.get(QueueStatus::Pending),
            sending: counts.get(QueueStatus::Sending),
            retry: counts.get(QueueStatus::Retry),
            sent,
            delivered,
            bounced,
            failed,
            opened: engagement.opened,
            clicked: engagement.clicked,
            delivery_rate: ratio(delivered, processed),
            bounce_rate: ratio(bounced, processed),
            failure_rate: ratio(failed, processed),
        }
    }

    pub fn processed(&self) -> i64 {
        self.sent + self.delivered + self.bounced + self.failed
    }
}

fn ratio(numerator: i64, denominator: i64) -> f64 {
    if denominator <= 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Read-only statistics over the queue store.
#[derive(Debug, Clone)]
pub struct StatsAggregator {
    store: Arc<dyn QueueStore>,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    /// Compute counts and rates, optionally restricted to one owner.
    pub async fn compute_stats(&self, scope: Option<&str>) -> Result<DeliveryStats, AppError> {
        let counts = self.store.count_by_status(scope).await?;
        let engagement = self.store.engagement_counts(scope).await?;
        Ok(DeliveryStats::from_counts(&counts, engagement))
    }

    /// Raw per-status counts.
    pub async fn counts(&self, scope: Option<&str>) -> Result<StatusCounts, AppError> {
        self.store.count_by_status(scope).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use herald_common::types::NewQueueItem;

    use super::*;
    use crate::store::MemoryQueueStore;

    #[test]
    fn test_empty_scope_has_zero_rates() {
        let stats = DeliveryStats::from_counts(&StatusCounts::default(), EngagementCounts::default());
        assert_eq!(stats.delivery_rate, 0.0);
        assert_eq!(stats.bounce_rate, 0.0);
        assert_eq!(stats.failure_rate, 0.0);
        assert!(!stats.delivery_rate.is_nan());
    }

    #[test]
    fn test_rates_exclude_in_flight_items() {
        let counts: StatusCounts = vec![
            (QueueStatus::Pending, 50),
            (QueueStatus::Retry, 10),
            (QueueStatus::Sent, 2),
            (QueueStatus::Delivered, 6),
            (QueueStatus::Bounced, 1),
            (QueueStatus::Failed, 1),
        ]
        .into_iter()
        .collect();

        let stats = DeliveryStats::from_counts(&counts, EngagementCounts::default());
        assert_eq!(stats.processed(), 10);
        assert!((stats.delivery_rate - 0.6).abs() < f64::EPSILON);
        assert!((stats.bounce_rate - 0.1).abs() < f64::EPSILON);
        assert!((stats.failure_rate - 0.1).abs() < f64::EPSILON);
        assert_eq!(stats.pending, 50);
    }

    #[tokio::test]
    async fn test_compute_stats_scoped_to_owner() {
        let store = Arc::new(MemoryQueueStore::new());
        for owner in ["alice", "alice", "bob"] {
            store
                .enqueue(NewQueueItem {
                    recipient_address: format!("{}@example.com", owner),
                    subject: "Hello".to_string(),
                    template_id: "custom".to_string(),
                    metadata: Some(serde_json::json!({ "user_id": owner })),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        let claimed = store
            .claim_batch(Utc::now() + chrono::TimeDelta::seconds(1), 10)
            .await
            .unwrap();
        for item in &claimed {
            let claim = item.claim_id.unwrap();
            store
                .mark_sent(item.id, claim, Utc::now(), &item.id.to_string())
                .await
                .unwrap();
        }
        let alice_item = claimed.iter().find(|i| i.owner() == Some("alice")).unwrap();
        store.mark_delivered(alice_item.id, Utc::now()).await.unwrap();

        let aggregator = StatsAggregator::new(store);
        let alice = aggregator.compute_stats(Some("alice")).await.unwrap();
        assert_eq!(alice.sent, 1);
        assert_eq!(alice.delivered, 1);
        assert!((alice.delivery_rate - 0.5).abs() < f64::EPSILON);

        let nobody = aggregator.compute_stats(Some("carol")).await.unwrap();
        assert_eq!(nobody.processed(), 0);
        assert_eq!(nobody.delivery_rate, 0.0);
    }
}
