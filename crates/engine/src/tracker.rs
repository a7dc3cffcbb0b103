//! Status tracker: reconciles provider webhooks and client tracking pings.
//!
//! Neither entry point ever reports failure to its caller. Webhook retries are
//! controlled by the provider, so anything we cannot match or apply is logged
//! and dropped. Tracking pings are append-only and never touch item status.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{DeliveryEvent, EventType, QueueItem, QueueStatus};

use crate::store::{QueueStore, Transition};

/// How a webhook identifies the item it reports on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeRef {
    ProviderMessageId(String),
    Correlation(Uuid),
}

/// What the provider reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Delivered,
    Bounced,
    Failed,
    Opened,
    Clicked,
}

impl NoticeKind {
    /// Status an item already carries once this notice has been applied.
    fn settled_status(self) -> QueueStatus {
        match self {
            NoticeKind::Delivered | NoticeKind::Opened | NoticeKind::Clicked => {
                QueueStatus::Delivered
            }
            NoticeKind::Bounced => QueueStatus::Bounced,
            NoticeKind::Failed => QueueStatus::Failed,
        }
    }
}

/// A webhook payload normalised from one of the supported dialects.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookNotice {
    pub reference: NoticeRef,
    pub kind: NoticeKind,
    pub reason: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
}

impl WebhookNotice {
    /// Parse a provider payload. Returns `None` for payloads we do not act on
    /// (unknown dialect, informational event types, missing reference).
    ///
    /// Supported dialects:
    /// - Resend: `{"type": "email.delivered", "created_at": .., "data": {"email_id": .., "bounce": {"message": ..}}}`
    /// - Generic: `{"provider_message_id" | "correlation_id": .., "status": "delivered", "reason": ..}`
    pub fn parse(payload: &Value) -> Option<Self> {
        if let Some(event_type) = payload.get("type").and_then(Value::as_str) {
            return Self::parse_resend(event_type, payload);
        }
        Self::parse_generic(payload)
    }

    fn parse_resend(event_type: &str, payload: &Value) -> Option<Self> {
        let kind = match event_type {
            "email.delivered" => NoticeKind::Delivered,
            "email.bounced" => NoticeKind::Bounced,
            "email.delivery_failed" | "email.failed" => NoticeKind::Failed,
            "email.opened" => NoticeKind::Opened,
            "email.clicked" => NoticeKind::Clicked,
            _ => return None,
        };
        let data = payload.get("data")?;
        let email_id = data.get("email_id").and_then(Value::as_str)?;

        let reason = data
            .get("bounce")
            .and_then(|b| b.get("message"))
            .or_else(|| data.get("failed").and_then(|f| f.get("reason")))
            .or_else(|| data.get("reason"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let occurred_at = payload
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc));

        Some(Self {
            reference: NoticeRef::ProviderMessageId(email_id.to_string()),
            kind,
            reason,
            occurred_at,
        })
    }

    fn parse_generic(payload: &Value) -> Option<Self> {
        #[derive(Deserialize)]
        struct Generic {
            provider_message_id: Option<String>,
            correlation_id: Option<Uuid>,
            status: String,
            reason: Option<String>,
            occurred_at: Option<DateTime<Utc>>,
        }

        let generic: Generic = serde_json::from_value(payload.clone()).ok()?;
        let kind = match generic.status.to_ascii_lowercase().as_str() {
            "delivered" => NoticeKind::Delivered,
            "bounced" | "bounce" => NoticeKind::Bounced,
            "failed" | "dropped" | "rejected" => NoticeKind::Failed,
            "opened" | "open" => NoticeKind::Opened,
            "clicked" | "click" => NoticeKind::Clicked,
            _ => return None,
        };
        let reference = match (generic.provider_message_id, generic.correlation_id) {
            (Some(id), _) if !id.is_empty() => NoticeRef::ProviderMessageId(id),
            (_, Some(correlation)) => NoticeRef::Correlation(correlation),
            _ => return None,
        };

        Some(Self {
            reference,
            kind,
            reason: generic.reason,
            occurred_at: generic.occurred_at,
        })
    }
}

/// What handling a webhook amounted to. Callers respond success regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Status transitions applied to this many items.
    Applied(usize),
    /// Every matched item already carried the reported status.
    AlreadyApplied,
    /// Tracking events recorded for this many items.
    Tracked(usize),
    /// No known item matched the reference.
    Unmatched,
    /// A correlation reference matched this many `sent` items. Nothing changed.
    Ambiguous(usize),
    /// Payload was not understood, or no transition was valid.
    Ignored,
}

/// Client-side open/click ping.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackingPing {
    pub queue_item_id: Uuid,
    pub event_type: String,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub click_url: Option<String>,
}

impl TrackingPing {
    fn event_type(&self) -> Option<EventType> {
        match self.event_type.to_ascii_lowercase().as_str() {
            "open" | "opened" => Some(EventType::Opened),
            "click" | "clicked" => Some(EventType::Clicked),
            _ => None,
        }
    }
}

/// Applies delivery confirmations and engagement events to the queue store.
#[derive(Debug, Clone)]
pub struct StatusTracker {
    store: Arc<dyn QueueStore>,
}

impl StatusTracker {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    /// Handle a provider webhook. Never fails.
    pub async fn handle_webhook(&self, payload: &Value) -> WebhookOutcome {
        let Some(notice) = WebhookNotice::parse(payload) else {
            tracing::info!("Webhook payload not actionable, dropping");
            tracing::debug!(payload = %payload, "Dropped webhook payload");
            return WebhookOutcome::Ignored;
        };

        let items = match self.resolve(&notice.reference).await {
            Ok(items) => items,
            Err(e) => {
                tracing::error!(error = %e, reference = ?notice.reference, "Webhook lookup failed");
                return WebhookOutcome::Ignored;
            }
        };

        if items.is_empty() {
            tracing::warn!(
                reference = ?notice.reference,
                kind = ?notice.kind,
                "Webhook references unknown item, dropping"
            );
            return WebhookOutcome::Unmatched;
        }

        let items = match notice.reference {
            NoticeRef::Correlation(correlation_id) => {
                match Self::correlated_target(notice.kind, items) {
                    Ok(Some(item)) => vec![item],
                    Ok(None) => {
                        tracing::info!(
                            correlation_id = %correlation_id,
                            kind = ?notice.kind,
                            "No correlated item awaiting confirmation, dropping"
                        );
                        return WebhookOutcome::Ignored;
                    }
                    Err(candidates) => {
                        tracing::warn!(
                            correlation_id = %correlation_id,
                            kind = ?notice.kind,
                            candidates,
                            "Correlation id matches several sent items, dropping"
                        );
                        return WebhookOutcome::Ambiguous(candidates);
                    }
                }
            }
            NoticeRef::ProviderMessageId(_) => items,
        };

        match notice.kind {
            NoticeKind::Opened | NoticeKind::Clicked => self.track_from_webhook(&notice, &items).await,
            _ => self.settle_from_webhook(&notice, &items).await,
        }
    }

    async fn resolve(&self, reference: &NoticeRef) -> Result<Vec<QueueItem>, AppError> {
        match reference {
            NoticeRef::ProviderMessageId(id) => Ok(self
                .store
                .find_by_provider_message_id(id)
                .await?
                .into_iter()
                .collect()),
            NoticeRef::Correlation(id) => self.store.list_by_correlation(*id).await,
        }
    }

    /// Pick the one item a correlation-scoped notice refers to.
    ///
    /// A correlation id is shared by every email of one business event, so the
    /// notice is applied only when exactly one of them is `sent`. With none
    /// `sent`, an item that already carries the settled status is returned so
    /// a duplicate notice reports `AlreadyApplied`. `Err` holds the number of
    /// competing `sent` items.
    fn correlated_target(
        kind: NoticeKind,
        items: Vec<QueueItem>,
    ) -> Result<Option<QueueItem>, usize> {
        let (mut sent, rest): (Vec<QueueItem>, Vec<QueueItem>) = items
            .into_iter()
            .partition(|item| item.status == QueueStatus::Sent);
        match sent.len() {
            0 => Ok(rest
                .into_iter()
                .find(|item| item.status == kind.settled_status())),
            1 => Ok(sent.pop()),
            n => Err(n),
        }
    }

    async fn settle_from_webhook(&self, notice: &WebhookNotice, items: &[QueueItem]) -> WebhookOutcome {
        let reason = notice.reason.as_deref().unwrap_or("reported by provider");
        let mut applied = 0usize;
        let mut already = 0usize;

        for item in items {
            let result = match notice.kind {
                NoticeKind::Delivered => {
                    let at = notice.occurred_at.unwrap_or_else(Utc::now);
                    self.store.mark_delivered(item.id, at).await
                }
                NoticeKind::Bounced => self.store.mark_bounced(item.id, reason).await,
                _ => self.store.mark_rejected(item.id, reason).await,
            };

            match result {
                Ok(Transition::Applied) => {
                    tracing::info!(item_id = %item.id, kind = ?notice.kind, "Delivery status updated");
                    applied += 1;
                }
                Ok(Transition::AlreadyApplied) => {
                    tracing::debug!(item_id = %item.id, kind = ?notice.kind, "Duplicate webhook ignored");
                    already += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        item_id = %item.id,
                        status = %item.status,
                        kind = ?notice.kind,
                        error = %e,
                        "Webhook transition not applicable"
                    );
                }
            }
        }

        if applied > 0 {
            WebhookOutcome::Applied(applied)
        } else if already > 0 {
            WebhookOutcome::AlreadyApplied
        } else {
            WebhookOutcome::Ignored
        }
    }

    async fn track_from_webhook(&self, notice: &WebhookNotice, items: &[QueueItem]) -> WebhookOutcome {
        let event_type = if notice.kind == NoticeKind::Opened {
            EventType::Opened
        } else {
            EventType::Clicked
        };

        let mut tracked = 0usize;
        for item in items {
            let mut event = DeliveryEvent::new(item.id, event_type, json!({ "source": "webhook" }));
            if let Some(at) = notice.occurred_at {
                event.occurred_at = at;
            }
            match self.store.append_event(event).await {
                Ok(()) => tracked += 1,
                Err(e) => tracing::warn!(item_id = %item.id, error = %e, "Failed to record tracking event"),
            }
        }
        WebhookOutcome::Tracked(tracked)
    }

    /// Record an open/click ping. Returns whether an event was stored; never fails.
    pub async fn record_tracking(&self, ping: TrackingPing) -> bool {
        let Some(event_type) = ping.event_type() else {
            tracing::warn!(
                item_id = %ping.queue_item_id,
                event_type = %ping.event_type,
                "Unsupported tracking event type, dropping"
            );
            return false;
        };

        let detail = json!({
            "user_agent": ping.user_agent,
            "ip_address": ping.ip_address,
            "click_url": ping.click_url,
        });
        let event = DeliveryEvent::new(ping.queue_item_id, event_type, detail);

        match self.store.append_event(event).await {
            Ok(()) => {
                tracing::debug!(item_id = %ping.queue_item_id, event_type = %event_type, "Tracking event recorded");
                true
            }
            Err(e) => {
                tracing::warn!(item_id = %ping.queue_item_id, error = %e, "Failed to record tracking event");
                false
            }
        }
    }
}
