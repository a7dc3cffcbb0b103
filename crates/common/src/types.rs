use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Metadata key holding the owning identity of a queue item (stats/list scope).
pub const OWNER_METADATA_KEY: &str = "user_id";

/// Metadata key holding template variables for dispatch-time rendering.
pub const TEMPLATE_VARS_METADATA_KEY: &str = "template_vars";

/// Lowest accepted priority.
pub const PRIORITY_MIN: i32 = 1;
/// Default priority when the caller does not supply one.
pub const PRIORITY_NORMAL: i32 = 5;
/// Priority used for alert notifications.
pub const PRIORITY_HIGH: i32 = 10;
/// Highest accepted priority.
pub const PRIORITY_MAX: i32 = 10;

/// Default retry budget of a queue item.
pub const DEFAULT_MAX_RETRIES: i32 = 3;
/// Upper bound on a caller-supplied retry budget.
pub const MAX_RETRIES_CEILING: i32 = 25;

/// Lifecycle status of a queue item.
///
/// ```text
/// pending/retry --claim--> sending --ok--> sent --confirm--> delivered
///                                               \--bounce--> bounced
///               sending --fail, budget left--> retry
///               sending --fail, exhausted/permanent--> failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Sending,
    Sent,
    Delivered,
    Bounced,
    Failed,
    Retry,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 7] = [
        QueueStatus::Pending,
        QueueStatus::Sending,
        QueueStatus::Sent,
        QueueStatus::Delivered,
        QueueStatus::Bounced,
        QueueStatus::Failed,
        QueueStatus::Retry,
    ];

    /// No transition leaves a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QueueStatus::Delivered | QueueStatus::Bounced | QueueStatus::Failed
        )
    }

    /// Statuses the dispatcher may claim from.
    pub fn is_claimable(self) -> bool {
        matches!(self, QueueStatus::Pending | QueueStatus::Retry)
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueStatus::Pending => write!(f, "pending"),
            QueueStatus::Sending => write!(f, "sending"),
            QueueStatus::Sent => write!(f, "sent"),
            QueueStatus::Delivered => write!(f, "delivered"),
            QueueStatus::Bounced => write!(f, "bounced"),
            QueueStatus::Failed => write!(f, "failed"),
            QueueStatus::Retry => write!(f, "retry"),
        }
    }
}

impl FromStr for QueueStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueStatus::ALL
            .into_iter()
            .find(|status| status.to_string() == s)
            .ok_or_else(|| AppError::Validation(format!("Unknown queue status '{}'", s)))
    }
}

/// Types of entries in the append-only delivery event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Sent,
    Delivered,
    Bounced,
    Failed,
    Opened,
    Clicked,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Sent => write!(f, "sent"),
            EventType::Delivered => write!(f, "delivered"),
            EventType::Bounced => write!(f, "bounced"),
            EventType::Failed => write!(f, "failed"),
            EventType::Opened => write!(f, "opened"),
            EventType::Clicked => write!(f, "clicked"),
        }
    }
}

/// One outbound email in the delivery queue.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueueItem {
    pub id: Uuid,
    pub recipient_address: String,
    /// Subject after template substitution
    pub subject: String,
    /// HTML body after template substitution
    pub body_html: String,
    /// Plain-text body after template substitution
    pub body_text: Option<String>,
    /// Reference into the external template store
    pub template_id: String,
    pub status: QueueStatus,
    /// Higher is more urgent
    pub priority: i32,
    /// Earliest eligible dispatch time
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    /// Last failure reason
    pub error_message: Option<String>,
    /// Business event that produced this item (e.g. an alert trigger)
    pub correlation_id: Option<Uuid>,
    /// Id assigned by the provider on a successful send
    pub provider_message_id: Option<String>,
    /// Token of the dispatcher attempt holding the current `sending` claim
    pub claim_id: Option<Uuid>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    /// Owning identity recorded in the metadata, if any.
    pub fn owner(&self) -> Option<&str> {
        self.metadata
            .get(OWNER_METADATA_KEY)
            .and_then(|v| v.as_str())
    }

    /// Template variables recorded in the metadata. Non-string values are
    /// stringified; `null` becomes the empty string.
    pub fn template_vars(&self) -> HashMap<String, String> {
        self.metadata
            .get(TEMPLATE_VARS_METADATA_KEY)
            .and_then(|v| v.as_object())
            .map(|vars| {
                vars.iter()
                    .map(|(k, v)| {
                        let value = match v {
                            serde_json::Value::String(s) => s.clone(),
                            serde_json::Value::Null => String::new(),
                            other => other.to_string(),
                        };
                        (k.clone(), value)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Append-only audit record of something that happened to a queue item.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryEvent {
    pub id: Uuid,
    pub queue_item_id: Uuid,
    pub event_type: EventType,
    pub occurred_at: DateTime<Utc>,
    /// Error text, user agent, click target, ...
    pub detail: serde_json::Value,
}

impl DeliveryEvent {
    pub fn new(queue_item_id: Uuid, event_type: EventType, detail: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue_item_id,
            event_type,
            occurred_at: Utc::now(),
            detail,
        }
    }
}

/// Enqueue request (see `QueueStore::enqueue`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewQueueItem {
    #[serde(default)]
    pub recipient_address: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body_html: String,
    pub body_text: Option<String>,
    #[serde(default)]
    pub template_id: String,
    pub priority: Option<i32>,
    pub max_retries: Option<i32>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub correlation_id: Option<Uuid>,
    pub metadata: Option<serde_json::Value>,
}

impl NewQueueItem {
    /// Reject malformed input before it reaches storage.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.recipient_address.trim().is_empty() {
            return Err(AppError::Validation(
                "recipient_address must not be empty".to_string(),
            ));
        }
        if self.subject.trim().is_empty() {
            return Err(AppError::Validation("subject must not be empty".to_string()));
        }
        if let Some(priority) = self.priority
            && !(PRIORITY_MIN..=PRIORITY_MAX).contains(&priority)
        {
            return Err(AppError::Validation(format!(
                "priority must be between {} and {}, got {}",
                PRIORITY_MIN, PRIORITY_MAX, priority
            )));
        }
        if let Some(max_retries) = self.max_retries
            && !(1..=MAX_RETRIES_CEILING).contains(&max_retries)
        {
            return Err(AppError::Validation(format!(
                "max_retries must be between 1 and {}, got {}",
                MAX_RETRIES_CEILING, max_retries
            )));
        }
        if let Some(metadata) = &self.metadata
            && !metadata.is_object()
        {
            return Err(AppError::Validation(
                "metadata must be a JSON object".to_string(),
            ));
        }
        Ok(())
    }

    /// Materialise the row written by `enqueue`, applying defaults.
    pub fn into_item(self, now: DateTime<Utc>) -> QueueItem {
        QueueItem {
            id: Uuid::new_v4(),
            recipient_address: self.recipient_address.trim().to_string(),
            subject: self.subject,
            body_html: self.body_html,
            body_text: self.body_text,
            template_id: self.template_id,
            status: QueueStatus::Pending,
            priority: self.priority.unwrap_or(PRIORITY_NORMAL),
            scheduled_at: self.scheduled_at.unwrap_or(now),
            sent_at: None,
            delivered_at: None,
            retry_count: 0,
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            error_message: None,
            correlation_id: self.correlation_id,
            provider_message_id: None,
            claim_id: None,
            metadata: self
                .metadata
                .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
            created_at: now,
            updated_at: now,
        }
    }
}
