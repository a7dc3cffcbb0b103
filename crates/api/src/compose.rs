//! Canned messages queued on behalf of callers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use herald_common::types::{
    NewQueueItem, OWNER_METADATA_KEY, PRIORITY_HIGH, PRIORITY_NORMAL, TEMPLATE_VARS_METADATA_KEY,
};

pub const ALERT_TEMPLATE_ID: &str = "alert-notification";
pub const TEST_TEMPLATE_ID: &str = "test-email";

const ALERT_SUBJECT: &str = "[{{severity}}] Alert: {{alert_name}}";
const ALERT_HTML: &str = "<h2>{{alert_name}}</h2>\
<p>{{message}}</p>\
<p>Severity: <strong>{{severity}}</strong></p>\
<p>Triggered at {{triggered_at}}</p>";
const ALERT_TEXT: &str = "{{alert_name}}\n\n{{message}}\n\nSeverity: {{severity}}\nTriggered at {{triggered_at}}";

/// Request body for `POST /api/email/queue/alert`.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertEmailRequest {
    /// Alert trigger this email reports; used as the correlation id.
    pub trigger_id: Uuid,
    pub recipient_address: String,
    pub alert_name: String,
    #[serde(default)]
    pub message: String,
    pub severity: Option<String>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub template_id: Option<String>,
    /// Extra placeholder values merged over the defaults.
    #[serde(default)]
    pub template_vars: HashMap<String, String>,
}

/// Request body for `POST /api/email/test`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestEmailRequest {
    pub recipient_address: String,
}

/// Stamp `owner` into `metadata`, replacing any owner the caller supplied.
pub fn with_owner(metadata: Option<Value>, owner: &str) -> Option<Value> {
    match metadata {
        None => Some(json!({ OWNER_METADATA_KEY: owner })),
        Some(Value::Object(mut map)) => {
            map.insert(
                OWNER_METADATA_KEY.to_string(),
                Value::String(owner.to_string()),
            );
            Some(Value::Object(map))
        }
        // non-objects are rejected by enqueue validation
        other => other,
    }
}

pub fn alert_email(request: AlertEmailRequest, owner: &str) -> NewQueueItem {
    let triggered_at = request.triggered_at.unwrap_or_else(Utc::now);

    let mut vars: Map<String, Value> = Map::new();
    vars.insert("alert_name".into(), request.alert_name.into());
    vars.insert("message".into(), request.message.into());
    vars.insert(
        "severity".into(),
        request.severity.unwrap_or_else(|| "warning".to_string()).into(),
    );
    vars.insert("triggered_at".into(), triggered_at.to_rfc3339().into());
    vars.insert("trigger_id".into(), request.trigger_id.to_string().into());
    for (key, value) in request.template_vars {
        vars.insert(key, value.into());
    }

    NewQueueItem {
        recipient_address: request.recipient_address,
        subject: ALERT_SUBJECT.to_string(),
        body_html: ALERT_HTML.to_string(),
        body_text: Some(ALERT_TEXT.to_string()),
        template_id: request
            .template_id
            .unwrap_or_else(|| ALERT_TEMPLATE_ID.to_string()),
        priority: Some(PRIORITY_HIGH),
        correlation_id: Some(request.trigger_id),
        metadata: Some(json!({
            OWNER_METADATA_KEY: owner,
            TEMPLATE_VARS_METADATA_KEY: Value::Object(vars),
        })),
        ..Default::default()
    }
}

pub fn test_email(request: TestEmailRequest, owner: &str) -> NewQueueItem {
    let now = Utc::now();
    NewQueueItem {
        recipient_address: request.recipient_address,
        subject: "Herald test email".to_string(),
        body_html: format!(
            "<h2>Test email</h2><p>Email delivery is working.</p><p>Sent at {}</p>",
            now.to_rfc3339()
        ),
        body_text: Some(format!(
            "Test email\n\nEmail delivery is working.\nSent at {}",
            now.to_rfc3339()
        )),
        template_id: TEST_TEMPLATE_ID.to_string(),
        priority: Some(PRIORITY_NORMAL),
        metadata: Some(json!({ OWNER_METADATA_KEY: owner, "test": true })),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_owner_defaults_missing_owner() {
        let metadata = with_owner(Some(json!({ "campaign": "q3" })), "alice").unwrap();
        assert_eq!(metadata["user_id"], "alice");
        assert_eq!(metadata["campaign"], "q3");

        assert_eq!(with_owner(None, "alice").unwrap()["user_id"], "alice");
    }

    #[test]
    fn test_with_owner_replaces_supplied_owner() {
        let metadata = with_owner(
            Some(json!({ "user_id": "someone-else", "campaign": "q3" })),
            "alice",
        )
        .unwrap();
        assert_eq!(metadata["user_id"], "alice");
        assert_eq!(metadata["campaign"], "q3");
    }

    #[test]
    fn test_alert_email_uses_trigger_as_correlation() {
        let trigger_id = Uuid::new_v4();
        let item = alert_email(
            AlertEmailRequest {
                trigger_id,
                recipient_address: "ops@example.com".to_string(),
                alert_name: "CPU high".to_string(),
                message: "load 12".to_string(),
                severity: None,
                triggered_at: None,
                template_id: None,
                template_vars: HashMap::from([("region".to_string(), "eu".to_string())]),
            },
            "alice",
        );

        assert_eq!(item.correlation_id, Some(trigger_id));
        assert_eq!(item.priority, Some(PRIORITY_HIGH));
        assert_eq!(item.template_id, ALERT_TEMPLATE_ID);
        assert!(item.validate().is_ok());

        let metadata = item.metadata.unwrap();
        assert_eq!(metadata["user_id"], "alice");
        assert_eq!(metadata["template_vars"]["alert_name"], "CPU high");
        assert_eq!(metadata["template_vars"]["severity"], "warning");
        assert_eq!(metadata["template_vars"]["region"], "eu");
    }

    #[test]
    fn test_test_email_is_tagged() {
        let item = test_email(
            TestEmailRequest {
                recipient_address: "me@example.com".to_string(),
            },
            "alice",
        );
        assert_eq!(item.metadata.unwrap()["test"], true);
        assert!(item.correlation_id.is_none());
    }
}
