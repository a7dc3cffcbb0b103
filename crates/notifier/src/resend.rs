use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::sender::{EmailSender, SendError};

const RESEND_API_URL: &str = "https://api.resend.com";

/// Sender backed by the Resend HTTP API.
#[derive(Debug, Clone)]
pub struct ResendSender {
    client: reqwest::Client,
    api_key: String,
    from: String,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

impl ResendSender {
    pub fn new(api_key: String, from: String) -> anyhow::Result<Self> {
        Self::with_base_url(api_key, from, RESEND_API_URL.to_string())
    }

    pub fn with_base_url(api_key: String, from: String, base_url: String) -> anyhow::Result<Self> {
        if api_key.trim().is_empty() {
            anyhow::bail!("Resend API key is empty");
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("herald/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            api_key,
            from,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

/// Classify a non-success provider status.
///
/// Malformed or rejected requests are permanent; rate limiting, request
/// timeouts and server errors are transient.
pub fn classify_status(status: u16, body: &str) -> SendError {
    let message = format!("provider returned {}: {}", status, body.trim());
    match status {
        408 | 429 | 500..=599 => SendError::Transient(message),
        _ => SendError::Permanent(message),
    }
}

fn classify_transport(err: &reqwest::Error) -> SendError {
    if err.is_builder() {
        SendError::Permanent(format!("invalid request: {}", err))
    } else {
        SendError::Transient(format!("transport error: {}", err))
    }
}

#[async_trait]
impl EmailSender for ResendSender {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        html: &str,
        text: Option<&str>,
    ) -> Result<String, SendError> {
        let request = SendRequest {
            from: &self.from,
            to: [recipient],
            subject,
            html,
            text,
        };

        let response = self
            .client
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = classify_status(status.as_u16(), &body);
            tracing::warn!(status = status.as_u16(), error = %err, "Resend rejected email");
            return Err(err);
        }

        let parsed: SendResponse = response
            .json()
            .await
            .map_err(|e| SendError::Transient(format!("unreadable provider response: {}", e)))?;

        tracing::debug!(message_id = %parsed.id, "Resend accepted email");
        Ok(parsed.id)
    }

    fn name(&self) -> &'static str {
        "resend"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_requests_are_permanent() {
        assert!(!classify_status(400, "bad").is_transient());
        assert!(!classify_status(422, "invalid `to` field").is_transient());
        assert!(!classify_status(403, "domain not verified").is_transient());
    }

    #[test]
    fn test_throttling_and_server_errors_are_transient() {
        assert!(classify_status(429, "slow down").is_transient());
        assert!(classify_status(408, "").is_transient());
        assert!(classify_status(503, "unavailable").is_transient());
    }

    #[test]
    fn test_classified_message_includes_status() {
        let err = classify_status(500, " boom \n");
        assert_eq!(err.message(), "provider returned 500: boom");
    }

    #[test]
    fn test_empty_api_key_rejected() {
        assert!(ResendSender::new("  ".to_string(), "noreply@example.com".to_string()).is_err());
    }

    #[test]
    fn test_request_body_shape() {
        let request = SendRequest {
            from: "noreply@example.com",
            to: ["ops@example.com"],
            subject: "Hi",
            html: "<p>Hi</p>",
            text: None,
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["to"][0], "ops@example.com");
        assert!(body.get("text").is_none());
    }
}
