use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use uuid::Uuid;

use crate::sender::{EmailSender, SendError};

/// Development sender: logs the message, sleeps for a random latency and
/// fabricates a provider id. Fails transiently with `failure_rate` probability
/// and permanently for recipients without an `@`.
#[derive(Debug, Clone)]
pub struct MockSender {
    failure_rate: f64,
    min_latency: Duration,
    max_latency: Duration,
}

impl MockSender {
    pub fn new(failure_rate: f64, min_latency: Duration, max_latency: Duration) -> Self {
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
            min_latency,
            max_latency: max_latency.max(min_latency),
        }
    }

    /// A mock that always succeeds immediately.
    pub fn reliable() -> Self {
        Self::new(0.0, Duration::ZERO, Duration::ZERO)
    }
}

#[async_trait]
impl EmailSender for MockSender {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        html: &str,
        _text: Option<&str>,
    ) -> Result<String, SendError> {
        tracing::info!(recipient, subject, "MOCK: sending email");
        let preview: String = html.chars().take(100).collect();
        tracing::debug!(html = %preview, "MOCK: html content");

        if !recipient.contains('@') {
            return Err(SendError::Permanent(format!(
                "invalid recipient address '{}'",
                recipient
            )));
        }

        let (fail, latency) = {
            let mut rng = rand::thread_rng();
            let fail = rng.gen_bool(self.failure_rate);
            let min = self.min_latency.as_millis() as u64;
            let max = self.max_latency.as_millis() as u64;
            (fail, Duration::from_millis(rng.gen_range(min..=max)))
        };

        if fail {
            tracing::warn!("MOCK: simulating provider failure");
            return Err(SendError::Transient(
                "mock provider error: simulated failure".to_string(),
            ));
        }

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let message_id = format!("mock_{}", Uuid::new_v4());
        tracing::info!(message_id = %message_id, "MOCK: email sent");
        Ok(message_id)
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
