//! Email delivery workers.
//!
//! The `Dispatcher` claims due items from the queue store, renders them,
//! hands them to an `EmailSender` and records the outcome:
//! - Retry with exponential backoff for transient failures
//! - Straight to `failed` for permanent failures
//! - Recovery of claims abandoned by a crashed or cancelled tick

pub mod dispatcher;
pub mod mock;
pub mod resend;
pub mod sender;
pub mod template;

use std::sync::Arc;
use std::time::Duration;

use herald_common::config::{AppConfig, SenderKind};

use crate::mock::MockSender;
use crate::resend::ResendSender;
use crate::sender::EmailSender;

/// Build the sender selected by `EMAIL_SENDER`.
pub fn build_sender(config: &AppConfig) -> anyhow::Result<Arc<dyn EmailSender>> {
    match config.email_sender {
        SenderKind::Mock => Ok(Arc::new(MockSender::new(
            config.mock_failure_rate,
            Duration::from_millis(50),
            Duration::from_millis(250),
        ))),
        SenderKind::Resend => {
            let api_key = config
                .resend_api_key
                .clone()
                .ok_or_else(|| anyhow::anyhow!("RESEND_API_KEY is required for the resend sender"))?;
            let from = config
                .email_from
                .clone()
                .ok_or_else(|| anyhow::anyhow!("EMAIL_FROM is required for the resend sender"))?;
            Ok(Arc::new(ResendSender::new(api_key, from)?))
        }
    }
}
