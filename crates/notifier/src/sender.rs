use async_trait::async_trait;
use thiserror::Error;

/// Classified delivery failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Timeout, provider 5xx, rate limiting. Worth retrying.
    #[error("Transient send error: {0}")]
    Transient(String),
    /// Invalid address, rejected format. Retrying cannot help.
    #[error("Permanent send error: {0}")]
    Permanent(String),
}

impl SendError {
    /// The failure reason without the classification prefix.
    pub fn message(&self) -> &str {
        match self {
            SendError::Transient(msg) | SendError::Permanent(msg) => msg,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SendError::Transient(_))
    }
}

/// Outbound email transport.
#[async_trait]
pub trait EmailSender: Send + Sync + std::fmt::Debug {
    /// Deliver a fully rendered message.
    ///
    /// # Errors
    /// `SendError::Transient` if the attempt may succeed later,
    /// `SendError::Permanent` if it never will.
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        html: &str,
        text: Option<&str>,
    ) -> Result<String, SendError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}
