use std::str::FromStr;

use serde::Deserialize;

/// Which `Sender` implementation delivers outbound mail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderKind {
    /// Logs and fabricates provider ids; simulates occasional transient failures.
    Mock,
    /// Resend HTTP API.
    Resend,
}

impl FromStr for SenderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mock" => Ok(SenderKind::Mock),
            "resend" => Ok(SenderKind::Resend),
            other => Err(anyhow::anyhow!(
                "EMAIL_SENDER must be 'mock' or 'resend', got '{}'",
                other
            )),
        }
    }
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Address the HTTP server binds to (default: 0.0.0.0:3000)
    pub api_bind_addr: String,

    /// JWT secret for API authentication
    pub jwt_secret: String,

    /// JWT token expiry in hours
    pub jwt_expiry_hours: u64,

    /// Dispatcher tick interval in milliseconds (default: 60000)
    pub dispatch_interval_ms: u64,

    /// Maximum number of items claimed per tick (default: 10)
    pub dispatch_batch_size: u32,

    /// Maximum number of concurrent sends within a tick (default: 4)
    pub dispatch_concurrency: usize,

    /// Whether the API process also runs the dispatch loop (default: true)
    pub dispatch_enabled: bool,

    /// Timeout applied to every Sender call, in milliseconds (default: 10000)
    pub send_timeout_ms: u64,

    /// Age after which an item stuck in `sending` is reclaimed (default: 300)
    pub stale_sending_secs: u64,

    /// Base delay of the exponential retry backoff (default: 30)
    pub retry_base_delay_secs: u64,

    /// Upper bound of the retry backoff before jitter (default: 3600)
    pub retry_max_delay_secs: u64,

    /// Maximum random jitter added to each retry delay (default: 5000)
    pub retry_jitter_ms: u64,

    /// Outbound transport (default: mock)
    pub email_sender: SenderKind,

    /// Resend API key for email delivery
    pub resend_api_key: Option<String>,

    /// Email sender address
    pub email_from: Option<String>,

    /// Probability that the mock sender simulates a transient failure (default: 0.1)
    pub mock_failure_rate: f64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", "20")?,
            api_bind_addr: std::env::var("API_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            jwt_secret: std::env::var("JWT_SECRET")
                .map_err(|_| anyhow::anyhow!("JWT_SECRET environment variable is required"))?,
            jwt_expiry_hours: parse_var("JWT_EXPIRY_HOURS", "24")?,
            dispatch_interval_ms: parse_var("DISPATCH_INTERVAL_MS", "60000")?,
            dispatch_batch_size: parse_var("DISPATCH_BATCH_SIZE", "10")?,
            dispatch_concurrency: parse_var("DISPATCH_CONCURRENCY", "4")?,
            dispatch_enabled: parse_var("DISPATCH_ENABLED", "true")?,
            send_timeout_ms: parse_var("SEND_TIMEOUT_MS", "10000")?,
            stale_sending_secs: parse_var("STALE_SENDING_SECS", "300")?,
            retry_base_delay_secs: parse_var("RETRY_BASE_DELAY_SECS", "30")?,
            retry_max_delay_secs: parse_var("RETRY_MAX_DELAY_SECS", "3600")?,
            retry_jitter_ms: parse_var("RETRY_JITTER_MS", "5000")?,
            email_sender: std::env::var("EMAIL_SENDER")
                .unwrap_or_else(|_| "mock".to_string())
                .parse()?,
            resend_api_key: std::env::var("RESEND_API_KEY").ok(),
            email_from: std::env::var("EMAIL_FROM").ok(),
            mock_failure_rate: parse_var("MOCK_FAILURE_RATE", "0.1")?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks that a single variable parse cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dispatch_batch_size == 0 {
            anyhow::bail!("DISPATCH_BATCH_SIZE must be at least 1");
        }
        if self.dispatch_concurrency == 0 {
            anyhow::bail!("DISPATCH_CONCURRENCY must be at least 1");
        }
        if self.dispatch_interval_ms == 0 {
            anyhow::bail!("DISPATCH_INTERVAL_MS must be at least 1");
        }
        if self.send_timeout_ms == 0 {
            anyhow::bail!("SEND_TIMEOUT_MS must be at least 1");
        }
        // a live claim must never look abandoned, even to a tick that runs
        // every wave of a full batch back to back
        let waves = u64::from(self.dispatch_batch_size).div_ceil(self.dispatch_concurrency as u64);
        let longest_tick_ms = self.send_timeout_ms.saturating_mul(waves);
        if self.stale_sending_secs.saturating_mul(1000) <= longest_tick_ms {
            anyhow::bail!(
                "STALE_SENDING_SECS must exceed SEND_TIMEOUT_MS x ceil(DISPATCH_BATCH_SIZE / DISPATCH_CONCURRENCY) = {}ms",
                longest_tick_ms
            );
        }
        if self.retry_max_delay_secs < self.retry_base_delay_secs {
            anyhow::bail!("RETRY_MAX_DELAY_SECS must not be smaller than RETRY_BASE_DELAY_SECS");
        }
        if !(0.0..=1.0).contains(&self.mock_failure_rate) {
            anyhow::bail!("MOCK_FAILURE_RATE must be between 0.0 and 1.0");
        }
        if self.email_sender == SenderKind::Resend
            && (self.resend_api_key.is_none() || self.email_from.is_none())
        {
            anyhow::bail!("EMAIL_SENDER=resend requires RESEND_API_KEY and EMAIL_FROM");
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &str, default: &str) -> anyhow::Result<T> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                name,
                std::any::type_name::<T>()
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            database_url: "postgres://localhost/herald".to_string(),
            db_max_connections: 5,
            api_bind_addr: "127.0.0.1:3000".to_string(),
            jwt_secret: "secret".to_string(),
            jwt_expiry_hours: 24,
            dispatch_interval_ms: 1000,
            dispatch_batch_size: 10,
            dispatch_concurrency: 4,
            dispatch_enabled: true,
            send_timeout_ms: 1000,
            stale_sending_secs: 300,
            retry_base_delay_secs: 30,
            retry_max_delay_secs: 3600,
            retry_jitter_ms: 0,
            email_sender: SenderKind::Mock,
            resend_api_key: None,
            email_from: None,
            mock_failure_rate: 0.1,
        }
    }

    #[test]
    fn test_sender_kind_parse() {
        assert_eq!("mock".parse::<SenderKind>().unwrap(), SenderKind::Mock);
        assert_eq!("Resend".parse::<SenderKind>().unwrap(), SenderKind::Resend);
        assert!("smtp".parse::<SenderKind>().is_err());
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = base_config();
        config.dispatch_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_interval_and_timeout() {
        let mut config = base_config();
        config.dispatch_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.send_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_stale_window_covers_a_full_tick() {
        // 10 items over 4 slots is 3 waves of up to 20s each
        let mut config = base_config();
        config.send_timeout_ms = 20_000;
        config.stale_sending_secs = 60;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("STALE_SENDING_SECS"));

        config.stale_sending_secs = 61;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_resend_requires_credentials() {
        let mut config = base_config();
        config.email_sender = SenderKind::Resend;
        assert!(config.validate().is_err());

        config.resend_api_key = Some("re_123".to_string());
        config.email_from = Some("alerts@example.com".to_string());
        assert!(config.validate().is_ok());
    }
}
