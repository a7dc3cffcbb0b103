//! Periodic queue dispatch.
//!
//! Each tick sweeps expired claims, then claims and sends up to a batch of due
//! items with bounded concurrency. Items are claimed only once a send slot is
//! free for them, so a claim's age stays within one send timeout. A failure on
//! one item is recorded on that item and never aborts the rest of the batch.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinSet;
use tracing::Instrument;

use herald_common::config::AppConfig;
use herald_common::error::AppError;
use herald_common::types::QueueItem;
use herald_engine::backoff::Backoff;
use herald_engine::store::{FailureOutcome, QueueStore};

use crate::sender::{EmailSender, SendError};
use crate::template::{TemplateRenderer, render_if_needed};

/// Dispatcher tuning.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    pub batch_size: u32,
    pub concurrency: usize,
    pub send_timeout: Duration,
    /// Claims older than this are considered abandoned.
    pub stale_after: Duration,
    pub interval: Duration,
    pub backoff: Backoff,
}

impl DispatcherConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            batch_size: config.dispatch_batch_size,
            concurrency: config.dispatch_concurrency,
            send_timeout: Duration::from_millis(config.send_timeout_ms),
            stale_after: Duration::from_secs(config.stale_sending_secs),
            interval: Duration::from_millis(config.dispatch_interval_ms),
            backoff: Backoff::new(
                Duration::from_secs(config.retry_base_delay_secs),
                Duration::from_secs(config.retry_max_delay_secs),
                Duration::from_millis(config.retry_jitter_ms),
            ),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            concurrency: 4,
            send_timeout: Duration::from_secs(10),
            stale_after: Duration::from_secs(300),
            interval: Duration::from_secs(60),
            backoff: Backoff::default(),
        }
    }
}

/// Summary of one dispatch tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Items claimed and attempted this tick.
    pub processed_count: usize,
    /// Attempts that did not end in `sent` (retry or failed).
    pub failed_count: usize,
    pub sent_count: usize,
    pub retried_count: usize,
    /// Outcomes that could not be written back; the claim expires and the
    /// item is recovered by a later sweep.
    pub unrecorded_count: usize,
    pub recovered_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Sent,
    Retrying,
    Failed,
    Unrecorded,
}

/// Everything a single delivery attempt needs, cheap to clone into a task.
#[derive(Debug, Clone)]
struct Delivery {
    store: Arc<dyn QueueStore>,
    sender: Arc<dyn EmailSender>,
    renderer: Arc<dyn TemplateRenderer>,
    send_timeout: Duration,
    backoff: Backoff,
}

impl Delivery {
    async fn attempt(&self, item: QueueItem) -> ItemOutcome {
        let Some(claim_id) = item.claim_id else {
            tracing::error!("Claimed item carries no claim id, skipping");
            return ItemOutcome::Unrecorded;
        };

        let vars = item.template_vars();
        let subject = render_if_needed(self.renderer.as_ref(), &item.subject, &vars);
        let html = render_if_needed(self.renderer.as_ref(), &item.body_html, &vars);
        let text = item
            .body_text
            .as_deref()
            .map(|t| render_if_needed(self.renderer.as_ref(), t, &vars));

        let send = self.sender.send(
            &item.recipient_address,
            &subject,
            &html,
            text.as_deref(),
        );
        let result = match tokio::time::timeout(self.send_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Transient(format!(
                "send timed out after {}ms",
                self.send_timeout.as_millis()
            ))),
        };

        match result {
            Ok(provider_message_id) => {
                match self
                    .store
                    .mark_sent(item.id, claim_id, Utc::now(), &provider_message_id)
                    .await
                {
                    Ok(()) => {
                        tracing::info!(provider_message_id = %provider_message_id, "Email sent");
                        ItemOutcome::Sent
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Email sent but status update failed");
                        ItemOutcome::Unrecorded
                    }
                }
            }
            Err(SendError::Transient(message)) => {
                match self
                    .store
                    .mark_retry_or_failed(item.id, claim_id, &message, &self.backoff, Utc::now())
                    .await
                {
                    Ok(FailureOutcome::Retry {
                        retry_count,
                        next_attempt_at,
                    }) => {
                        tracing::warn!(
                            error = %message,
                            retry_count,
                            next_attempt_at = %next_attempt_at,
                            "Send failed, retry scheduled"
                        );
                        ItemOutcome::Retrying
                    }
                    Ok(FailureOutcome::Failed { retry_count }) => {
                        tracing::error!(error = %message, retry_count, "Send failed, retries exhausted");
                        ItemOutcome::Failed
                    }
                    Err(e) => {
                        tracing::error!(error = %e, send_error = %message, "Failed to record send failure");
                        ItemOutcome::Unrecorded
                    }
                }
            }
            Err(SendError::Permanent(message)) => {
                match self.store.mark_failed(item.id, claim_id, &message).await {
                    Ok(()) => {
                        tracing::error!(error = %message, "Send rejected permanently");
                        ItemOutcome::Failed
                    }
                    Err(e) => {
                        tracing::error!(error = %e, send_error = %message, "Failed to record send failure");
                        ItemOutcome::Unrecorded
                    }
                }
            }
        }
    }
}

/// Claims due queue items and delivers them.
#[derive(Debug)]
pub struct Dispatcher {
    delivery: Delivery,
    config: DispatcherConfig,
    semaphore: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn QueueStore>,
        sender: Arc<dyn EmailSender>,
        renderer: Arc<dyn TemplateRenderer>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            delivery: Delivery {
                store,
                sender,
                renderer,
                send_timeout: config.send_timeout,
                backoff: config.backoff,
            },
            semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn sender_name(&self) -> &'static str {
        self.delivery.sender.name()
    }

    /// Revert abandoned `sending` claims to `retry`.
    pub async fn recover_stale(&self) -> Result<usize, AppError> {
        let now = Utc::now();
        let stale_after = TimeDelta::from_std(self.config.stale_after)
            .map_err(|e| AppError::Config(format!("stale_after out of range: {}", e)))?;
        let recovered = self
            .delivery
            .store
            .recover_stale(now - stale_after, now)
            .await?;
        if !recovered.is_empty() {
            tracing::warn!(count = recovered.len(), "Recovered stale sending claims");
        }
        Ok(recovered.len())
    }

    /// Run one dispatch pass.
    ///
    /// Claims happen in waves sized to the free send slots until `batch_size`
    /// items were claimed or nothing is due.
    ///
    /// # Errors
    /// Only when the first claim fails. Per-item failures are recorded on the
    /// items and reflected in the report.
    pub async fn tick(&self) -> Result<TickReport, AppError> {
        let mut report = TickReport::default();

        match self.recover_stale().await {
            Ok(count) => report.recovered_count = count,
            Err(e) => tracing::error!(error = %e, "Stale claim sweep failed"),
        }

        // fixed for the whole tick so a failed item is not retried in the same pass
        let due_by = Utc::now();
        let batch_size = self.config.batch_size as usize;
        let mut tasks = JoinSet::new();
        while report.processed_count < batch_size {
            let mut permits = vec![self.acquire_slot().await?];
            let remaining = batch_size - report.processed_count;
            while permits.len() < remaining {
                match Arc::clone(&self.semaphore).try_acquire_owned() {
                    Ok(permit) => permits.push(permit),
                    Err(_) => break,
                }
            }

            let wanted = permits.len();
            let items = match self
                .delivery
                .store
                .claim_batch(due_by, wanted as u32)
                .await
            {
                Ok(items) => items,
                Err(e) if report.processed_count == 0 => return Err(e),
                Err(e) => {
                    tracing::error!(error = %e, "Claim failed mid-tick, finishing in-flight sends");
                    break;
                }
            };
            let drained = items.len() < wanted;
            if !items.is_empty() {
                tracing::debug!(count = items.len(), "Claimed emails for dispatch");
            }
            report.processed_count += items.len();

            for (item, permit) in items.into_iter().zip(permits) {
                self.spawn_delivery(&mut tasks, item, permit);
            }
            if drained {
                break;
            }
        }

        if report.processed_count == 0 {
            tracing::debug!("No due emails");
            return Ok(report);
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(ItemOutcome::Sent) => report.sent_count += 1,
                Ok(ItemOutcome::Retrying) => {
                    report.retried_count += 1;
                    report.failed_count += 1;
                }
                Ok(ItemOutcome::Failed) => report.failed_count += 1,
                Ok(ItemOutcome::Unrecorded) => report.unrecorded_count += 1,
                Err(e) => {
                    tracing::error!(error = %e, "Delivery task panicked");
                    report.unrecorded_count += 1;
                }
            }
        }

        tracing::info!(
            processed = report.processed_count,
            sent = report.sent_count,
            failed = report.failed_count,
            retried = report.retried_count,
            unrecorded = report.unrecorded_count,
            "Dispatch tick complete"
        );
        Ok(report)
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, AppError> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|e| AppError::Internal(format!("dispatch semaphore closed: {}", e)))
    }

    fn spawn_delivery(
        &self,
        tasks: &mut JoinSet<ItemOutcome>,
        item: QueueItem,
        permit: OwnedSemaphorePermit,
    ) {
        let delivery = self.delivery.clone();
        let span = tracing::info_span!(
            "deliver",
            queue_item_id = %item.id,
            recipient = %item.recipient_address,
            template_id = %item.template_id,
            attempt = item.retry_count + 1,
        );
        tasks.spawn(
            async move {
                let _permit = permit;
                delivery.attempt(item).await
            }
            .instrument(span),
        );
    }

    /// Tick on `interval` until `shutdown` flips to `true`.
    ///
    /// A tick interrupted by shutdown is dropped along with its in-flight
    /// sends; their items stay `sending` until the stale sweep reclaims them.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = self.config.interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            sender = self.sender_name(),
            "Dispatcher started"
        );

        if let Err(e) = self.recover_stale().await {
            tracing::error!(error = %e, "Startup stale claim sweep failed");
        }

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    tokio::select! {
                        result = self.tick() => {
                            if let Err(e) = result {
                                tracing::error!(error = %e, "Dispatch tick failed, retrying next interval");
                            }
                        }
                        _ = shutdown.changed() => {
                            tracing::warn!("Shutdown during dispatch tick, in-flight claims left for recovery");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        tracing::info!("Dispatcher stopped");
    }
}
