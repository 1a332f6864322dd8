//! Per-message delivery state machine and batch orchestration.
//!
//! For each due message the dispatcher sends it through the
//! [`RetryingTransport`] and then records the outcome through the status-guarded
//! [`MessageStore::update`]:
//!
//! - delivered: `pending -> sent`, then a best-effort cache entry
//! - permanently rejected: `pending -> failed`
//! - transient failure (retries exhausted): stays `pending`, retry count + 1
//!
//! A [`Transition::Conflict`] from the store means another dispatcher got there
//! first; the local result is dropped without error. If recording `sent` fails
//! for any other reason the message is treated like a transient failure: it
//! stays `pending` and will be delivered again on a later tick.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::{
    cache::{self, DeliveryRecord, ResultCache},
    error::Error,
    message::{Message, Transition},
    store::MessageStore,
    transport::{Delivery, RetryingTransport, TransportError, WebhookRequest},
};

/// Batch sizes and destination for the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder)]
pub struct DispatchConfig {
    /// Path on the webhook host that messages are posted to.
    #[builder(into, default = "/".to_owned())]
    pub webhook_path: String,
    /// Messages fetched per steady-state tick.
    #[builder(default = 2)]
    pub batch_size: u32,
    /// Chunk size used while draining the backlog on startup.
    #[builder(default = 10)]
    pub startup_batch_size: u32,
    #[builder(default = Duration::from_secs(120))]
    pub poll_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// What happened to a single message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Sent { response_id: String },
    Failed { error: String },
    /// Transient failure; the message stays pending for a later tick.
    Retrying { error: String },
    /// Another dispatcher already moved the message out of `pending`.
    Conflict,
}

/// Counts for one tick or one catch-up run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub processed: usize,
    pub sent: usize,
    pub failed: usize,
    pub retrying: usize,
    pub conflicts: usize,
    /// Per-message store errors that could not be recovered from.
    pub errors: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: &Result<Outcome, Error>) {
        self.processed += 1;
        match outcome {
            Ok(Outcome::Sent { .. }) => self.sent += 1,
            Ok(Outcome::Failed { .. }) => self.failed += 1,
            Ok(Outcome::Retrying { .. }) => self.retrying += 1,
            Ok(Outcome::Conflict) => self.conflicts += 1,
            Err(_) => self.errors += 1,
        }
    }

    fn merge(&mut self, other: BatchReport) {
        self.processed += other.processed;
        self.sent += other.sent;
        self.failed += other.failed;
        self.retrying += other.retrying;
        self.conflicts += other.conflicts;
        self.errors += other.errors;
    }
}

#[derive(bon::Builder)]
pub struct Dispatcher {
    store: Arc<dyn MessageStore>,
    cache: Arc<dyn ResultCache>,
    transport: RetryingTransport,
    #[builder(default)]
    config: DispatchConfig,
    #[builder(skip = AtomicBool::new(false))]
    caught_up: AtomicBool,
}

impl Dispatcher {
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// One scheduler tick.
    ///
    /// The first tick in the lifetime of the dispatcher drains the whole
    /// backlog; every later tick handles a single small batch. A drain cut
    /// short by cancellation is repeated on the next tick.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<BatchReport, Error> {
        if !self.caught_up.load(Ordering::Acquire) {
            let report = self.catch_up(cancel).await?;
            if !cancel.is_cancelled() {
                self.caught_up.store(true, Ordering::Release);
            }
            return Ok(report);
        }

        self.process_due(cancel).await
    }

    /// Fetches up to `batch_size` due messages and processes them in order.
    pub async fn process_due(&self, cancel: &CancellationToken) -> Result<BatchReport, Error> {
        let messages = self.store.find_due(self.config.batch_size).await?;

        if messages.is_empty() {
            tracing::info!("No pending messages to process");
            return Ok(BatchReport::default());
        }

        tracing::info!(count = messages.len(), "Processing messages");

        Ok(self.process_batch(&messages, cancel).await)
    }

    /// Processes every due message, `startup_batch_size` at a time.
    pub async fn catch_up(&self, cancel: &CancellationToken) -> Result<BatchReport, Error> {
        let messages = self.store.find_all_due().await?;

        if messages.is_empty() {
            tracing::info!("No backlog to drain");
            return Ok(BatchReport::default());
        }

        let chunk_size = self.config.startup_batch_size.max(1) as usize;
        let batches = messages.len().div_ceil(chunk_size);

        tracing::info!(count = messages.len(), batches, "Draining backlog");

        let mut report = BatchReport::default();

        for (index, chunk) in messages.chunks(chunk_size).enumerate() {
            if cancel.is_cancelled() {
                tracing::info!(batch = index + 1, batches, "Backlog drain cancelled");
                break;
            }

            let batch = self.process_batch(chunk, cancel).await;

            tracing::info!(
                batch = index + 1,
                batches,
                sent = batch.sent,
                failed = batch.failed,
                retrying = batch.retrying,
                "Processed backlog batch"
            );

            report.merge(batch);
        }

        Ok(report)
    }

    async fn process_batch(&self, messages: &[Message], cancel: &CancellationToken) -> BatchReport {
        let mut report = BatchReport::default();

        for message in messages {
            if cancel.is_cancelled() {
                tracing::debug!("Cancellation observed, leaving remaining messages for later");
                break;
            }

            let outcome = self.process_message(message.clone(), cancel).await;

            if let Err(e) = &outcome {
                tracing::error!(message_id = message.id, error = %e, "Error processing message");
            }

            report.record(&outcome);
        }

        report
    }

    /// Sends one message and records the result.
    pub async fn process_message(
        &self,
        message: Message,
        cancel: &CancellationToken,
    ) -> Result<Outcome, Error> {
        let request = WebhookRequest {
            to: message.recipient.clone(),
            content: message.content.clone(),
        };

        match self
            .transport
            .deliver(&request, &self.config.webhook_path, cancel)
            .await
        {
            Ok(delivery) => self.handle_success(message, delivery).await,
            Err(err) if err.is_permanent() => self.handle_rejection(message, err).await,
            Err(err) => self.handle_transient(message, err).await,
        }
    }

    async fn handle_success(&self, message: Message, delivery: Delivery) -> Result<Outcome, Error> {
        let id = message.id;
        let sent_at = Utc::now();
        let response_id = delivery.response.message_id;

        let sent = message.into_sent(response_id.clone(), Some(200), sent_at);

        match self.store.update(&sent).await {
            Ok(Transition::Applied) => {}
            Ok(Transition::Conflict) => {
                tracing::debug!(message_id = id, "Message already handled elsewhere");
                return Ok(Outcome::Conflict);
            }
            Err(e) => {
                // Delivered but unrecorded; the next tick sends it again.
                tracing::error!(message_id = id, error = %e, "Error updating sent message");
                self.store.increment_retry(id, Utc::now()).await?;
                return Ok(Outcome::Retrying {
                    error: e.to_string(),
                });
            }
        }

        let record = DeliveryRecord::new(response_id.clone(), sent_at);
        if let Err(e) = cache::record_delivery(self.cache.as_ref(), id, &record).await {
            tracing::error!(message_id = id, error = %e, "Error caching message");
        }

        tracing::info!(
            message_id = id,
            recipient = %sent.recipient,
            attempts = delivery.attempts,
            "Successfully sent message"
        );

        Ok(Outcome::Sent { response_id })
    }

    async fn handle_rejection(
        &self,
        message: Message,
        err: TransportError,
    ) -> Result<Outcome, Error> {
        let id = message.id;
        let error = err.to_string();

        tracing::warn!(message_id = id, error = %error, "Message permanently rejected");

        let failed = message.into_failed(error.clone(), err.status_code());

        match self.store.update(&failed).await {
            Ok(Transition::Applied) => Ok(Outcome::Failed { error }),
            Ok(Transition::Conflict) => {
                tracing::debug!(message_id = id, "Message already handled elsewhere");
                Ok(Outcome::Conflict)
            }
            Err(e) => {
                // Keep the message eligible instead of leaving it in limbo.
                tracing::error!(message_id = id, error = %e, "Error updating failed message");
                self.store.increment_retry(id, Utc::now()).await?;
                Ok(Outcome::Retrying { error })
            }
        }
    }

    async fn handle_transient(&self, message: Message, err: TransportError) -> Result<Outcome, Error> {
        let id = message.id;
        let error = err.to_string();

        tracing::warn!(
            message_id = id,
            attempts = err.attempts(),
            error = %error,
            "Error sending message, will retry on a later tick"
        );

        self.store.increment_retry(id, Utc::now()).await?;

        Ok(Outcome::Retrying { error })
    }
}
