//! Outbound delivery to the webhook.
//!
//! A [`Webhook`] performs exactly one attempt. [`RetryingTransport`] wraps it
//! with the retry loop: network errors and 5xx responses are retried with
//! exponential backoff, 4xx responses abort immediately.

use std::{future::Future, pin::Pin, sync::Arc};

use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub mod backoff;
pub mod http;

pub use backoff::BackoffPolicy;

/// Body posted to the webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookRequest {
    pub to: String,
    pub content: String,
}

/// Body returned by the webhook on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    #[serde(default)]
    pub message: String,
    pub message_id: String,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    #[snafu(display("request failed: {source}"))]
    Request { source: reqwest::Error },

    #[snafu(display("unexpected status code: {code}"))]
    Status { code: u16 },

    #[snafu(display("invalid response body: {message}"))]
    Decode { message: String },

    #[snafu(display("invalid webhook url: {message}"))]
    InvalidUrl { message: String },

    #[snafu(display("webhook send failed after {attempts} attempt(s): {source}"))]
    Exhausted {
        attempts: u32,
        #[snafu(source(from(TransportError, Box::new)))]
        source: Box<TransportError>,
    },
}

impl TransportError {
    /// Permanent errors must not be retried, now or on a later tick.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Status { code } => (400..500).contains(code),
            Self::Decode { .. } | Self::InvalidUrl { .. } => true,
            Self::Request { .. } => false,
            Self::Exhausted { source, .. } => source.is_permanent(),
        }
    }

    /// HTTP status code of the last response, if one was received.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { code } => Some(*code),
            Self::Request { source } => source.status().map(|s| s.as_u16()),
            Self::Decode { .. } | Self::InvalidUrl { .. } => None,
            Self::Exhausted { source, .. } => source.status_code(),
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } => *attempts,
            _ => 1,
        }
    }
}

pub type WebhookFuture<'a> =
    Pin<Box<dyn Future<Output = Result<WebhookResponse, TransportError>> + Send + 'a>>;

/// A single delivery attempt to a webhook destination.
pub trait Webhook: Send + Sync + 'static {
    /// Posts `request` to `path` on the webhook host. Only a 200 response with
    /// a decodable body counts as success.
    fn send<'a>(&'a self, request: &'a WebhookRequest, path: &'a str) -> WebhookFuture<'a>;
}

/// A successful delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub response: WebhookResponse,
    pub attempts: u32,
}

/// Runs [`Webhook::send`] until it succeeds, fails permanently, or the backoff
/// policy gives up.
#[derive(Clone)]
pub struct RetryingTransport {
    webhook: Arc<dyn Webhook>,
    policy: BackoffPolicy,
}

impl RetryingTransport {
    pub fn new(webhook: Arc<dyn Webhook>, policy: BackoffPolicy) -> Self {
        Self { webhook, policy }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Delivers `request`. Backoff waits end early when `cancel` fires, in
    /// which case the last error is returned.
    pub async fn deliver(
        &self,
        request: &WebhookRequest,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Delivery, TransportError> {
        let started = Instant::now();
        let mut backoff = self.policy.start();
        let mut attempts = 0;

        loop {
            attempts += 1;

            let err = match self.webhook.send(request, path).await {
                Ok(response) => return Ok(Delivery { response, attempts }),
                Err(err) => err,
            };

            if err.is_permanent() {
                tracing::warn!(attempts, error = %err, "Webhook rejected request");
                return Err(TransportError::Exhausted {
                    attempts,
                    source: Box::new(err),
                });
            }

            let Some(delay) = backoff.next_backoff(started.elapsed()) else {
                tracing::warn!(attempts, error = %err, "Giving up on webhook request");
                return Err(TransportError::Exhausted {
                    attempts,
                    source: Box::new(err),
                });
            };

            tracing::debug!(
                attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Webhook request failed, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(TransportError::Exhausted {
                        attempts,
                        source: Box::new(err),
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
