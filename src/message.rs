//! Message types and status management for the relay.
//!
//! A [`Message`] is a single unit of outbound work: a recipient and some content
//! that has to reach the configured webhook.
//!
//! # Message Lifecycle
//!
//! 1. Messages are created in `Pending` status by a producer
//! 2. When the webhook confirms delivery, they move to `Sent`
//! 3. When the webhook permanently rejects them, they move to `Failed`
//!
//! `Sent` and `Failed` are terminal. A `Pending` message whose retry count has
//! reached the configured ceiling is *parked*: it is no longer returned by due
//! queries and waits for an operator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

/// Current delivery status of a message.
///
/// The only legal transitions are
/// `Pending` -> `Sent` (success case) and
/// `Pending` -> `Failed` (permanent rejection).
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageStatus {
    /// Waiting for a delivery attempt
    Pending,
    /// Accepted by the webhook
    Sent,
    /// Permanently rejected by the webhook
    Failed,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A persisted message and its delivery bookkeeping.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq)]
pub struct Message {
    /// Unique identifier, assigned by the store
    pub id: i64,
    /// Who the message is addressed to
    pub recipient: String,
    /// The actual message content
    pub content: String,

    /// Current status of the message
    pub status: MessageStatus,

    /// When the webhook accepted the message
    pub sent_at: Option<DateTime<Utc>>,
    /// Number of delivery rounds that ended in a transient failure
    pub retry_count: u32,
    /// When the last transient failure was recorded
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Set on every status-changing write
    pub updated_at: Option<DateTime<Utc>>,

    /// Identifier returned by the webhook on success
    pub response_id: Option<String>,
    /// HTTP status code of the final webhook response, if any
    pub response_code: Option<i64>,
    /// Reason for a permanent failure
    pub error_message: Option<String>,
}

impl Message {
    pub fn is_due(&self, max_retry_count: u32) -> bool {
        self.status == MessageStatus::Pending && self.retry_count < max_retry_count
    }

    /// Builds the `Sent` version of this message.
    pub fn into_sent(
        self,
        response_id: impl Into<String>,
        response_code: Option<u16>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: MessageStatus::Sent,
            sent_at: Some(sent_at),
            response_id: Some(response_id.into()),
            response_code: response_code.map(i64::from),
            error_message: None,
            ..self
        }
    }

    /// Builds the `Failed` version of this message.
    pub fn into_failed(self, error: impl Into<String>, response_code: Option<u16>) -> Self {
        Self {
            status: MessageStatus::Failed,
            response_code: response_code.map(i64::from),
            error_message: Some(error.into()),
            ..self
        }
    }
}

/// Outcome of a status-guarded write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The row was still `pending` and has been updated
    Applied,
    /// The row was no longer `pending`; someone else already handled it
    Conflict,
}

impl Transition {
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}
