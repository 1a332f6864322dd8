//! Best-effort record of successful deliveries.
//!
//! After a message is marked `sent`, the dispatcher stores a small
//! [`DeliveryRecord`] under `message:<id>`. Nothing reads it back on the
//! delivery path, so failures here are logged and otherwise ignored.

use std::{future::Future, pin::Pin};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub mod memory;
pub mod redis;

pub type CacheFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, Error>> + Send + 'a>>;

/// Key/value store with a fixed expiry chosen at construction time.
pub trait ResultCache: Send + Sync + 'static {
    fn set<'a>(&'a self, key: &'a str, value: String) -> CacheFuture<'a, ()>;

    /// Returns `None` for missing or expired keys.
    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>>;
}

pub fn message_key(id: i64) -> String {
    format!("message:{id}")
}

/// What gets cached for a delivered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub message_id: String,
    pub sent_at: String,
}

impl DeliveryRecord {
    pub fn new(message_id: impl Into<String>, sent_at: DateTime<Utc>) -> Self {
        Self {
            message_id: message_id.into(),
            sent_at: sent_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Stores `record` for message `id`. Returns the error instead of logging it so
/// callers decide how loud to be.
pub async fn record_delivery(
    cache: &dyn ResultCache,
    id: i64,
    record: &DeliveryRecord,
) -> Result<(), Error> {
    let value = serde_json::to_string(record)?;
    cache.set(&message_key(id), value).await
}

/// Reads back the record stored by [`record_delivery`].
pub async fn lookup_delivery(
    cache: &dyn ResultCache,
    id: i64,
) -> Result<Option<DeliveryRecord>, Error> {
    match cache.get(&message_key(id)).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}
