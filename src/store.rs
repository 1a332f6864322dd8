//! Persistence seam for the dispatcher.
//!
//! The dispatcher only ever talks to a [`MessageStore`]. The production
//! implementation is [`sqlite::SqliteMessageStore`]; tests wrap it to inject
//! failures.

use std::{future::Future, pin::Pin};

use chrono::{DateTime, Utc};

use crate::{
    error::Error,
    message::{Message, MessageStatus, Transition},
};

pub mod sqlite;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, Error>> + Send + 'a>>;

/// Source of truth for message records.
pub trait MessageStore: Send + Sync + 'static {
    /// Returns up to `limit` due messages, oldest first.
    ///
    /// A message is due when it is `pending` and its retry count is below the
    /// store's retry ceiling.
    fn find_due(&self, limit: u32) -> StoreFuture<'_, Vec<Message>>;

    /// Returns every due message, oldest first.
    fn find_all_due(&self) -> StoreFuture<'_, Vec<Message>>;

    /// Writes the status, result metadata and timestamps of `message`.
    ///
    /// The write only happens if the stored row is still `pending`. Otherwise
    /// [`Transition::Conflict`] is returned, which means another actor already
    /// moved the message to a terminal state.
    fn update<'a>(&'a self, message: &'a Message) -> StoreFuture<'a, Transition>;

    /// Bumps the retry count and last-attempt timestamp of a message that is
    /// staying `pending`.
    fn increment_retry(&self, id: i64, attempted_at: DateTime<Utc>) -> StoreFuture<'_, ()>;

    /// Messages in `status`, newest first.
    fn list_by_status(
        &self,
        status: MessageStatus,
        limit: u32,
        offset: u32,
    ) -> StoreFuture<'_, Vec<Message>>;
}
