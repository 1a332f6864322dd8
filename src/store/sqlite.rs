//! SQLite-backed implementation of [`MessageStore`].
//!
//! Each operation checks out its own connection from the pool and is bounded by
//! the configured store timeout. Several processes may point at the same
//! database file; the status-guarded update keeps them from double-delivering.

use std::{future::Future, time::Duration};

use chrono::{DateTime, Utc};
use sqlx::{Acquire, SqlitePool};

use crate::{
    db,
    error::Error,
    message::{Message, MessageStatus, Transition},
};

use super::{MessageStore, StoreFuture};

#[derive(Clone)]
pub struct SqliteMessageStore {
    pool: SqlitePool,
    max_retry_count: u32,
    timeout: Duration,
}

impl SqliteMessageStore {
    pub fn new(pool: SqlitePool, max_retry_count: u32, timeout: Duration) -> Self {
        Self {
            pool,
            max_retry_count,
            timeout,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Inserts a new `pending` message.
    pub async fn create(
        &self,
        recipient: impl AsRef<str>,
        content: impl AsRef<str>,
    ) -> Result<Message, Error> {
        self.bounded("create", async {
            let mut tx = self.pool.begin().await?;

            let message =
                db::message::insert(tx.acquire().await?, recipient, content, Utc::now()).await?;

            tx.commit().await?;

            Ok(message)
        })
        .await
    }

    pub async fn get(&self, id: i64) -> Result<Option<Message>, Error> {
        self.bounded("get", async {
            let mut conn = self.pool.acquire().await?;
            Ok(db::message::get(&mut conn, id).await?)
        })
        .await
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout { operation }),
        }
    }
}

impl MessageStore for SqliteMessageStore {
    fn find_due(&self, limit: u32) -> StoreFuture<'_, Vec<Message>> {
        Box::pin(self.bounded("find_due", async move {
            let mut conn = self.pool.acquire().await?;
            Ok(db::message::find_due(&mut conn, self.max_retry_count, Some(limit)).await?)
        }))
    }

    fn find_all_due(&self) -> StoreFuture<'_, Vec<Message>> {
        Box::pin(self.bounded("find_all_due", async move {
            let mut conn = self.pool.acquire().await?;
            Ok(db::message::find_due(&mut conn, self.max_retry_count, None).await?)
        }))
    }

    fn update<'a>(&'a self, message: &'a Message) -> StoreFuture<'a, Transition> {
        Box::pin(self.bounded("update", async move {
            let mut tx = self.pool.begin().await?;

            let transition =
                db::message::update_if_pending(tx.acquire().await?, message, Utc::now()).await?;

            tx.commit().await?;

            tracing::debug!(message_id = message.id, ?transition, "Applied status update");

            Ok(transition)
        }))
    }

    fn increment_retry(&self, id: i64, attempted_at: DateTime<Utc>) -> StoreFuture<'_, ()> {
        Box::pin(self.bounded("increment_retry", async move {
            let mut tx = self.pool.begin().await?;

            let found = db::message::increment_retry(tx.acquire().await?, id, attempted_at).await?;

            tx.commit().await?;

            if !found {
                return Err(Error::message_not_found(id));
            }

            Ok(())
        }))
    }

    fn list_by_status(
        &self,
        status: MessageStatus,
        limit: u32,
        offset: u32,
    ) -> StoreFuture<'_, Vec<Message>> {
        Box::pin(self.bounded("list_by_status", async move {
            let mut conn = self.pool.acquire().await?;
            Ok(db::message::list_by_status(&mut conn, status, limit, offset).await?)
        }))
    }
}
