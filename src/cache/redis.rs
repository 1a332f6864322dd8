//! Redis implementation of the result cache.

use std::{future::Future, time::Duration};

use redis::{aio::MultiplexedConnection, AsyncCommands, Client};

use crate::error::Error;

use super::{CacheFuture, ResultCache};

#[derive(Clone)]
pub struct RedisCache {
    conn: MultiplexedConnection,
    ttl: Duration,
    timeout: Duration,
}

/// Fails with [`Error::Timeout`] if `fut` does not finish within `timeout`.
async fn bounded<T>(
    timeout: Duration,
    operation: &'static str,
    fut: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::Timeout { operation }),
    }
}

impl RedisCache {
    /// Connects to the Redis server at `url`, e.g. `redis://:password@host:6379/0`.
    ///
    /// The handshake and every later command are bounded by `timeout`.
    pub async fn connect(url: &str, ttl: Duration, timeout: Duration) -> Result<Self, Error> {
        let client = Client::open(url)?;

        let conn = bounded(timeout, "cache_connect", async {
            let mut conn = client.get_multiplexed_async_connection().await?;
            redis::cmd("PING").query_async::<()>(&mut conn).await?;
            Ok::<_, Error>(conn)
        })
        .await?;

        tracing::info!("Connected to Redis");

        Ok(Self { conn, ttl, timeout })
    }
}

impl ResultCache for RedisCache {
    fn set<'a>(&'a self, key: &'a str, value: String) -> CacheFuture<'a, ()> {
        Box::pin(bounded(self.timeout, "cache_set", async move {
            let mut conn = self.conn.clone();
            // SET EX rejects a zero expiry.
            let seconds = self.ttl.as_secs().max(1);
            conn.set_ex::<_, _, ()>(key, value, seconds).await?;
            Ok(())
        }))
    }

    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>> {
        Box::pin(bounded(self.timeout, "cache_get", async move {
            let mut conn = self.conn.clone();
            let value: Option<String> = conn.get(key).await?;
            Ok(value)
        }))
    }
}
