use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    cache::{memory::MemoryCache, redis::RedisCache, ResultCache},
    config::Config,
    db,
    dispatcher::Dispatcher,
    error::Error,
    message::{Message, MessageStatus},
    scheduler::{Scheduler, Task, TaskFuture},
    store::{sqlite::SqliteMessageStore, MessageStore},
    transport::{http::HttpWebhook, RetryingTransport},
};

/// Owns the dispatcher and the scheduler that drives it.
pub struct MessageService {
    dispatcher: Arc<Dispatcher>,
    scheduler: Scheduler,
}

impl MessageService {
    pub fn new(dispatcher: Dispatcher) -> Self {
        let dispatcher = Arc::new(dispatcher);
        let period = dispatcher.config().poll_interval;

        let task: Task = {
            let dispatcher = dispatcher.clone();
            Arc::new(move |cancel: CancellationToken| -> TaskFuture {
                let dispatcher = dispatcher.clone();
                Box::pin(async move {
                    dispatcher.tick(&cancel).await?;
                    Ok(())
                })
            })
        };

        Self {
            dispatcher,
            scheduler: Scheduler::new("dispatcher", period, task),
        }
    }

    /// Connects every backend named in `config` and wires up the dispatcher.
    pub async fn connect_with(config: &Config) -> Result<Self, Error> {
        let pool = db::connect(config).await?;
        let store =
            SqliteMessageStore::new(pool, config.max_retry_count, config.store_timeout());

        let cache: Arc<dyn ResultCache> = match config.redis_url() {
            Some(url) => {
                tracing::info!("Using redis result cache");
                let cache =
                    RedisCache::connect(url, config.cache_ttl(), config.store_timeout()).await?;
                Arc::new(cache)
            }
            None => {
                tracing::info!("Using in-process result cache");
                Arc::new(MemoryCache::new(config.cache_ttl()))
            }
        };

        let webhook = HttpWebhook::new(config.webhook_url()?, config.request_timeout())?;

        let dispatcher = Dispatcher::builder()
            .store(Arc::new(store))
            .cache(cache)
            .transport(RetryingTransport::new(Arc::new(webhook), config.backoff()))
            .config(config.dispatch())
            .build();

        Ok(Self::new(dispatcher))
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Starts periodic dispatching. Calling it while already running is a no-op.
    pub async fn start_auto_sending(&self) -> Result<(), Error> {
        if self.scheduler.start().await {
            tracing::info!("Automatic message sending started");
        } else {
            tracing::debug!("Automatic message sending already running");
        }
        Ok(())
    }

    /// Stops periodic dispatching and waits for the in-flight tick to finish.
    pub async fn stop_auto_sending(&self) -> Result<(), Error> {
        if self.scheduler.stop().await {
            tracing::info!("Automatic message sending stopped");
        } else {
            tracing::debug!("Automatic message sending was not running");
        }
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.scheduler.is_running().await
    }

    /// Delivered messages, newest first.
    pub async fn get_sent_messages(&self, limit: u32, offset: u32) -> Result<Vec<Message>, Error> {
        self.dispatcher
            .store()
            .list_by_status(MessageStatus::Sent, limit, offset)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        db::memory_pool,
        dispatcher::DispatchConfig,
        transport::testing::{fast_policy, ScriptedWebhook},
    };

    async fn service(poll_interval: Duration) -> (MessageService, SqliteMessageStore) {
        let store = SqliteMessageStore::new(memory_pool().await, 5, Duration::from_secs(10));
        let dispatcher = Dispatcher::builder()
            .store(Arc::new(store.clone()))
            .cache(Arc::new(MemoryCache::new(Duration::from_secs(60))))
            .transport(RetryingTransport::new(
                ScriptedWebhook::new([ScriptedWebhook::ok("X")]),
                fast_policy(2),
            ))
            .config(
                DispatchConfig::builder()
                    .poll_interval(poll_interval)
                    .build(),
            )
            .build();

        (MessageService::new(dispatcher), store)
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_is_safe_when_stopped() {
        let (service, _store) = service(Duration::from_secs(3600)).await;

        service.stop_auto_sending().await.unwrap();
        assert!(!service.is_running().await);

        service.start_auto_sending().await.unwrap();
        service.start_auto_sending().await.unwrap();
        assert!(service.is_running().await);

        service.stop_auto_sending().await.unwrap();
        service.stop_auto_sending().await.unwrap();
        assert!(!service.is_running().await);
    }

    #[tokio::test]
    async fn test_started_service_delivers_backlog() {
        let (service, store) = service(Duration::from_secs(3600)).await;
        for i in 0..3 {
            store.create(format!("r{i}"), "hi").await.unwrap();
        }

        service.start_auto_sending().await.unwrap();
        for _ in 0..100 {
            if store.find_all_due().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        service.stop_auto_sending().await.unwrap();

        let sent = service.get_sent_messages(10, 0).await.unwrap();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|m| m.status == MessageStatus::Sent));
    }

    #[tokio::test]
    async fn test_sent_messages_are_paginated_newest_first() {
        let (service, store) = service(Duration::from_secs(3600)).await;

        let mut ids = Vec::new();
        for i in 0..3 {
            let message = store.create(format!("r{i}"), "hi").await.unwrap();
            let sent = message.into_sent(format!("ext-{i}"), Some(200), chrono::Utc::now());
            store.update(&sent).await.unwrap();
            ids.push(sent.id);
        }
        store.create("pending", "hi").await.unwrap();

        let page: Vec<_> = service
            .get_sent_messages(2, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(page, [ids[2], ids[1]]);

        let page = service.get_sent_messages(2, 2).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, ids[0]);
    }
}
