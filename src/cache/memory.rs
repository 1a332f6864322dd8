//! In-process implementation of the result cache.
//!
//! Used when no Redis URL is configured, and in tests.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::time::Instant;

use super::{CacheFuture, ResultCache};

#[derive(Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// Upper bound on how often `set` scans for expired entries.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Thread-safe in-memory cache with per-entry expiry.
///
/// Expired entries are dropped on `get` and by a periodic sweep piggybacked on
/// `set`, so a write-only workload does not grow the map without bound.
#[derive(Clone)]
pub struct MemoryCache {
    entries: Arc<papaya::HashMap<String, Entry>>,
    ttl: Duration,
    next_sweep: Arc<Mutex<Instant>>,
}

impl MemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(papaya::HashMap::new()),
            ttl,
            next_sweep: Arc::new(Mutex::new(Instant::now() + Self::sweep_interval(ttl))),
        }
    }

    fn sweep_interval(ttl: Duration) -> Duration {
        ttl.clamp(Duration::from_millis(1), MAX_SWEEP_INTERVAL)
    }

    /// Removes expired entries if the last sweep is old enough.
    fn maybe_sweep(&self, now: Instant) {
        {
            // Another writer is already sweeping.
            let Ok(mut next_sweep) = self.next_sweep.try_lock() else {
                return;
            };
            if now < *next_sweep {
                return;
            }
            *next_sweep = now + Self::sweep_interval(self.ttl);
        }

        let entries = self.entries.pin();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            entries.remove(key);
        }

        if !expired.is_empty() {
            tracing::debug!(removed = expired.len(), "Swept expired cache entries");
        }
    }

    /// Number of entries that have not expired yet.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .pin()
            .iter()
            .filter(|(_, entry)| entry.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResultCache for MemoryCache {
    fn set<'a>(&'a self, key: &'a str, value: String) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            let now = Instant::now();
            self.maybe_sweep(now);

            let entry = Entry {
                value,
                expires_at: now + self.ttl,
            };
            self.entries.pin().insert(key.to_owned(), entry);
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> CacheFuture<'a, Option<String>> {
        Box::pin(async move {
            let entries = self.entries.pin();
            match entries.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
                Some(_) => {
                    entries.remove(key);
                    Ok(None)
                }
                None => Ok(None),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let cache = MemoryCache::new(Duration::from_secs(60));

        cache.set("message:1", "one".to_owned()).await.unwrap();
        cache.set("message:1", "uno".to_owned()).await.unwrap();

        assert_eq!(
            cache.get("message:1").await.unwrap().as_deref(),
            Some("uno")
        );
        assert_eq!(cache.get("message:2").await.unwrap(), None);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = MemoryCache::new(Duration::from_secs(60));
        cache.set("message:1", "one".to_owned()).await.unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get("message:1").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("message:1").await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_sweep_expired_entries() {
        let cache = MemoryCache::new(Duration::from_secs(1));
        for i in 0..1000 {
            cache.set(&format!("message:{i}"), "x".to_owned()).await.unwrap();
        }
        assert_eq!(cache.entries.len(), 1000);

        tokio::time::advance(Duration::from_secs(3600)).await;

        for i in 1000..1010 {
            cache.set(&format!("message:{i}"), "x".to_owned()).await.unwrap();
        }

        assert_eq!(cache.entries.len(), 10);
        assert_eq!(cache.len(), 10);
    }
}
