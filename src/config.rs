use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::{dispatcher::DispatchConfig, error::Error, transport::BackoffPolicy};

/// Process configuration, read from `POSTBOX_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file. In-memory when unset.
    pub db_path: Option<String>,
    pub db_max_connections: u32,

    pub bind_addr: String,
    pub port: u16,

    pub webhook_url: String,
    pub webhook_path: String,

    /// Redis connection string for the result cache. In-process when unset.
    pub redis_url: Option<String>,

    pub poll_interval_secs: u64,
    pub batch_size: u32,
    pub startup_batch_size: u32,
    pub max_retry_count: u32,

    pub backoff_initial_interval_ms: u64,
    pub backoff_randomization_factor: f64,
    pub backoff_multiplier: f64,
    pub backoff_max_interval_ms: u64,
    pub backoff_max_elapsed_ms: u64,
    pub backoff_max_retries: u32,

    pub cache_ttl_secs: u64,
    pub store_timeout_secs: u64,
    pub request_timeout_secs: u64,

    /// Start dispatching as soon as the process boots.
    pub autostart: bool,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("POSTBOX_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> Option<&str> {
        self.db_path.as_deref().filter(|p| !p.is_empty())
    }

    pub fn webhook_url(&self) -> Result<Url, Error> {
        Url::parse(&self.webhook_url).map_err(|e| {
            Error::invalid_parameter(format!("POSTBOX_WEBHOOK_URL {:?}: {e}", self.webhook_url))
        })
    }

    pub fn redis_url(&self) -> Option<&str> {
        self.redis_url.as_deref().filter(|u| !u.is_empty())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::builder()
            .initial_interval(Duration::from_millis(self.backoff_initial_interval_ms))
            .randomization_factor(self.backoff_randomization_factor)
            .multiplier(self.backoff_multiplier)
            .max_interval(Duration::from_millis(self.backoff_max_interval_ms))
            .max_elapsed_time(Duration::from_millis(self.backoff_max_elapsed_ms))
            .max_retries(self.backoff_max_retries)
            .build()
    }

    pub fn dispatch(&self) -> DispatchConfig {
        DispatchConfig::builder()
            .webhook_path(self.webhook_path.clone())
            .batch_size(self.batch_size)
            .startup_batch_size(self.startup_batch_size)
            .poll_interval(self.poll_interval())
            .build()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            db_max_connections: 5,
            bind_addr: "127.0.0.1".to_owned(),
            port: 8080,
            webhook_url: "http://127.0.0.1:9000".to_owned(),
            webhook_path: "/".to_owned(),
            redis_url: None,
            poll_interval_secs: 120,
            batch_size: 2,
            startup_batch_size: 10,
            max_retry_count: 5,
            backoff_initial_interval_ms: 100,
            backoff_randomization_factor: 0.5,
            backoff_multiplier: 1.5,
            backoff_max_interval_ms: 10_000,
            backoff_max_elapsed_ms: 15_000,
            backoff_max_retries: 5,
            cache_ttl_secs: 86_400,
            store_timeout_secs: 10,
            request_timeout_secs: 30,
            autostart: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();

        assert_eq!(config.db_path(), None);
        assert_eq!(config.redis_url(), None);
        assert_eq!(config.poll_interval(), Duration::from_secs(120));
        assert_eq!(config.cache_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.backoff(), BackoffPolicy::default());
        assert_eq!(config.dispatch(), DispatchConfig::default());
        assert_eq!(
            config.webhook_url().unwrap().as_str(),
            "http://127.0.0.1:9000/"
        );
    }

    #[test]
    fn test_invalid_webhook_url() {
        let config = Config {
            webhook_url: "not a url".to_owned(),
            ..Config::default()
        };

        assert!(matches!(
            config.webhook_url(),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_from_env_pairs() {
        let vars = [
            ("POSTBOX_DB_PATH", "/tmp/postbox.db"),
            ("POSTBOX_WEBHOOK_URL", "https://hooks.example.com/base/"),
            ("POSTBOX_BATCH_SIZE", "7"),
            ("POSTBOX_AUTOSTART", "false"),
            ("POSTBOX_REDIS_URL", ""),
        ]
        .map(|(k, v)| (k.to_owned(), v.to_owned()));

        let config: Config = envy::prefixed("POSTBOX_").from_iter(vars).unwrap();

        assert_eq!(config.db_path(), Some("/tmp/postbox.db"));
        assert_eq!(
            config.webhook_url().unwrap().host_str(),
            Some("hooks.example.com")
        );
        assert_eq!(config.batch_size, 7);
        assert!(!config.autostart);
        assert_eq!(config.redis_url(), None);
        // Untouched fields keep their defaults.
        assert_eq!(config.startup_batch_size, 10);
        assert_eq!(config.port, 8080);
    }
}
