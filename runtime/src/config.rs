//! Environment-based configuration for the relay and the search consumer.
//!
//! Every setting has a default; environment variables override them and are
//! validated up front so a bad deployment fails at startup, not mid-stream.
//!
//! | Variable | Default | Used by |
//! |---|---|---|
//! | `DATABASE_URL` | (required by the relay) | write-side outbox and fault store |
//! | `SEARCH_DATABASE_URL` | falls back to `DATABASE_URL` | search read model |
//! | `BIDSTREAM_BROKERS` | `localhost:9092` | bus |
//! | `BIDSTREAM_TOPIC` | `auction-events` | relay, consumer |
//! | `BIDSTREAM_CONSUMER_GROUP` | `search-service` | consumer |
//! | `BIDSTREAM_POLL_INTERVAL_MS` | `500` | relay |
//! | `BIDSTREAM_BATCH_SIZE` | `100` | relay |
//! | `BIDSTREAM_WORKERS` | `8` | consumer |
//! | `BIDSTREAM_MAX_ATTEMPTS` | `5` | bus redelivery |
//! | `BIDSTREAM_RETENTION_HOURS` | `168` | outbox purge, stash expiry |
//! | `METRICS_ADDR` | unset (no exporter) | binaries |
//!
//! # Example
//!
//! ```no_run
//! use bidstream_runtime::config::BidstreamConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BidstreamConfig::from_env()?;
//! let relay = config.relay_config();
//! println!("Relaying to {} every {:?}", relay.topic, relay.poll_interval);
//! # Ok(())
//! # }
//! ```

use crate::consumer::{ConsumerConfig, DEFAULT_CONSUMER_GROUP};
use crate::relay::RelayConfig;
use crate::retry::RetryPolicy;
use bidstream_core::AUCTION_EVENTS_TOPIC;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Environment variable not set
    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),

    /// Variable set to something that does not parse
    #[error("Invalid value for {key}: '{value}' ({reason})")]
    ParseError {
        /// Variable name
        key: String,
        /// Raw value
        value: String,
        /// Parser message
        reason: String,
    },

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Settings shared by the `outbox-relay` and `search-sync` binaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BidstreamConfig {
    /// Write-side database.
    pub database_url: Option<String>,
    /// Read-side database; `None` means the write-side one.
    pub search_database_url: Option<String>,
    /// Bootstrap brokers.
    pub brokers: String,
    /// Auction topic.
    pub topic: String,
    /// Consumer group of the search service.
    pub consumer_group: String,
    /// Relay pause between drained passes.
    pub poll_interval: Duration,
    /// Relay batch size.
    pub batch_size: usize,
    /// Concurrent projection workers.
    pub workers: usize,
    /// Delivery attempts before dead-lettering.
    pub max_attempts: u32,
    /// How long published outbox rows are kept and how long a stash gap may
    /// stay open before its envelopes are dead-lettered.
    pub retention: Duration,
    /// Prometheus listener.
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for BidstreamConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            search_database_url: None,
            brokers: "localhost:9092".to_string(),
            topic: AUCTION_EVENTS_TOPIC.to_string(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
            workers: 8,
            max_attempts: 5,
            retention: Duration::from_secs(7 * 24 * 3600),
            metrics_addr: None,
        }
    }
}

impl BidstreamConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is set to an invalid value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        config.database_url = var("DATABASE_URL");
        config.search_database_url = var("SEARCH_DATABASE_URL");
        if let Some(brokers) = var("BIDSTREAM_BROKERS") {
            config.brokers = brokers;
        }
        if let Some(topic) = var("BIDSTREAM_TOPIC") {
            config.topic = topic;
        }
        if let Some(group) = var("BIDSTREAM_CONSUMER_GROUP") {
            config.consumer_group = group;
        }
        if let Some(ms) = parse::<u64>("BIDSTREAM_POLL_INTERVAL_MS", var("BIDSTREAM_POLL_INTERVAL_MS"))? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(size) = parse("BIDSTREAM_BATCH_SIZE", var("BIDSTREAM_BATCH_SIZE"))? {
            config.batch_size = size;
        }
        if let Some(workers) = parse("BIDSTREAM_WORKERS", var("BIDSTREAM_WORKERS"))? {
            config.workers = workers;
        }
        if let Some(attempts) = parse("BIDSTREAM_MAX_ATTEMPTS", var("BIDSTREAM_MAX_ATTEMPTS"))? {
            config.max_attempts = attempts;
        }
        if let Some(hours) = parse::<u64>("BIDSTREAM_RETENTION_HOURS", var("BIDSTREAM_RETENTION_HOURS"))? {
            config.retention = Duration::from_secs(hours.saturating_mul(3600));
        }
        config.metrics_addr = parse("METRICS_ADDR", var("METRICS_ADDR"))?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ValidationError("batch size must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::ValidationError("workers must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationError("max attempts must be at least 1".into()));
        }
        if self.topic.trim().is_empty() || self.consumer_group.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "topic and consumer group must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// The write-side database URL.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EnvVarNotSet`] if `DATABASE_URL` is unset.
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or_else(|| ConfigError::EnvVarNotSet("DATABASE_URL".to_string()))
    }

    /// The read-side database URL, falling back to the write-side one.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EnvVarNotSet`] if neither is set.
    pub fn require_search_database_url(&self) -> Result<&str, ConfigError> {
        self.search_database_url
            .as_deref()
            .or(self.database_url.as_deref())
            .ok_or_else(|| ConfigError::EnvVarNotSet("SEARCH_DATABASE_URL".to_string()))
    }

    /// Backoff and attempt budget shared by relay and redelivery.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder().max_attempts(self.max_attempts).build()
    }

    /// Relay settings.
    #[must_use]
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig::default()
            .topic(self.topic.clone())
            .batch_size(self.batch_size)
            .poll_interval(self.poll_interval)
            .backoff(self.retry_policy())
    }

    /// Consumer settings.
    #[must_use]
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig::default()
            .topic(self.topic.clone())
            .consumer_group(self.consumer_group.clone())
            .workers(self.workers)
            .redelivery(self.retry_policy())
    }
}

fn parse<T>(key: &str, raw: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.map(|value| {
        value.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
            key: key.to_string(),
            value: value.clone(),
            reason: e.to_string(),
        })
    })
    .transpose()
}
