//! Configuration types for the brokers.

use std::str::FromStr;
use std::time::Duration;

use crate::backoff::Backoff;
use crate::error::{Result, WaitqError};

/// Environment variable for the tier-1 wait time in milliseconds.
pub const ENV_TTL_BASE_MS: &str = "WAITQ_TTL_BASE_MS";
/// Environment variable for the retry budget.
pub const ENV_MAX_RETRIES: &str = "WAITQ_MAX_RETRIES";
/// Environment variable for the in-process queue capacity.
pub const ENV_QUEUE_CAPACITY: &str = "WAITQ_QUEUE_CAPACITY";
/// Environment variable for the AMQP connection URL.
pub const ENV_AMQP_URL: &str = "WAITQ_AMQP_URL";
/// Environment variable for the shutdown timeout in milliseconds.
pub const ENV_SHUTDOWN_TIMEOUT_MS: &str = "WAITQ_SHUTDOWN_TIMEOUT_MS";

/// Configuration shared by both brokers.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Wait time of the first retry tier.
    pub ttl_base: Duration,
    /// Maximum number of retries per message.
    pub max_retries: u32,
    /// Capacity of each in-process queue buffer.
    pub queue_capacity: usize,
    /// AMQP connection URL (durable broker only).
    pub amqp_url: String,
    /// How long `stop` waits for consumers to observe their sentinel.
    pub shutdown_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            ttl_base: Duration::from_millis(1000),
            max_retries: 3,
            queue_capacity: 1000,
            amqp_url: "amqp://127.0.0.1:5672/%2f".to_string(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl BrokerConfig {
    /// Create a new builder.
    pub fn builder() -> BrokerConfigBuilder {
        BrokerConfigBuilder::new()
    }

    /// Load configuration from `WAITQ_*` environment variables, falling back
    /// to defaults for unset ones.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            ttl_base: parse_var(&lookup, ENV_TTL_BASE_MS)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.ttl_base),
            max_retries: parse_var(&lookup, ENV_MAX_RETRIES)?.unwrap_or(defaults.max_retries),
            queue_capacity: parse_var(&lookup, ENV_QUEUE_CAPACITY)?
                .unwrap_or(defaults.queue_capacity),
            amqp_url: lookup(ENV_AMQP_URL).unwrap_or(defaults.amqp_url),
            shutdown_timeout: parse_var(&lookup, ENV_SHUTDOWN_TIMEOUT_MS)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_timeout),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check invariants that the builder cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(WaitqError::Config(
                "queue_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Backoff schedule for this configuration.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.ttl_base, self.max_retries)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| WaitqError::Config(format!("{}={:?}: {}", key, raw, e))),
    }
}

/// Builder for BrokerConfig.
#[derive(Debug, Default)]
pub struct BrokerConfigBuilder {
    config: BrokerConfig,
}

impl BrokerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the wait time of the first retry tier.
    pub fn ttl_base(mut self, ttl_base: Duration) -> Self {
        self.config.ttl_base = ttl_base;
        self
    }

    /// Set the retry budget.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    /// Set the in-process queue capacity.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Set the AMQP connection URL.
    pub fn amqp_url(mut self, url: impl Into<String>) -> Self {
        self.config.amqp_url = url.into();
        self
    }

    /// Set the shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Build the BrokerConfig.
    pub fn build(self) -> BrokerConfig {
        self.config
    }
}
