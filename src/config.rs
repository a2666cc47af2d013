// src/config.rs

//! Manages client configuration: loading, defaults, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::info;

/// Per-destination-kind prefetch defaults.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PrefetchPolicy {
    #[serde(default = "default_queue_prefetch")]
    pub queue: u32,
    #[serde(default = "default_topic_prefetch")]
    pub topic: u32,
    #[serde(default = "default_durable_topic_prefetch")]
    pub durable_topic: u32,
    #[serde(default = "default_queue_browser_prefetch")]
    pub queue_browser: u32,
}

impl Default for PrefetchPolicy {
    fn default() -> Self {
        Self {
            queue: default_queue_prefetch(),
            topic: default_topic_prefetch(),
            durable_topic: default_durable_topic_prefetch(),
            queue_browser: default_queue_browser_prefetch(),
        }
    }
}

fn default_queue_prefetch() -> u32 {
    1000
}
fn default_topic_prefetch() -> u32 {
    32766
}
fn default_durable_topic_prefetch() -> u32 {
    100
}
fn default_queue_browser_prefetch() -> u32 {
    500
}

/// Controls how rolled-back messages are redelivered.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RedeliveryPolicy {
    /// Redeliveries allowed before a message is poisoned. `-1` is unlimited.
    #[serde(default = "default_maximum_redeliveries")]
    pub maximum_redeliveries: i32,
    #[serde(with = "humantime_serde", default = "default_redelivery_delay")]
    pub initial_redelivery_delay: Duration,
    #[serde(with = "humantime_serde", default = "default_redelivery_delay")]
    pub redelivery_delay: Duration,
    #[serde(default)]
    pub use_exponential_backoff: bool,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound on any computed delay. Absent means uncapped.
    #[serde(with = "humantime_serde", default)]
    pub maximum_redelivery_delay: Option<Duration>,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            maximum_redeliveries: default_maximum_redeliveries(),
            initial_redelivery_delay: default_redelivery_delay(),
            redelivery_delay: default_redelivery_delay(),
            use_exponential_backoff: false,
            backoff_multiplier: default_backoff_multiplier(),
            maximum_redelivery_delay: None,
        }
    }
}

impl RedeliveryPolicy {
    /// The pause before delivering a message for the `redelivery_count`th time.
    ///
    /// Saturates at `Duration::MAX` instead of overflowing, then applies
    /// `maximum_redelivery_delay`.
    pub fn delay_for(&self, redelivery_count: u32) -> Duration {
        let delay = match redelivery_count {
            0 => return Duration::ZERO,
            1 => self.initial_redelivery_delay,
            n if self.use_exponential_backoff && !self.redelivery_delay.is_zero() => {
                let exponent = i32::try_from(n - 1).unwrap_or(i32::MAX);
                let nanos =
                    self.redelivery_delay.as_nanos() as f64 * self.backoff_multiplier.powi(exponent);
                if nanos.is_finite() && nanos < u64::MAX as f64 {
                    Duration::from_nanos(nanos.round() as u64)
                } else {
                    Duration::MAX
                }
            }
            _ => self.redelivery_delay,
        };
        match self.maximum_redelivery_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Whether a message delivered `redelivery_count` times must be poisoned.
    pub fn is_exhausted(&self, redelivery_count: u32) -> bool {
        self.maximum_redeliveries >= 0 && redelivery_count as i64 > self.maximum_redeliveries as i64
    }
}

fn default_maximum_redeliveries() -> i32 {
    6
}
fn default_redelivery_delay() -> Duration {
    Duration::from_secs(1)
}
fn default_backoff_multiplier() -> f64 {
    5.0
}

/// The resolved client configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClientConfig {
    /// Sent in the handshake. Generated from the connection id when absent.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Used when a request is issued with a zero timeout.
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// Bounds the disconnect request sent by `close()`.
    #[serde(with = "humantime_serde", default = "default_close_timeout")]
    pub close_timeout: Duration,
    /// A non-zero value forces every send to wait for a broker receipt.
    #[serde(with = "humantime_serde", default)]
    pub send_timeout: Duration,

    #[serde(default)]
    pub always_sync_send: bool,
    #[serde(default)]
    pub use_async_send: bool,
    #[serde(default = "default_true")]
    pub send_acks_async: bool,
    #[serde(default = "default_true")]
    pub dispatch_async: bool,

    #[serde(default)]
    pub prefetch: PrefetchPolicy,
    #[serde(default)]
    pub redelivery: RedeliveryPolicy,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_close_timeout() -> Duration {
    Duration::from_secs(15)
}
fn default_true() -> bool {
    true
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            username: None,
            password: None,
            log_level: default_log_level(),
            request_timeout: default_request_timeout(),
            close_timeout: default_close_timeout(),
            send_timeout: Duration::ZERO,
            always_sync_send: false,
            use_async_send: false,
            send_acks_async: true,
            dispatch_async: true,
            prefetch: PrefetchPolicy::default(),
            redelivery: RedeliveryPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Loads and validates a configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Failed to load config from '{path}'"))?;
        info!("Loaded client configuration from '{}'", path);
        Ok(config)
    }

    /// Parses and validates a configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: ClientConfig =
            toml::from_str(contents).context("Failed to parse client configuration TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(client_id) = &self.client_id {
            if client_id.trim().is_empty() {
                return Err(anyhow!("client_id cannot be empty when set"));
            }
        }
        if self.request_timeout.is_zero() {
            return Err(anyhow!("request_timeout cannot be 0"));
        }
        let p = &self.prefetch;
        if p.queue == 0 && p.topic == 0 && p.durable_topic == 0 && p.queue_browser == 0 {
            return Err(anyhow!("prefetch cannot be 0 for every destination kind"));
        }
        let multiplier = self.redelivery.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(anyhow!(
                "redelivery.backoff_multiplier must be a finite value of at least 1.0"
            ));
        }
        if self.redelivery.maximum_redeliveries < -1 {
            return Err(anyhow!(
                "redelivery.maximum_redeliveries must be -1 (unlimited) or greater"
            ));
        }
        Ok(())
    }
}
