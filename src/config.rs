//! Session and feed configuration
//!
//! Loaded from a JSON file. Every field is optional; omitted fields take the
//! defaults below.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::changefeed::{FeedError, FeedResult, FeedSettings};
use crate::observability::LogFormat;

/// Configuration file structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangefeedConfig {
    /// Server host (default: "127.0.0.1")
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port (default: 28015)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Liveness probe round-trip bound
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Connection establishment bound
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Ordinary query bound
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Attempts after the first for `subscribe_with_retry`
    #[serde(default = "default_max_subscribe_retries")]
    pub max_subscribe_retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Buffered record count that triggers a warning (0 = never warn)
    #[serde(default = "default_buffer_soft_limit")]
    pub buffer_soft_limit: usize,

    /// Listener leak threshold per category (0 = unlimited)
    #[serde(default = "default_max_listeners")]
    pub max_listeners: usize,

    /// Log filter used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// "compact" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    28015
}
fn default_probe_timeout_ms() -> u64 {
    1000
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_max_subscribe_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    100
}
fn default_buffer_soft_limit() -> usize {
    1000
}
fn default_max_listeners() -> usize {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for ChangefeedConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            probe_timeout_ms: default_probe_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_subscribe_retries: default_max_subscribe_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            buffer_soft_limit: default_buffer_soft_limit(),
            max_listeners: default_max_listeners(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl ChangefeedConfig {
    /// Load and validate configuration from file
    pub fn load(path: &Path) -> FeedResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| FeedError::Config(format!("Failed to read config: {}", e)))?;

        let config: ChangefeedConfig = serde_json::from_str(&content)
            .map_err(|e| FeedError::Config(format!("Invalid config JSON: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Reject settings the session cannot run with
    pub fn validate(&self) -> FeedResult<()> {
        if self.host.trim().is_empty() {
            return Err(FeedError::Config("host must not be empty".into()));
        }

        for (name, value) in [
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
        ] {
            if value == 0 {
                return Err(FeedError::Config(format!("{} must be > 0", name)));
            }
        }

        self.log_format
            .parse::<LogFormat>()
            .map_err(FeedError::Config)?;

        Ok(())
    }

    /// Get the server address string
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Per-feed tuning derived from this config
    pub fn feed_settings(&self) -> FeedSettings {
        FeedSettings {
            buffer_soft_limit: self.buffer_soft_limit,
            max_listeners: self.max_listeners,
        }
    }
}
