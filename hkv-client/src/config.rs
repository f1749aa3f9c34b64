//! # Client Configuration
//!
//! Purpose: Describe how to reach a sentinel-managed deployment and how the
//! resulting connection behaves. Built in code or loaded from JSON.
//!
//! ## JSON Shape
//!
//! ```json
//! {
//!   "sentinels": ["127.0.0.1:26379", "127.0.0.1:26380"],
//!   "master_name": "mymaster",
//!   "timeout_ms": 60000,
//!   "connect_timeout_ms": 10000,
//!   "drain_timeout_ms": 5000,
//!   "read_from": "SLAVE_PREFERRED",
//!   "client_name": "billing",
//!   "auto_reconnect": false
//! }
//! ```
//!
//! Only `sentinels` and `master_name` are required.

use std::time::Duration;

use hkv_common::HkvError;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::topology::{NodeAddress, ReadFrom};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Reasons a configuration is rejected.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("at least one sentinel address is required")]
    NoSentinels,
    #[error("master name must not be empty")]
    EmptyMasterName,
    #[error("invalid sentinel address '{0}', expected host:port")]
    InvalidAddress(String),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

impl From<ConfigError> for HkvError {
    fn from(err: ConfigError) -> Self {
        HkvError::Config(err.to_string())
    }
}

/// Configuration for a master/replica connection discovered via sentinels.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Sentinel endpoints, tried in order, e.g. "127.0.0.1:26379".
    pub sentinels: Vec<String>,
    /// Name of the monitored master.
    pub master_name: String,
    /// Default bound for synchronous command execution.
    #[serde(rename = "timeout_ms", default = "default_timeout", deserialize_with = "millis")]
    pub timeout: Duration,
    /// Bound for establishing one TCP connection.
    #[serde(
        rename = "connect_timeout_ms",
        default = "default_connect_timeout",
        deserialize_with = "millis"
    )]
    pub connect_timeout: Duration,
    /// How long close waits for in-flight replies.
    #[serde(
        rename = "drain_timeout_ms",
        default = "default_drain_timeout",
        deserialize_with = "millis"
    )]
    pub drain_timeout: Duration,
    /// Initial read routing policy.
    #[serde(default)]
    pub read_from: ReadFrom,
    /// Name announced with `CLIENT SETNAME` on every (re)connect.
    #[serde(default)]
    pub client_name: Option<String>,
    /// Reopen a closed node connection on the next dispatch.
    #[serde(default)]
    pub auto_reconnect: bool,
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_drain_timeout() -> Duration {
    DEFAULT_DRAIN_TIMEOUT
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

impl ClientConfig {
    /// Creates a configuration with defaults for everything but the
    /// sentinel list and master name.
    pub fn new<I, S>(sentinels: I, master_name: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ClientConfig {
            sentinels: sentinels.into_iter().map(Into::into).collect(),
            master_name: master_name.into(),
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            read_from: ReadFrom::default(),
            client_name: None,
            auto_reconnect: false,
        }
    }

    /// Parses and validates a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_read_from(mut self, read_from: ReadFrom) -> Self {
        self.read_from = read_from;
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Checks the invariants a connection attempt relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sentinels.is_empty() {
            return Err(ConfigError::NoSentinels);
        }
        if self.master_name.trim().is_empty() {
            return Err(ConfigError::EmptyMasterName);
        }
        for endpoint in &self.sentinels {
            if endpoint.parse::<NodeAddress>().is_err() {
                return Err(ConfigError::InvalidAddress(endpoint.clone()));
            }
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("connect timeout"));
        }
        Ok(())
    }
}
