//! Channel configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::codec::DEFAULT_MAX_SEGMENT_LEN;

pub const TRANSPORT_ENV: &str = "FORKLINE_TRANSPORT";
pub const MAX_SEGMENT_LEN_ENV: &str = "FORKLINE_MAX_SEGMENT_LEN";
pub const CONNECT_TIMEOUT_ENV: &str = "FORKLINE_CONNECT_TIMEOUT_SECS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Pipe,
    Tcp,
}

impl FromStr for TransportKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pipe" => Ok(Self::Pipe),
            "tcp" | "socket" => Ok(Self::Tcp),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub transport: TransportKind,
    /// Largest string segment a decoder accepts.
    pub max_segment_len: usize,
    /// How long the controller waits for a socket worker to connect.
    pub connect_timeout: Duration,
    /// How long a worker waits for `ByeAck` before exiting anyway.
    pub bye_ack_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelConfig {
    pub fn new() -> Self {
        Self {
            transport: TransportKind::Pipe,
            max_segment_len: DEFAULT_MAX_SEGMENT_LEN,
            connect_timeout: Duration::from_secs(30),
            bye_ack_timeout: Duration::from_secs(30),
        }
    }

    /// Defaults overridden by `FORKLINE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::new();

        if let Some(value) = lookup(TRANSPORT_ENV) {
            config.transport = value.parse().map_err(|_| ConfigError::InvalidValue {
                var: TRANSPORT_ENV,
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup(MAX_SEGMENT_LEN_ENV) {
            config.max_segment_len = match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        var: MAX_SEGMENT_LEN_ENV,
                        value,
                    });
                }
            };
        }
        if let Some(value) = lookup(CONNECT_TIMEOUT_ENV) {
            let secs = value.trim().parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                var: CONNECT_TIMEOUT_ENV,
                value: value.clone(),
            })?;
            config.connect_timeout = Duration::from_secs(secs);
        }

        tracing::debug!(
            transport = ?config.transport,
            max_segment_len = config.max_segment_len,
            connect_timeout_secs = config.connect_timeout.as_secs(),
            "Loaded channel config"
        );
        Ok(config)
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_max_segment_len(mut self, max: usize) -> Self {
        self.max_segment_len = max;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_bye_ack_timeout(mut self, timeout: Duration) -> Self {
        self.bye_ack_timeout = timeout;
        self
    }
}
