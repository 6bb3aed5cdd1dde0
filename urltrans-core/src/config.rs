//! Per-session tunables.

use std::time::Duration;

use serde::Deserialize;

use crate::diagnostics::DEFAULT_HANDSHAKE_ERROR_PATTERN;

/// Session configuration. Usually nested under `[session]` in the host's config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Ring buffer capacity in bytes (default 1 MiB).
    #[serde(default = "default_store_bytes")]
    pub store_bytes: usize,
    /// Soft cap on buffered bytes before the transfer pauses. Defaults to `store_bytes`.
    #[serde(default)]
    pub internal_buffer_size: Option<usize>,
    /// Seconds between reconnection attempts (default 3.0).
    #[serde(default = "default_reconnect_timeout")]
    pub reconnect_timeout: f64,
    /// Connect timeout in seconds (default 5).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Prefix of a library diagnostic that marks a TLS handshake failure.
    #[serde(default = "default_handshake_error_pattern")]
    pub handshake_error_pattern: String,
}

fn default_store_bytes() -> usize {
    1024 * 1024
}
fn default_reconnect_timeout() -> f64 {
    3.0
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_user_agent() -> String {
    concat!("urltrans/", env!("CARGO_PKG_VERSION")).to_string()
}
fn default_handshake_error_pattern() -> String {
    DEFAULT_HANDSHAKE_ERROR_PATTERN.to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            store_bytes: default_store_bytes(),
            internal_buffer_size: None,
            reconnect_timeout: default_reconnect_timeout(),
            connect_timeout: default_connect_timeout(),
            user_agent: default_user_agent(),
            handshake_error_pattern: default_handshake_error_pattern(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("store_bytes must be greater than zero")]
    ZeroStore,
    #[error("internal_buffer_size must be greater than zero")]
    ZeroInternalBuffer,
    #[error("reconnect_timeout must be a positive number of seconds, got {0}")]
    ReconnectTimeout(f64),
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store_bytes == 0 {
            return Err(ConfigError::ZeroStore);
        }
        if self.internal_buffer_size == Some(0) {
            return Err(ConfigError::ZeroInternalBuffer);
        }
        if !(self.reconnect_timeout.is_finite() && self.reconnect_timeout > 0.0) {
            return Err(ConfigError::ReconnectTimeout(self.reconnect_timeout));
        }
        Ok(())
    }

    pub fn internal_buffer_size(&self) -> usize {
        self.internal_buffer_size.unwrap_or(self.store_bytes)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs_f64(self.reconnect_timeout)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}
