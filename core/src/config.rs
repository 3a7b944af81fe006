//! Client configuration.
//!
//! All types derive Serde traits so a configuration can be loaded from TOML.
//! Durations are whole milliseconds; `0` disables the corresponding timeout.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::error::ConfigError;

/// Root configuration for a `Client`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Worker threads of the background runtime.
    pub worker_threads: usize,

    /// Deadline for establishing a new connection (TCP and TLS).
    pub connect_timeout_ms: u64,

    /// Default deadline for a whole perform; requests may override it.
    pub request_timeout_ms: u64,

    /// Sent as `User-Agent` unless the request sets one.
    pub user_agent: Option<String>,

    /// Largest accepted status line plus headers.
    pub max_response_head_bytes: usize,

    /// Largest accepted response body.
    pub max_response_body_bytes: usize,

    /// What dropping the client does with in-flight performs.
    pub shutdown: ShutdownPolicy,

    pub pool: PoolConfig,

    pub tls: TlsConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            user_agent: Some(concat!("liberty/", env!("CARGO_PKG_VERSION")).to_string()),
            max_response_head_bytes: 64 * 1024,
            max_response_body_bytes: 64 * 1024 * 1024,
            shutdown: ShutdownPolicy::default(),
            pool: PoolConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

/// Connection pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Cap on open connections per (scheme, host, port). Requests beyond the
    /// cap wait in FIFO order.
    pub max_connections_per_host: usize,

    /// Cap on idle connections kept per key.
    pub max_idle_per_host: usize,

    /// Idle connections older than this are closed.
    pub idle_timeout_ms: u64,

    /// How long a request may wait for a free connection slot.
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_host: 8,
            max_idle_per_host: 8,
            idle_timeout_ms: 90_000,
            acquire_timeout_ms: 30_000,
        }
    }
}

/// TLS settings. Trust policy beyond "trust this bundle" is left to
/// embedders, who can hand a `rustls::ClientConfig` to the client builder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM bundle of trusted root certificates.
    pub ca_file: Option<PathBuf>,
}

/// Behavior of `Client` drop while performs are in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPolicy {
    /// Cancel pending performs; each handler fires with `cancelled`.
    #[default]
    Cancel,
    /// Block until pending performs finish on their own.
    Drain,
}

impl ClientConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker_threads must be at least 1".into()));
        }
        if self.pool.max_connections_per_host == 0 {
            return Err(ConfigError::Invalid(
                "pool.max_connections_per_host must be at least 1".into(),
            ));
        }
        if self.pool.max_connections_per_host > Semaphore::MAX_PERMITS {
            return Err(ConfigError::Invalid(format!(
                "pool.max_connections_per_host must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.max_response_head_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_response_head_bytes must be positive".into(),
            ));
        }
        if let Some(agent) = &self.user_agent {
            if agent.bytes().any(|b| b == b'\r' || b == b'\n') {
                return Err(ConfigError::Invalid("user_agent contains a line break".into()));
            }
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        millis(self.request_timeout_ms)
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        millis(self.idle_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        millis(self.acquire_timeout_ms)
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
