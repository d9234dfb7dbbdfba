use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use reconcile::events::{RetryConfig, TerminalBehavior};
use reconcile::reconcilers::StaticForwarding;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be a {expected} URL, got '{value}'")]
    InvalidUrl {
        field: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("retry.backoff_factor must be at least 1.0, got {0}")]
    BackoffFactor(f64),
}

/// Event stream keepalive and reconnect timing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub ping_interval_ms: u64,
    /// A ping unanswered for this long marks the stream dead.
    pub pong_timeout_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
}

impl StreamConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: env_or("PORTAL_PING_INTERVAL_MS", 10_000),
            pong_timeout_ms: env_or("PORTAL_PONG_TIMEOUT_MS", 5_000),
            reconnect_initial_ms: 100,
            reconnect_max_ms: env_or("PORTAL_RECONNECT_MAX_MS", 30_000),
        }
    }
}

/// Schema of the credential that verifies a connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SchemaRef {
    pub name: String,
    pub version: String,
}

/// Top-level service configuration.
///
/// Defaults come from `PORTAL_*` environment variables; a TOML file may
/// override any subset of fields, and CLI flags override both.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    /// Base URL of the agent's HTTP API.
    pub agent_url: String,
    /// WebSocket URL of the agent's event stream.
    pub events_url: String,
    /// RocksDB directory. None keeps state in memory.
    pub state_path: Option<PathBuf>,
    pub request_timeout_ms: u64,
    /// Close agent connections that match no local invite.
    pub close_orphaned_connections: bool,
    pub identity_schema: Option<SchemaRef>,
    pub retry: RetryConfig,
    pub stream: StreamConfig,
    pub forwarding: StaticForwarding,
}

impl Default for PortalConfig {
    fn default() -> Self {
        let identity_schema = match (
            std::env::var("PORTAL_IDENTITY_SCHEMA_NAME"),
            std::env::var("PORTAL_IDENTITY_SCHEMA_VERSION"),
        ) {
            (Ok(name), Ok(version)) => Some(SchemaRef { name, version }),
            _ => None,
        };
        let defaults = RetryConfig::default();

        Self {
            agent_url: std::env::var("PORTAL_AGENT_URL")
                .unwrap_or_else(|_| "http://localhost:3000".into()),
            events_url: std::env::var("PORTAL_EVENTS_URL")
                .unwrap_or_else(|_| "ws://localhost:3000".into()),
            state_path: std::env::var("PORTAL_STATE_PATH").ok().map(PathBuf::from),
            request_timeout_ms: env_or("PORTAL_REQUEST_TIMEOUT_MS", 10_000),
            close_orphaned_connections: env_or("PORTAL_CLOSE_ORPHANED_CONNECTIONS", false),
            identity_schema,
            retry: RetryConfig {
                base_delay_ms: env_or("PORTAL_RETRY_BASE_DELAY_MS", defaults.base_delay_ms),
                backoff_factor: env_or("PORTAL_RETRY_BACKOFF_FACTOR", defaults.backoff_factor),
                max_retry_count: env_or("PORTAL_RETRY_MAX_COUNT", defaults.max_retry_count),
                terminal: match std::env::var("PORTAL_RETRY_TERMINAL").as_deref() {
                    Ok("abandon") => TerminalBehavior::Abandon,
                    _ => defaults.terminal,
                },
            },
            stream: StreamConfig::default(),
            forwarding: StaticForwarding::default(),
        }
    }
}

impl PortalConfig {
    /// Load from `path` if given, otherwise use the environment defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .context(format!("Failed to read {}", path.display()))?;
                Self::from_toml_str(&content)
                    .context(format!("Failed to parse config {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.agent_url.starts_with("http://") || self.agent_url.starts_with("https://")) {
            return Err(ConfigError::InvalidUrl {
                field: "agent_url",
                expected: "http(s)",
                value: self.agent_url.clone(),
            });
        }
        if !(self.events_url.starts_with("ws://") || self.events_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidUrl {
                field: "events_url",
                expected: "ws(s)",
                value: self.events_url.clone(),
            });
        }
        if self.stream.ping_interval_ms == 0 {
            return Err(ConfigError::Zero("stream.ping_interval_ms"));
        }
        if self.stream.pong_timeout_ms == 0 {
            return Err(ConfigError::Zero("stream.pong_timeout_ms"));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Zero("request_timeout_ms"));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(ConfigError::BackoffFactor(self.retry.backoff_factor));
        }
        Ok(())
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
