//! Server configuration.
//!
//! Values come from a TOML file when one is found, then `PULSE_HOST` and
//! `PULSE_PORT` override the listen address. Every section is optional.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Files tried in order when `PULSE_CONFIG` is unset.
const SEARCH_PATHS: &[&str] = &[
    "pulse.toml",
    "/etc/pulse/pulse.toml",
    "~/.config/pulse/pulse.toml",
];

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address.
    pub server: ServerConfig,
    /// Long-poll limits.
    pub events: EventsConfig,
    /// Presence expiry.
    pub presence: PresenceConfig,
    /// Prometheus exporter.
    pub metrics: MetricsConfig,
}

/// Listen address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Long-poll limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Events per source when the request gives no limit.
    pub default_limit: usize,
    /// Largest accepted limit.
    pub max_limit: usize,
    /// Wait in milliseconds when the request gives no timeout.
    pub default_timeout_ms: u64,
    /// Longest accepted wait in milliseconds.
    pub max_timeout_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            max_limit: 100,
            default_timeout_ms: 30_000,
            max_timeout_ms: 120_000,
        }
    }
}

impl EventsConfig {
    /// Resolve a requested limit, falling back to the default and capping at
    /// the maximum. A limit is at least 1.
    #[must_use]
    pub fn limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit.max(1))
    }

    /// Resolve a requested timeout in milliseconds. Zero is kept: it asks for
    /// a single check without waiting.
    #[must_use]
    pub fn timeout(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .unwrap_or(self.default_timeout_ms)
            .min(self.max_timeout_ms);
        Duration::from_millis(ms)
    }
}

/// Presence expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Inactivity in milliseconds after which a user is marked offline.
    pub idle_timeout_ms: u64,
    /// How often to look for idle users, in milliseconds.
    pub sweep_interval_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 300_000,
            sweep_interval_ms: 60_000,
        }
    }
}

impl PresenceConfig {
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Sweep period. Never zero.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

/// Prometheus exporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// `PULSE_CONFIG` names an explicit file, which must exist. Otherwise the
    /// first existing file of the search paths is used, or defaults if none
    /// exists. Environment overrides apply either way.
    ///
    /// # Errors
    ///
    /// Returns an error if the chosen file cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let path = match std::env::var("PULSE_CONFIG") {
            Ok(path) => Some(expand(&path)),
            Err(_) => SEARCH_PATHS
                .iter()
                .map(|path| expand(path))
                .find(|path| path.exists()),
        };

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Override the listen address from `PULSE_HOST` and `PULSE_PORT`.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("PULSE_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PULSE_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid PULSE_PORT: {port}"))?;
        }
        Ok(())
    }

    /// The socket address to listen on.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let ServerConfig { host, port } = &self.server;
        format!("{host}:{port}")
            .parse()
            .with_context(|| format!("Invalid bind address: {host}:{port}"))
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}
