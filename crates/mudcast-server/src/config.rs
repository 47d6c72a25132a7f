//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (MUDCAST_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use mudcast_core::{Channel, ChannelLocks, RegistryConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Channels created at boot.
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelConfig>,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of logged-in sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Maximum number of channels.
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,

    /// Maximum channel message length in characters.
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,

    /// Lines of scrollback kept per channel.
    #[serde(default = "default_history_length")]
    pub history_length: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval advertised to clients, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Idle time after which a session is dropped, in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// A channel declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel key.
    pub key: String,

    #[serde(default)]
    pub aliases: Vec<String>,

    #[serde(default)]
    pub description: String,

    /// Deliver only to connected subscribers.
    #[serde(default = "default_true")]
    pub online_only: bool,

    /// Subscribe every player on login.
    #[serde(default)]
    pub auto_join: bool,

    #[serde(default)]
    pub locks: ChannelLocks,
}

impl ChannelConfig {
    /// Build the channel this entry describes.
    #[must_use]
    pub fn to_channel(&self) -> Channel {
        Channel::new(self.key.clone())
            .with_aliases(self.aliases.iter().cloned())
            .with_description(self.description.clone())
            .with_online_only(self.online_only)
            .with_locks(self.locks.clone())
    }
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_sessions() -> usize {
    10_000
}

fn default_max_channels() -> usize {
    RegistryConfig::default().max_channels
}

fn default_max_message_length() -> usize {
    2_000
}

fn default_history_length() -> usize {
    mudcast_core::hooks::DEFAULT_HISTORY_LENGTH
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    90_000 // 90 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_channels() -> Vec<ChannelConfig> {
    vec![ChannelConfig {
        key: "Public".to_string(),
        aliases: vec!["pub".to_string()],
        description: "Public discussion".to_string(),
        online_only: true,
        auto_join: true,
        locks: ChannelLocks::default(),
    }]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            channels: default_channels(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            max_channels: default_max_channels(),
            max_message_length: default_max_message_length(),
            history_length: default_history_length(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults, then apply environment
    /// overrides.
    ///
    /// `MUDCAST_CONFIG` names an explicit file; otherwise the usual locations
    /// are tried in order.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override is malformed.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("MUDCAST_CONFIG") {
            Ok(path) => Self::from_file(shellexpand::tilde(&path).as_ref())?,
            Err(_) => Self::from_default_paths()?,
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn from_default_paths() -> Result<Self> {
        let config_paths = [
            "mudcast.toml",
            "/etc/mudcast/mudcast.toml",
            "~/.config/mudcast/mudcast.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply `MUDCAST_HOST` / `MUDCAST_PORT` from `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if the port is not a number.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("MUDCAST_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("MUDCAST_PORT") {
            self.port = port
                .parse()
                .with_context(|| format!("Invalid MUDCAST_PORT: {port}"))?;
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Registry limits derived from this config.
    #[must_use]
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_channels: self.limits.max_channels,
        }
    }
}
