//! Configuration Module
//!
//! TOML-based configuration for the engine with support for:
//! - Server settings (listener and loopback ports)
//! - Pool and buffer capacities (hard bounds, fixed at startup)
//! - Session parameters (keep-alive grace, connect timeout)
//! - Environment variable overrides (EMBERQ_* prefix)

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::EngineConfig;

#[cfg(test)]
mod tests;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Server configuration
    pub server: ServerConfig,
    /// Capacity limits
    pub limits: LimitsConfig,
    /// Session configuration
    pub session: SessionConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// MQTT listener port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Local UDP wake-up port; 0 disables the wake-up channel
    #[serde(default = "default_loopback_port")]
    pub loopback_port: u16,
}

fn default_port() -> u16 {
    1883
}

fn default_loopback_port() -> u16 {
    1882
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            loopback_port: default_loopback_port(),
        }
    }
}

/// Capacity limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrently open network connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Topic tree node capacity
    #[serde(default = "default_max_topic_nodes")]
    pub max_topic_nodes: usize,
    /// Packet pool capacity
    #[serde(default = "default_max_packets")]
    pub max_packets: usize,
    /// Per-packet receive buffer in bytes
    #[serde(default = "default_rx_buffer")]
    pub rx_buffer: usize,
    /// Per-packet transmit buffer in bytes
    #[serde(default = "default_tx_buffer")]
    pub tx_buffer: usize,
    /// Bound on one topic level's length
    #[serde(default = "default_max_subtop_len")]
    pub max_subtop_len: usize,
    /// Bound on the client identifier length
    #[serde(default = "default_max_client_id_len")]
    pub max_client_id_len: usize,
}

fn default_max_connections() -> usize {
    16
}

fn default_max_topic_nodes() -> usize {
    128
}

fn default_max_packets() -> usize {
    32
}

fn default_rx_buffer() -> usize {
    1024
}

fn default_tx_buffer() -> usize {
    1024
}

fn default_max_subtop_len() -> usize {
    32
}

fn default_max_client_id_len() -> usize {
    64
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_topic_nodes: default_max_topic_nodes(),
            max_packets: default_max_packets(),
            rx_buffer: default_rx_buffer(),
            tx_buffer: default_tx_buffer(),
            max_subtop_len: default_max_subtop_len(),
            max_client_id_len: default_max_client_id_len(),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Keep-alive grace in percent of the negotiated interval
    #[serde(default = "default_ka_grace_percent")]
    pub ka_grace_percent: u32,
    /// How long a fresh connection may take to deliver CONNECT
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// Wait for continuation bytes mid-packet
    #[serde(with = "humantime_serde", default = "default_recv_timeout")]
    pub recv_timeout: Duration,
}

fn default_ka_grace_percent() -> u32 {
    50
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_recv_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ka_grace_percent: default_ka_grace_percent(),
            connect_timeout: default_connect_timeout(),
            recv_timeout: default_recv_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, applying `${VAR}`
    /// substitution and `EMBERQ_*` environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        let cfg: Config = config::Config::builder()
            .add_source(File::from_str(&substituted, FileFormat::Toml))
            .add_source(Environment::with_prefix("EMBERQ").separator("__"))
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Validation("server.port must be non-zero".into()));
        }
        if self.limits.rx_buffer < 8 || self.limits.tx_buffer < 8 {
            return Err(ConfigError::Validation(
                "buffer budgets must be at least 8 bytes".into(),
            ));
        }
        if self.limits.max_packets == 0 || self.limits.max_topic_nodes == 0 {
            return Err(ConfigError::Validation(
                "pool capacities must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Flatten into the engine's configuration
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            listener_port: self.server.port,
            loopback_port: self.server.loopback_port,
            max_connections: self.limits.max_connections,
            max_topic_nodes: self.limits.max_topic_nodes,
            max_subtop_len: self.limits.max_subtop_len,
            max_client_id_len: self.limits.max_client_id_len,
            max_packets: self.limits.max_packets,
            rx_buffer: self.limits.rx_buffer,
            tx_buffer: self.limits.tx_buffer,
            ka_grace_percent: self.session.ka_grace_percent,
            connect_timeout: self.session.connect_timeout,
            recv_timeout: self.session.recv_timeout,
        }
    }
}
