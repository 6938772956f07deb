//! Relay configuration
//!
//! Every field has a default, so a file only needs the values it changes.
//! Unknown keys are ignored.

use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for both process roles
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Dispatcher (server role) settings
    pub server: DispatcherConfig,

    /// Worker role settings
    pub worker: WorkerConfig,
}

/// Dispatcher configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Listener for worker links
    pub link: LinkListenConfig,

    /// Listener for SOCKS clients
    pub socks: SocksListenConfig,

    /// Metrics endpoint
    pub metrics: MetricsConfig,
}

/// Worker link listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkListenConfig {
    pub host: String,
    pub port: u16,
    pub backlog: u32,

    /// Close a worker link after this much silence; 0 disables
    pub idle_close_timeout_ms: u64,
}

/// SOCKS listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocksListenConfig {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the metrics endpoint
    pub enabled: bool,

    /// Metrics listen address
    pub bind_address: String,

    /// Metrics path
    pub path: String,
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Dispatchers to connect to, tried in order on every reconnect
    pub servers: Vec<ServerAddress>,

    /// Send a registration message on every (re)connect
    pub auto_register: bool,

    /// Ping the dispatcher this often; 0 disables
    pub idle_ping_interval_ms: u64,

    /// Wait between reconnect attempts
    pub reconnect_interval_ms: u64,

    /// Give up after this many consecutive failed connects
    pub max_reconnect_attempts: Option<u32>,
}

/// Dispatcher address as seen by a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl Default for LinkListenConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
            backlog: 1024,
            idle_close_timeout_ms: 60_000,
        }
    }
}

impl Default for SocksListenConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 1080,
            backlog: 1024,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "127.0.0.1:9090".to_string(),
            path: "/metrics".to_string(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            servers: vec![ServerAddress {
                host: "localhost".to_string(),
                port: 8081,
            }],
            auto_register: true,
            idle_ping_interval_ms: 30_000,
            reconnect_interval_ms: 3_000,
            max_reconnect_attempts: None,
        }
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl LinkListenConfig {
    pub fn idle_close_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.idle_close_timeout_ms)
    }
}

impl WorkerConfig {
    pub fn idle_ping_interval(&self) -> Option<Duration> {
        non_zero_millis(self.idle_ping_interval_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(ProxyError::config("Worker needs at least one server address"));
        }
        if let Some(server) = self.servers.iter().find(|s| s.port == 0 || s.host.is_empty()) {
            return Err(ProxyError::config(format!(
                "Invalid server address: {}",
                server
            )));
        }
        if self.reconnect_interval_ms == 0 {
            return Err(ProxyError::config("Reconnect interval must be positive"));
        }
        if self.max_reconnect_attempts == Some(0) {
            return Err(ProxyError::config("max_reconnect_attempts must be positive"));
        }
        Ok(())
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.metrics.enabled {
            if !self.metrics.path.starts_with('/') {
                return Err(ProxyError::config(format!(
                    "Metrics path must start with '/': {}",
                    self.metrics.path
                )));
            }
            self.metrics
                .bind_address
                .parse::<std::net::SocketAddr>()
                .map_err(|e| ProxyError::config(format!("Invalid metrics bind address: {}", e)))?;
        }
        Ok(())
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.worker.validate()
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ProxyError::config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from file
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_toml(&content)
    }

    /// Save configuration to file
    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProxyError::config(format!("Failed to serialize config: {}", e)))?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}
