//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (SURGE_*)
//! - TOML configuration file

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use surge_core::DistributorConfig;

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

    /// Write pump configuration.
    #[serde(default)]
    pub pump: PumpConfig,

    /// Per-session timeouts and limits.
    #[serde(default)]
    pub session: SessionConfig,

    /// Distributed presence configuration.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path of the WebSocket stream endpoint.
    #[serde(default = "default_stream_path")]
    pub stream_path: String,
}

/// Write pump configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpConfig {
    /// Number of pump workers. Zero means one per available core.
    #[serde(default)]
    pub workers: usize,

    /// Capacity of the shared ready queue.
    #[serde(default = "default_ready_capacity")]
    pub ready_capacity: usize,
}

/// Per-session timeouts and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long a connection may stay unauthenticated, in milliseconds.
    #[serde(default = "default_login_timeout")]
    pub login_timeout_ms: u64,

    /// Liveness ping cadence, in milliseconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// Margin added to the ping interval to form the receive timeout,
    /// in milliseconds.
    #[serde(default = "default_receive_margin")]
    pub receive_margin_ms: u64,

    /// Maximum size of one physical frame in bytes.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

/// Distributed presence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Whether to publish presence to the directory store.
    #[serde(default)]
    pub enabled: bool,

    /// This node's identity. Empty means derive one from the process id.
    #[serde(default)]
    pub node: String,

    /// Lease TTL in seconds. Must exceed the refresh period.
    #[serde(default = "default_lease_ttl")]
    pub ttl_secs: u64,

    /// Lease keep-alive period in seconds.
    #[serde(default = "default_lease_refresh")]
    pub refresh_secs: u64,

    /// Per-call store timeout in milliseconds.
    #[serde(default = "default_store_timeout")]
    pub op_timeout_ms: u64,

    /// Capacity of the register/unregister queue.
    #[serde(default = "default_presence_queue")]
    pub queue_capacity: usize,
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

// Default value functions
fn default_host() -> String {
    std::env::var("SURGE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("SURGE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_stream_path() -> String {
    "/stream".to_string()
}

fn default_ready_capacity() -> usize {
    100_000
}

fn default_login_timeout() -> u64 {
    2_000 // 2 seconds
}

fn default_ping_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_receive_margin() -> u64 {
    10_000 // 10 seconds
}

fn default_max_frame_bytes() -> usize {
    64 * 1024 // 64 KB
}

fn default_lease_ttl() -> u64 {
    30
}

fn default_lease_refresh() -> u64 {
    10
}

fn default_store_timeout() -> u64 {
    200
}

fn default_presence_queue() -> usize {
    1000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            pump: PumpConfig::default(),
            session: SessionConfig::default(),
            presence: PresenceConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            stream_path: default_stream_path(),
        }
    }
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            ready_capacity: default_ready_capacity(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            login_timeout_ms: default_login_timeout(),
            ping_interval_ms: default_ping_interval(),
            receive_margin_ms: default_receive_margin(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node: String::new(),
            ttl_secs: default_lease_ttl(),
            refresh_secs: default_lease_refresh(),
            op_timeout_ms: default_store_timeout(),
            queue_capacity: default_presence_queue(),
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
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "surge.toml",
            "/etc/surge/surge.toml",
            "~/.config/surge/surge.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
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

    /// The socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error when host and port do not form a valid address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}

impl PumpConfig {
    /// The effective worker count.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl SessionConfig {
    #[must_use]
    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }

    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Read deadline per frame: a healthy client always shows traffic
    /// within one ping interval plus the margin.
    #[must_use]
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms + self.receive_margin_ms)
    }
}

impl PresenceConfig {
    /// This node's identity, derived from the process id when unset.
    #[must_use]
    pub fn node_name(&self) -> String {
        if self.node.is_empty() {
            format!("surge-{}", std::process::id())
        } else {
            self.node.clone()
        }
    }

    /// The distributor configuration this section describes.
    #[must_use]
    pub fn distributor_config(&self) -> DistributorConfig {
        DistributorConfig {
            node: self.node_name(),
            ttl: Duration::from_secs(self.ttl_secs),
            refresh: Duration::from_secs(self.refresh_secs),
            op_timeout: Duration::from_millis(self.op_timeout_ms),
            queue_capacity: self.queue_capacity,
        }
    }
}
