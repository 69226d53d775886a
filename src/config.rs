//! Configuration management for Bouncer.
//!
//! Values come from an optional config file layered under environment
//! variables prefixed with `BOUNCER__` (e.g. `BOUNCER__SERVER__LISTEN_ADDR`).
//! Command-line flags are applied on top by the binary.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::Result;
use crate::mesh::ClusterConfig;

/// Main configuration for the Bouncer service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BouncerConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Bound on each counter store call, in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Path to the rate limit rules file; built-in rules when unset
    #[serde(default)]
    pub rules_path: Option<String>,

    /// How often to re-read the rules file, in seconds (0 disables)
    #[serde(default = "default_reload_interval")]
    pub rules_reload_interval_secs: u64,

    /// Class applied by the `/rate-limit-check` endpoint
    #[serde(default = "default_check_class")]
    pub check_class: String,

    /// How often the in-memory store drops expired counters, in seconds
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            store_timeout_ms: default_store_timeout_ms(),
            rules_path: None,
            rules_reload_interval_secs: default_reload_interval(),
            check_class: default_check_class(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

impl LimiterConfig {
    /// The store timeout as a duration.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn default_store_timeout_ms() -> u64 {
    250
}

fn default_reload_interval() -> u64 {
    60
}

fn default_check_class() -> String {
    "login".to_string()
}

fn default_purge_interval() -> u64 {
    60
}

/// Which counter store backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local counters
    #[default]
    Memory,
    /// Counters shared over the gossip mesh
    Mesh,
    /// Counters in Redis (needs the `redis-store` feature)
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Selected backend
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Gossip mesh settings
    #[serde(default)]
    pub mesh: MeshConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            mesh: MeshConfig::default(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

/// Gossip mesh configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Node identifier; a random UUID when unset
    #[serde(default)]
    pub node_id: Option<String>,

    /// Gossip listen address
    #[serde(default = "default_gossip_addr")]
    pub listen_addr: SocketAddr,

    /// Address advertised to peers; the listen address when unset
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    /// Peers to contact on startup
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    /// Nodes only gossip with peers of the same cluster id
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    /// Gossip interval in milliseconds
    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,

    /// Seconds before a dead node's state may be dropped
    #[serde(default = "default_dead_node_grace_secs")]
    pub dead_node_grace_secs: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            listen_addr: default_gossip_addr(),
            advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval_ms(),
            dead_node_grace_secs: default_dead_node_grace_secs(),
        }
    }
}

impl MeshConfig {
    /// Build the cluster configuration.
    pub fn to_cluster_config(&self) -> ClusterConfig {
        let defaults = ClusterConfig::default();
        ClusterConfig {
            node_id: self.node_id.clone().unwrap_or(defaults.node_id),
            listen_addr: self.listen_addr,
            advertise_addr: self.advertise_addr.unwrap_or(self.listen_addr),
            seed_nodes: self.seed_nodes.clone(),
            cluster_id: self.cluster_id.clone(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            dead_node_grace_period: Duration::from_secs(self.dead_node_grace_secs),
        }
    }
}

fn default_gossip_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "bouncer".to_string()
}

fn default_gossip_interval_ms() -> u64 {
    100
}

fn default_dead_node_grace_secs() -> u64 {
    3600
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Output format
    #[serde(default)]
    pub format: LogFormat,

    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl BouncerConfig {
    /// Load configuration from an optional file plus `BOUNCER__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(::config::File::from(path));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("BOUNCER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("store.mesh.seed_nodes"),
        );

        let config: BouncerConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }
}
