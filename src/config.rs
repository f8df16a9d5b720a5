//! WolfCluster Configuration
//!
//! This module provides configuration structures for the WolfCluster
//! membership and replication coordinator.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::cluster::ClusterMember;

/// Grace period applied before replay when neither the scheme parameters
/// nor the replay section set one
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 5000;

/// Main WolfCluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfClusterConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster and membership scheme configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Replay configuration
    #[serde(default)]
    pub replay: ReplayConfig,

    /// Message buffer configuration
    #[serde(default)]
    pub buffer: BufferConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Address to bind for peer communication
    pub bind_address: String,

    /// Advertised address for other members to connect
    #[serde(default)]
    pub advertise_address: Option<String>,

    /// Properties published with this member (role tags, capabilities)
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Logical cluster name; members of other domains are ignored
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Membership scheme name (tag, wka, broadcast)
    #[serde(default = "default_membership_scheme")]
    pub membership_scheme: String,

    /// Scheme-specific parameters
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Replay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Wait after a join before the first replay attempt
    /// (overrides the membership scheme's grace period)
    #[serde(default)]
    pub grace_period_ms: Option<u64>,

    /// Send attempts per message before the replay is abandoned
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff after the first failed attempt
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff cap
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Timeout for a single send attempt
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Replays allowed to run concurrently
    #[serde(default = "default_replay_workers")]
    pub workers: usize,
}

/// Message buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Maximum number of buffered messages
    #[serde(default = "default_buffer_capacity")]
    pub capacity: usize,

    /// How long a message stays available for replay
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// How often expired messages and received-message records are purged
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_domain() -> String {
    "wolfcluster.domain".to_string()
}

fn default_membership_scheme() -> String {
    "wka".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_send_timeout_ms() -> u64 {
    5000
}

fn default_replay_workers() -> usize {
    8
}

fn default_buffer_capacity() -> usize {
    10_000
}

fn default_retention_secs() -> u64 {
    300
}

fn default_cleanup_interval_secs() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            membership_scheme: default_membership_scheme(),
            parameters: HashMap::new(),
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: None,
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            workers: default_replay_workers(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: default_buffer_capacity(),
            retention_secs: default_retention_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ReplayConfig {
    pub fn grace_period(&self) -> Option<Duration> {
        self.grace_period_ms.map(Duration::from_millis)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl BufferConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl WolfClusterConfig {
    /// Minimal configuration for a node, everything else defaulted
    pub fn new(node_id: impl Into<String>, bind_address: impl Into<String>) -> Self {
        Self {
            node: NodeConfig {
                id: node_id.into(),
                bind_address: bind_address.into(),
                advertise_address: None,
                properties: BTreeMap::new(),
            },
            cluster: ClusterConfig::default(),
            replay: ReplayConfig::default(),
            buffer: BufferConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfClusterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        self.local_member()?;

        if self.cluster.membership_scheme.trim().is_empty() {
            return Err(crate::Error::Config(
                "cluster.membership_scheme cannot be empty".into(),
            ));
        }

        if self.replay.max_attempts == 0 {
            return Err(crate::Error::Config("replay.max_attempts must be at least 1".into()));
        }

        if self.replay.workers == 0 {
            return Err(crate::Error::Config("replay.workers must be at least 1".into()));
        }

        if self.replay.max_backoff_ms < self.replay.initial_backoff_ms {
            return Err(crate::Error::Config(
                "replay.max_backoff_ms cannot be lower than replay.initial_backoff_ms".into(),
            ));
        }

        if self.buffer.capacity == 0 {
            return Err(crate::Error::Config("buffer.capacity must be at least 1".into()));
        }

        if self.buffer.retention_secs == 0 {
            return Err(crate::Error::Config("buffer.retention_secs must be at least 1".into()));
        }

        if self.buffer.cleanup_interval_secs == 0 {
            return Err(crate::Error::Config(
                "buffer.cleanup_interval_secs must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// The member this process announces to the cluster
    pub fn local_member(&self) -> crate::Result<ClusterMember> {
        let address = self.advertise_address();
        ClusterMember::from_address(self.node.id.clone(), address)
            .map(|m| m.with_properties(self.node.properties.clone()))
            .ok_or_else(|| {
                crate::Error::Config(format!(
                    "advertise address '{}' is not a valid host:port",
                    address
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "node-1"
bind_address = "0.0.0.0:4000"
advertise_address = "10.0.0.5:4000"

[node.properties]
role = "worker"

[cluster]
domain = "prod"
membership_scheme = "tag"

[cluster.parameters]
"tag.key" = "cluster"
"tag.value" = "prod"
"directory.url" = "http://inventory.internal/instances"

[replay]
grace_period_ms = 3000
max_attempts = 4

[buffer]
capacity = 500
retention_secs = 120
"#;

        let config = WolfClusterConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "node-1");
        assert_eq!(config.cluster.membership_scheme, "tag");
        assert_eq!(config.cluster.parameters.get("tag.value").unwrap(), "prod");
        assert_eq!(config.replay.grace_period(), Some(Duration::from_secs(3)));
        assert_eq!(config.replay.max_attempts, 4);
        assert_eq!(config.replay.max_backoff_ms, 5000);
        assert_eq!(config.buffer.capacity, 500);
        assert!(config.api.enabled);

        let local = config.local_member().unwrap();
        assert_eq!(local.address(), "10.0.0.5:4000");
        assert_eq!(local.property("role"), Some("worker"));
    }

    #[test]
    fn test_defaults() {
        let config = WolfClusterConfig::from_str(
            r#"
[node]
id = "node-1"
bind_address = "127.0.0.1:4000"
"#,
        )
        .unwrap();

        assert_eq!(config.cluster.membership_scheme, "wka");
        assert_eq!(config.replay.grace_period(), None);
        assert_eq!(config.buffer.retention(), Duration::from_secs(300));
        assert_eq!(config.buffer.cleanup_interval(), Duration::from_secs(120));
        assert_eq!(config.advertise_address(), "127.0.0.1:4000");
    }

    #[test]
    fn test_validation_failures() {
        let mut config = WolfClusterConfig::new("node-1", "127.0.0.1:4000");
        assert!(config.validate().is_ok());

        config.replay.max_attempts = 0;
        assert!(config.validate().is_err());
        config.replay.max_attempts = 3;

        config.buffer.capacity = 0;
        assert!(config.validate().is_err());
        config.buffer.capacity = 10;

        config.node.advertise_address = Some("not-an-address".into());
        assert!(config.validate().is_err());
        config.node.advertise_address = None;

        config.node.id.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wolfcluster.toml");
        std::fs::write(
            &path,
            "[node]\nid = \"node-7\"\nbind_address = \"127.0.0.1:4007\"\n",
        )
        .unwrap();

        let config = WolfClusterConfig::from_file(&path).unwrap();
        assert_eq!(config.node.id, "node-7");

        let missing = WolfClusterConfig::from_file(&dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(crate::Error::Io(_))));
    }
}
