//! Fencekeeper Configuration
//!
//! This module provides configuration structures for the fence
//! coordinator: local node identity, the fence domain and its configured
//! cluster nodes, fencing delays and the administrator override channel.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Main fencekeeper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FenceConfig {
    /// Local node identity
    pub node: NodeConfig,

    /// Fence domain configuration
    #[serde(default)]
    pub domain: DomainConfig,

    /// Fencing behaviour
    #[serde(default)]
    pub fencing: FencingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local node identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Cluster node id of this node (non-zero)
    pub id: u32,

    /// Cluster node name of this node
    pub name: String,
}

/// A node listed in the cluster configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNodeConfig {
    /// Cluster node id
    pub id: u32,

    /// Node name handed to fencing agents
    pub name: String,
}

/// Fence domain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Domain name; the group joined is "fenced:<name>"
    #[serde(default = "default_domain_name")]
    pub name: String,

    /// Every node in the cluster configuration
    #[serde(default)]
    pub nodes: Vec<ClusterNodeConfig>,

    /// Skip startup fencing of absent nodes when joining
    #[serde(default)]
    pub clean_start: bool,
}

/// Fencing behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FencingConfig {
    /// Seconds to wait for victims to rejoin after nodes were added (-1 waits forever)
    #[serde(default = "default_post_join_delay")]
    pub post_join_delay: i32,

    /// Seconds to wait for victims to rejoin after a failure (-1 waits forever)
    #[serde(default)]
    pub post_fail_delay: i32,

    /// Path of the administrator override fifo (empty disables overrides)
    #[serde(default = "default_override_path")]
    pub override_path: Option<PathBuf>,

    /// Seconds to wait on the override fifo per failed fencing attempt
    #[serde(default = "default_override_time")]
    pub override_time: u64,

    /// Pause between fencing attempts when no override path is configured
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Poll interval while delaying fencing
    #[serde(default = "default_delay_poll_ms")]
    pub delay_poll_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_domain_name() -> String {
    "default".to_string()
}

fn default_post_join_delay() -> i32 {
    6
}

fn default_override_path() -> Option<PathBuf> {
    Some(PathBuf::from("/var/run/cluster/fenced_override"))
}

fn default_override_time() -> u64 {
    3
}

fn default_retry_interval_ms() -> u64 {
    5000
}

fn default_delay_poll_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            name: default_domain_name(),
            nodes: Vec::new(),
            clean_start: false,
        }
    }
}

impl Default for FencingConfig {
    fn default() -> Self {
        Self {
            post_join_delay: default_post_join_delay(),
            post_fail_delay: 0,
            override_path: default_override_path(),
            override_time: default_override_time(),
            retry_interval_ms: default_retry_interval_ms(),
            delay_poll_ms: default_delay_poll_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl FenceConfig {
    /// Minimal configuration for a node, everything else defaulted
    pub fn for_node(id: u32, name: &str) -> Self {
        Self {
            node: NodeConfig {
                id,
                name: name.to_string(),
            },
            domain: DomainConfig::default(),
            fencing: FencingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: FenceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id == 0 {
            return Err(crate::Error::Config("node.id cannot be zero".into()));
        }

        if self.node.name.is_empty() {
            return Err(crate::Error::Config("node.name cannot be empty".into()));
        }

        if self.domain.name.is_empty() {
            return Err(crate::Error::Config("domain.name cannot be empty".into()));
        }

        let mut seen = HashSet::new();
        for node in &self.domain.nodes {
            if node.id == 0 {
                return Err(crate::Error::Config(format!(
                    "domain.nodes entry {} has zero id",
                    node.name
                )));
            }
            if !seen.insert(node.id) {
                return Err(crate::Error::Config(format!(
                    "domain.nodes lists id {} twice",
                    node.id
                )));
            }
        }

        if self.override_path().is_some() && self.fencing.override_time == 0 {
            return Err(crate::Error::Config(
                "fencing.override_time must be positive when override_path is set".into(),
            ));
        }

        Ok(())
    }

    /// Group name of the fence domain
    pub fn domain_group(&self) -> String {
        format!("fenced:{}", self.domain.name)
    }

    /// Look up a configured node name
    pub fn node_name(&self, id: u32) -> Option<&str> {
        self.domain
            .nodes
            .iter()
            .find(|n| n.id == id)
            .map(|n| n.name.as_str())
    }

    /// Override fifo path, if overrides are enabled
    pub fn override_path(&self) -> Option<&std::path::Path> {
        self.fencing
            .override_path
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }

    /// Get the override wait as Duration
    pub fn override_time(&self) -> Duration {
        Duration::from_secs(self.fencing.override_time)
    }

    /// Get the fencing retry pause as Duration
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.fencing.retry_interval_ms)
    }

    /// Get the delay poll interval as Duration
    pub fn delay_poll(&self) -> Duration {
        Duration::from_millis(self.fencing.delay_poll_ms)
    }
}
