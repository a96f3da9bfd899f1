//! Cluster node configuration.

use std::path::Path;

use serde::Deserialize;

use bytecache::CacheConfig;

use crate::error::ClusterError;

/// Write fan-out policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    /// Replicate every write to every connected peer.
    #[default]
    Full,
    /// Replicate each write to at most `replication_factor` peers.
    Subset,
}

/// Configuration for a [`ClusterNode`](crate::ClusterNode).
///
/// Loadable from TOML; the cache engine settings nest under a `[cache]`
/// table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClusterConfig {
    /// Node id; a random id is assigned when left empty.
    pub id: String,

    /// Connect to `join_ip` on start.
    pub join: bool,

    /// `host:port` of a seed peer, required when `join` is set.
    pub join_ip: String,

    /// TCP port the node listens on for peers; 0 is invalid.
    pub local_port: u16,

    /// Bind all interfaces instead of loopback only.
    pub bind_all: bool,

    /// Connect attempts per peer before giving up; 0 retries forever.
    /// Attempts are spaced three seconds apart.
    pub connect_retries: u32,

    /// Seconds between liveness pings; defaulted to 5 when below 1.
    pub ping_interval: u64,

    /// Seconds to wait for a pong; defaulted to 3 when below 1.
    pub ping_timeout: u64,

    /// Consecutive ping timeouts tolerated before the connection is torn
    /// down; defaulted to 5 when 0.
    pub ping_failure_threshold: u32,

    /// Peers a write is fanned out to under [`ReplicationMode::Subset`].
    pub replication_factor: u8,

    /// Write fan-out policy.
    pub replication_mode: ReplicationMode,

    /// Whether writes wait for peer acknowledgement. Kept for config
    /// compatibility; replication is a best-effort enqueue either way, as
    /// the wire protocol defines no ack.
    pub write_ack: bool,

    /// Re-enqueue disconnected peers onto the join queue.
    pub reconnect_on_disconnect: bool,

    /// Storage engine settings.
    pub cache: CacheConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            join: false,
            join_ip: String::new(),
            local_port: 9911,
            bind_all: true,
            connect_retries: 5,
            ping_interval: 0,
            ping_timeout: 0,
            ping_failure_threshold: 0,
            replication_factor: 1,
            replication_mode: ReplicationMode::Full,
            write_ack: true,
            reconnect_on_disconnect: false,
            cache: CacheConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ClusterError> {
        let contents = std::fs::read_to_string(path)?;
        let config: ClusterConfig = toml::from_str(&contents)
            .map_err(|e| ClusterError::ConfigInvalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.join && self.join_ip.is_empty() {
            return Err(ClusterError::ConfigInvalid(
                "join requires join_ip".to_owned(),
            ));
        }
        if self.local_port == 0 {
            return Err(ClusterError::ConfigInvalid(
                "local_port must be non-zero".to_owned(),
            ));
        }
        self.cache
            .validate()
            .map_err(|e| ClusterError::ConfigInvalid(e.to_string()))?;
        Ok(())
    }
}
