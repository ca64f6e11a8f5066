//! Node configuration
//!
//! Grounded on the `ax-config` crate in the example pack (a serde + TOML
//! configuration layer) since the teacher kernel has no analogous runtime
//! config layer of its own (it is configured at compile time via Cargo
//! features). Defaults reproduce every constant `spec.md` names explicitly.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Ring capacity in slots. Must be a power of two (spec §4.2: "the
/// implementation uses 65 536 slots; capacity MUST be a power of two").
pub const DEFAULT_RING_CAPACITY: u32 = 65_536;

/// Wait-station id space (spec §4.3: "a bounded pool (16-bit space, order
/// 64 K)").
pub const DEFAULT_STATION_POOL: u32 = 1 << 16;

/// Soft threshold at which the station pool forces the synchronous
/// transaction path (spec §4.1/§4.3: "80% of wait-station pool").
pub const DEFAULT_SOFT_THRESHOLD_PERCENT: u8 = 80;

/// Default replication interval in seconds (spec §4.5).
pub const DEFAULT_REPLICATION_INTERVAL_SECS: u64 = 60;

/// Default hotness percentile (spec §4.5: "top P%, default P=20").
pub const DEFAULT_HOT_PAGE_PERCENT: u8 = 20;

/// Page size in bytes used for ring-area alignment (spec §6: "ceil(sizeof
/// (window) / 4096) * 4096").
pub const PAGE_SIZE: u64 = 4096;

/// Configuration for one node in the coherence cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's id, `0..node_count`.
    pub node_id: u32,
    /// Total number of nodes participating in the cluster.
    pub node_count: u32,
    /// Path to the shared-window backing file (stands in for the
    /// DAX/devdax mapping, which is out of scope per spec §1).
    pub window_path: PathBuf,
    /// Absolute offset of the ring area within the shared window (spec §6:
    /// "Base of ring area: configured at module init").
    pub ring_area_base: u64,
    /// Number of message slots per ring; must be a power of two.
    pub ring_capacity: u32,
    /// Size of the wait-station id pool.
    pub wait_station_pool: u32,
    /// Percentage of the wait-station pool at which `acquire` forces the
    /// synchronous path.
    pub soft_threshold_percent: u8,
    /// Hotness-sampler replication interval.
    pub replication_interval_secs: u64,
    /// Hotness percentile used to set the replication threshold.
    pub hot_page_percent: u8,
    /// Path to the control-surface Unix-domain socket.
    pub control_socket: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            node_count: 2,
            window_path: PathBuf::from("/tmp/swc-window"),
            ring_area_base: PAGE_SIZE,
            ring_capacity: DEFAULT_RING_CAPACITY,
            wait_station_pool: DEFAULT_STATION_POOL,
            soft_threshold_percent: DEFAULT_SOFT_THRESHOLD_PERCENT,
            replication_interval_secs: DEFAULT_REPLICATION_INTERVAL_SECS,
            hot_page_percent: DEFAULT_HOT_PAGE_PERCENT,
            control_socket: PathBuf::from("/tmp/swc-node.sock"),
        }
    }
}

/// Errors loading or validating a [`NodeConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("ring_capacity must be a power of two, got {0}")]
    RingCapacityNotPowerOfTwo(u32),
    #[error("node_id {node_id} must be < node_count {node_count}")]
    NodeIdOutOfRange { node_id: u32, node_count: u32 },
}

impl NodeConfig {
    /// Load configuration from a TOML file, falling back to [`Default`] for
    /// any field the file omits.
    pub fn load(path: &std::path::Path) -> std::result::Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: NodeConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate cross-field invariants the default value cannot violate but
    /// a hand-edited file might.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if !self.ring_capacity.is_power_of_two() {
            return Err(ConfigError::RingCapacityNotPowerOfTwo(self.ring_capacity));
        }
        if self.node_id >= self.node_count {
            return Err(ConfigError::NodeIdOutOfRange {
                node_id: self.node_id,
                node_count: self.node_count,
            });
        }
        Ok(())
    }

    /// Soft threshold as an absolute count of stations.
    pub fn soft_threshold_count(&self) -> u32 {
        (self.wait_station_pool as u64 * self.soft_threshold_percent as u64 / 100) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_ring_capacity() {
        let mut cfg = NodeConfig::default();
        cfg.ring_capacity = 100;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::RingCapacityNotPowerOfTwo(100))
        ));
    }

    #[test]
    fn rejects_node_id_out_of_range() {
        let mut cfg = NodeConfig::default();
        cfg.node_id = 5;
        cfg.node_count = 2;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::NodeIdOutOfRange { .. })
        ));
    }

    #[test]
    fn soft_threshold_count_matches_percentage() {
        let mut cfg = NodeConfig::default();
        cfg.wait_station_pool = 1000;
        cfg.soft_threshold_percent = 80;
        assert_eq!(cfg.soft_threshold_count(), 800);
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = NodeConfig::default();
        let text = toml::to_string(&cfg).unwrap();
        let parsed: NodeConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.node_count, cfg.node_count);
        assert_eq!(parsed.ring_capacity, cfg.ring_capacity);
    }
}
