//! Top-level configuration for a chain node.
//!
//! This module aggregates configuration for:
//!
//! - consensus parameters (`ConsensusConfig`),
//! - on-disk storage (blocks, nonces, events, admission queue),
//! - the durable state backend (RocksDB path and creation flags),
//! - the metrics exporter (enable flag + listen address),
//! - startup behavior (catch-up, chain validation, rollback point).
//!
//! The goal is a single `NodeConfig` struct that the binary can construct
//! from defaults, CLI flags, or environment variables as needed.

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::hlc::Hlc;
use crate::queues::ProcessingDelay;
use crate::state::RocksDbConfig;

/// Consensus tuning knobs.
#[derive(Clone, Debug)]
pub struct ConsensusConfig {
    /// Percentage of the member set that must agree on a result hash.
    pub consensus_percent: u64,
    /// Lower bound between a transaction's HLC and its execution.
    pub processing_delay: ProcessingDelay,
    /// Seconds a stalled consensus round may linger before being dropped.
    pub stalled_round_timeout_secs: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            consensus_percent: 51,
            processing_delay: ProcessingDelay::default(),
            stalled_round_timeout_secs: 120,
        }
    }
}

/// Locations of the node's on-disk structures (blocks, nonces, events,
/// missing-block markers, admission queue), all under one root.
#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/chain"),
        }
    }
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    /// Whether to run a `/metrics` HTTP exporter.
    pub enabled: bool,
    /// Address to bind the metrics HTTP server to.
    pub listen_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        // Safe to unwrap: this is a fixed, valid address literal.
        let addr: SocketAddr = "127.0.0.1:9898"
            .parse()
            .expect("hard-coded metrics listen address should parse");
        Self {
            enabled: true,
            listen_addr: addr,
        }
    }
}

/// Top-level configuration for a chain node.
#[derive(Clone, Debug, Default)]
pub struct NodeConfig {
    pub consensus: ConsensusConfig,
    pub storage: StorageConfig,
    pub state: RocksDbConfig,
    pub metrics: MetricsConfig,
    /// Run peer catch-up during startup.
    pub run_catchup: bool,
    /// Validate the stored chain end-to-end during startup.
    pub run_validation: bool,
    /// Height at or below which signature verification is skipped.
    pub safe_block_num: Option<u64>,
    /// Roll the chain back to this HLC before starting.
    pub rollback_point: Option<Hlc>,
}

impl NodeConfig {
    /// Defaults with startup behaviors enabled, rooted at `root`.
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        NodeConfig {
            state: RocksDbConfig {
                path: root.join("state-db").to_string_lossy().to_string(),
                create_if_missing: true,
            },
            storage: StorageConfig { root },
            run_catchup: true,
            run_validation: true,
            ..NodeConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rooted_config_places_everything_under_root() {
        let cfg = NodeConfig::rooted("/tmp/nodetest");
        assert_eq!(cfg.storage.root, PathBuf::from("/tmp/nodetest"));
        assert!(cfg.state.path.starts_with("/tmp/nodetest"));
        assert!(cfg.run_catchup);
        assert!(cfg.run_validation);
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.consensus.consensus_percent, 51);
        assert!(cfg.metrics.enabled);
        assert!(cfg.rollback_point.is_none());
    }
}
