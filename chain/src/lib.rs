//! Chain library crate.
//!
//! This crate provides the core building blocks for a BFT-style node that
//! orders transactions with hybrid logical clocks and mints blocks from
//! multi-node proof aggregation:
//!
//! - strongly-typed domain records (`types`),
//! - the HLC clock (`hlc`),
//! - canonical encoding and hash derivations (`codec`),
//! - the layered state driver with per-HLC deltas (`state`),
//! - content-addressed block and nonce storage (`storage`),
//! - the processing and validation queues (`queues`),
//! - consensus determination and block minting (`consensus`),
//! - reprocessing after out-of-order arrivals (`reprocess`),
//! - gap repair and peer catch-up (`missing`, `catchup`),
//! - block validity checks (`validation`),
//! - Prometheus-based metrics (`metrics`),
//! - and the node orchestrator itself (`node`).
//!
//! Higher-level binaries compose these pieces to build validator nodes,
//! simulators, and experiment harnesses.

pub mod catchup;
pub mod codec;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod events;
pub mod execution;
pub mod filequeue;
pub mod hlc;
pub mod metrics;
pub mod missing;
pub mod network;
pub mod node;
pub mod queues;
pub mod reprocess;
pub mod rollback;
pub mod state;
pub mod storage;
pub mod types;
pub mod validation;
pub mod work;

// Re-export top-level configuration types.
pub use config::{ConsensusConfig, MetricsConfig, NodeConfig, StorageConfig};

// Re-export the clock and timestamp type.
pub use hlc::{Hlc, HlcClock};

// Re-export the node orchestrator.
pub use node::{Node, NodeError};

// Re-export "core" queue and consensus types.
pub use consensus::{ConsensusResult, check_consensus, needed_votes};
pub use queues::{AppendOutcome, ProcessingDelay, ProcessingQueue, ValidationQueue};

// Re-export state and storage backends.
pub use state::{KvStore, MemKvStore, RocksDbConfig, RocksDbKvStore, StateDriver};
pub use storage::{BlockStorage, NonceStorage};

// Re-export the execution seam.
pub use execution::{ExecError, ExecOutcome, Executor, SetterExecutor};

// Re-export network seams.
pub use network::{NullPublisher, PeerClient, PeerSet, Publisher};

// Re-export signing and verification.
pub use crypto::{Wallet, verify};

// Re-export metrics registry and exporter.
pub use metrics::{MetricsRegistry, run_prometheus_http_server};

// Re-export domain types at the crate root for convenience.
pub use types::*;

/// Type alias for the default durable state backend.
pub type DefaultKvStore = RocksDbKvStore;

/// Type alias for the default contract executor used by devnets and
/// simulations; production nodes plug in a real contract engine.
pub type DefaultExecutor = SetterExecutor;
