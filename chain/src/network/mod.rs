//! Network seams: peers, publishing, and the conceptual RPC types.
//!
//! Wire-level sockets and their authentication handshake are external to
//! this crate. The node reaches peers only through [`PeerClient`] and the
//! outside world only through [`Publisher`]; [`mock`] supplies in-memory
//! implementations for tests and simulations.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::hlc::Hlc;
use crate::types::{Block, ProcessingResult, TxMessage, Vk};

pub mod mock;
pub mod rpc;

pub use mock::{MemoryPublisher, MockPeer};

/// Default timeout for a single peer RPC.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Network-level error type.
#[derive(Debug)]
pub enum NetworkError {
    /// Peer did not answer within the timeout.
    Timeout,
    /// Peer answered with something unusable.
    BadResponse(String),
    /// Transport-level failure.
    Transport(String),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::Timeout => write!(f, "peer request timed out"),
            NetworkError::BadResponse(msg) => write!(f, "bad peer response: {msg}"),
            NetworkError::Transport(msg) => write!(f, "peer transport error: {msg}"),
        }
    }
}

impl std::error::Error for NetworkError {}

/// Height and timestamp of a peer's chain tip.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockMeta {
    pub number: u64,
    pub hlc_timestamp: Hlc,
}

/// A connected peer, addressed by verifying key.
#[async_trait]
pub trait PeerClient: Send + Sync {
    fn vk(&self) -> Vk;
    fn ip(&self) -> String;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), NetworkError>;

    /// Number and timestamp of the peer's latest block.
    async fn latest_block_meta(&self) -> Result<Option<BlockMeta>, NetworkError>;

    /// Fetches a block by exact number.
    async fn get_block_by_number(&self, number: u64) -> Result<Option<Block>, NetworkError>;

    /// Fetches the peer's earliest block with a number strictly greater
    /// than `after`. Drives catch-up, since block numbers are sparse.
    async fn next_block(&self, after: u64) -> Result<Option<Block>, NetworkError>;
}

/// Outbound pub/sub surface of the node.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Broadcasts an admitted transaction on the work topic.
    async fn publish_tx(&self, tx_message: &TxMessage);

    /// Broadcasts a proof-carrying processing result on the contender
    /// topic. Happens only after the result's delta was soft-applied.
    async fn publish_result(&self, processing_results: &ProcessingResult);

    /// Announces a freshly minted block.
    async fn announce_new_block(&self, block: &Block);
}

/// A publisher that drops everything; stands in when the node runs without
/// a network.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullPublisher;

#[async_trait]
impl Publisher for NullPublisher {
    async fn publish_tx(&self, _tx_message: &TxMessage) {}
    async fn publish_result(&self, _processing_results: &ProcessingResult) {}
    async fn announce_new_block(&self, _block: &Block) {}
}

/// The set of currently connected peers.
#[derive(Clone, Default)]
pub struct PeerSet {
    peers: Vec<Arc<dyn PeerClient>>,
}

impl PeerSet {
    pub fn new(peers: Vec<Arc<dyn PeerClient>>) -> Self {
        Self { peers }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn PeerClient>> {
        self.peers.iter()
    }

    pub fn get(&self, vk: &Vk) -> Option<&Arc<dyn PeerClient>> {
        self.peers.iter().find(|peer| &peer.vk() == vk)
    }

    /// Drops a peer (e.g. after it was voted out of the member set).
    pub fn remove(&mut self, vk: &Vk) {
        self.peers.retain(|peer| &peer.vk() != vk);
    }

    pub fn ips(&self) -> Vec<String> {
        self.peers.iter().map(|peer| peer.ip()).collect()
    }
}

impl fmt::Debug for PeerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSet").field("len", &self.peers.len()).finish()
    }
}
