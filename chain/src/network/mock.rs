//! In-memory network implementations for tests and small simulations.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::types::{Block, ProcessingResult, TxMessage, Vk};

use super::{BlockMeta, NetworkError, PeerClient, Publisher};

/// A peer that serves blocks from an in-memory map.
pub struct MockPeer {
    vk: Vk,
    ip: String,
    blocks: BTreeMap<u64, Block>,
    /// When set, every request fails with a transport error.
    pub unreachable: bool,
}

impl MockPeer {
    pub fn new(vk: impl Into<Vk>, blocks: Vec<Block>) -> Self {
        Self {
            vk: vk.into(),
            ip: "127.0.0.1".to_string(),
            blocks: blocks.into_iter().map(|b| (b.number, b)).collect(),
            unreachable: false,
        }
    }

    fn check_reachable(&self) -> Result<(), NetworkError> {
        if self.unreachable {
            Err(NetworkError::Transport("unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerClient for MockPeer {
    fn vk(&self) -> Vk {
        self.vk.clone()
    }

    fn ip(&self) -> String {
        self.ip.clone()
    }

    async fn ping(&self) -> Result<(), NetworkError> {
        self.check_reachable()
    }

    async fn latest_block_meta(&self) -> Result<Option<BlockMeta>, NetworkError> {
        self.check_reachable()?;
        Ok(self.blocks.values().next_back().map(|block| BlockMeta {
            number: block.number,
            hlc_timestamp: block.hlc_timestamp.clone(),
        }))
    }

    async fn get_block_by_number(&self, number: u64) -> Result<Option<Block>, NetworkError> {
        self.check_reachable()?;
        Ok(self.blocks.get(&number).cloned())
    }

    async fn next_block(&self, after: u64) -> Result<Option<Block>, NetworkError> {
        self.check_reachable()?;
        Ok(self
            .blocks
            .range(after + 1..)
            .next()
            .map(|(_, block)| block.clone()))
    }
}

/// A publisher that records everything it is asked to send.
#[derive(Default)]
pub struct MemoryPublisher {
    pub txs: Mutex<Vec<TxMessage>>,
    pub results: Mutex<Vec<ProcessingResult>>,
    pub blocks: Mutex<Vec<Block>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published_result_count(&self) -> usize {
        self.results.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish_tx(&self, tx_message: &TxMessage) {
        if let Ok(mut txs) = self.txs.lock() {
            txs.push(tx_message.clone());
        }
    }

    async fn publish_result(&self, processing_results: &ProcessingResult) {
        if let Ok(mut results) = self.results.lock() {
            results.push(processing_results.clone());
        }
    }

    async fn announce_new_block(&self, block: &Block) {
        if let Ok(mut blocks) = self.blocks.lock() {
            blocks.push(block.clone());
        }
    }
}
