//! Peer catch-up: walking the chain forward from our tip to the network's.
//!
//! Used at startup and whenever a previous-hash mismatch reveals that
//! peers are ahead. Fetched blocks are fully verified, their state is
//! imported with `safe_set` (local speculation wins over imported state),
//! and nonces only ever move forward.

use std::fmt;

use tokio::time::timeout;
use tracing::{info, warn};

use crate::events::{Event, EventWriter, SYNC_BLOCKS_EVENT};
use crate::network::{DEFAULT_RPC_TIMEOUT, PeerSet};
use crate::state::{StateDriver, StateError};
use crate::storage::{BlockStorage, BlockStorageError, NonceStorage};
use crate::types::Block;
use crate::validation::{BlockVerifyError, verify_block};

/// Why catch-up stopped early.
#[derive(Debug)]
pub enum CatchupError {
    /// A fetched block does not link onto our current tip.
    BrokenLink { number: u64 },
    /// A fetched block failed verification.
    InvalidBlock { number: u64, source: BlockVerifyError },
    Storage(BlockStorageError),
    State(StateError),
}

impl fmt::Display for CatchupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatchupError::BrokenLink { number } => {
                write!(f, "peer block {number} does not link onto our tip")
            }
            CatchupError::InvalidBlock { number, source } => {
                write!(f, "peer block {number} failed verification: {source}")
            }
            CatchupError::Storage(e) => write!(f, "{e}"),
            CatchupError::State(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CatchupError {}

impl From<BlockStorageError> for CatchupError {
    fn from(e: BlockStorageError) -> Self {
        CatchupError::Storage(e)
    }
}

impl From<StateError> for CatchupError {
    fn from(e: StateError) -> Self {
        CatchupError::State(e)
    }
}

/// Imports a committed block's writes into durable state and advances the
/// nonce table. Keys with newer local speculation are skipped; nonces only
/// increase.
pub fn import_block_state(
    block: &Block,
    driver: &mut StateDriver,
    nonces: &NonceStorage,
) -> Result<(), CatchupError> {
    for entry in block.state_changes() {
        driver.safe_set(&entry.key, &entry.value)?;
    }
    for entry in &block.rewards {
        driver.safe_set(&entry.key, &entry.value)?;
    }

    if let Some(processed) = &block.processed {
        let payload = &processed.transaction.payload;
        match nonces.get_nonce(&payload.processor, &payload.sender) {
            Some(current) if payload.nonce <= current => {}
            _ => nonces
                .set_nonce(&payload.processor, &payload.sender, payload.nonce)
                .map_err(|e| CatchupError::Storage(BlockStorageError::Io(e)))?,
        }
    }

    Ok(())
}

/// Brings local storage up to the network's tip.
#[derive(Clone, Copy, Debug, Default)]
pub struct CatchupHandler {
    /// Blocks at or below this height skip signature verification.
    pub safe_block_num: Option<u64>,
}

impl CatchupHandler {
    pub fn new(safe_block_num: Option<u64>) -> Self {
        Self { safe_block_num }
    }

    /// Highest tip number any reachable peer reports.
    async fn network_target(&self, peers: &PeerSet) -> Option<u64> {
        let mut target = None;
        for peer in peers.iter() {
            match timeout(DEFAULT_RPC_TIMEOUT, peer.latest_block_meta()).await {
                Ok(Ok(Some(meta))) => {
                    if target.map(|t| meta.number > t).unwrap_or(true) {
                        target = Some(meta.number);
                    }
                }
                Ok(Ok(None)) => {}
                Ok(Err(err)) => warn!(peer = %peer.vk(), %err, "latest block query failed"),
                Err(_) => warn!(peer = %peer.vk(), "latest block query timed out"),
            }
        }
        target
    }

    /// First peer that can serve the block following `after`.
    async fn fetch_next_block(&self, peers: &PeerSet, after: u64) -> Option<Block> {
        for peer in peers.iter() {
            match timeout(DEFAULT_RPC_TIMEOUT, peer.next_block(after)).await {
                Ok(Ok(Some(block))) => return Some(block),
                Ok(Ok(None)) => {}
                Ok(Err(err)) => warn!(peer = %peer.vk(), %err, "next block query failed"),
                Err(_) => warn!(peer = %peer.vk(), "next block query timed out"),
            }
        }
        None
    }

    /// Walks from our tip to the network target. Returns how many blocks
    /// were imported.
    pub async fn run(
        &self,
        peers: &PeerSet,
        blocks: &BlockStorage,
        driver: &mut StateDriver,
        nonces: &NonceStorage,
        events: &mut EventWriter,
    ) -> Result<usize, CatchupError> {
        if peers.is_empty() {
            return Ok(0);
        }

        let Some(target) = self.network_target(peers).await else {
            info!("no peer reported a chain tip, skipping catchup");
            return Ok(0);
        };

        let mut tip = blocks.get_latest_block();
        let start = tip.as_ref().map(|b| b.number).unwrap_or(0);
        if start >= target {
            return Ok(0);
        }

        info!(start, target, "catching up with network");
        let _ = events.write_event(&Event::new(
            SYNC_BLOCKS_EVENT,
            serde_json::json!({
                "start_block": start,
                "end_block": target,
                "node_ips": peers.ips(),
            }),
        ));

        let mut imported = 0;
        let mut cursor = start;

        while cursor < target {
            let Some(block) = self.fetch_next_block(peers, cursor).await else {
                warn!(cursor, target, "no peer could serve the next block");
                break;
            };
            let number = block.number;

            if let Some(tip_block) = &tip {
                if block.previous != tip_block.hash {
                    return Err(CatchupError::BrokenLink { number });
                }
            }

            let below_safe_height = self
                .safe_block_num
                .map(|safe| number <= safe)
                .unwrap_or(false);
            if !below_safe_height {
                verify_block(&block, None)
                    .map_err(|source| CatchupError::InvalidBlock { number, source })?;
            }

            import_block_state(&block, driver, nonces)?;
            blocks.store_block(&block)?;

            cursor = number;
            tip = Some(block);
            imported += 1;
        }

        info!(imported, "catchup finished");
        Ok(imported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::consensus::minter;
    use crate::crypto::Wallet;
    use crate::hlc::Hlc;
    use crate::network::MockPeer;
    use crate::state::MemKvStore;
    use crate::types::{
        ProcessingResult, Proof, StateEntry, Transaction, TxMessage, TxMetadata, TxPayload,
        TxResult, Vk,
    };
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn signed_block_at(second: u32, nonce: u64, previous: &str, wallet: &Wallet) -> Block {
        let payload = TxPayload {
            contract: "kv".to_string(),
            function: "set".to_string(),
            kwargs: json!({"key": "x", "value": second}),
            nonce,
            processor: wallet.verifying_key(),
            sender: wallet.verifying_key(),
            stamps_supplied: 10,
        };
        let payload_message = codec::canonical_json(&payload).unwrap();
        let tx = Transaction {
            metadata: TxMetadata {
                signature: wallet.sign(&payload_message),
            },
            payload,
        };

        let hlc = Hlc::new(format!("1970-01-01T00:00:{second:02}.000000000Z_0"));
        let tx_result = TxResult {
            hash: codec::tx_hash_from_tx(&tx).unwrap(),
            result: "None".to_string(),
            stamps_used: 1,
            state: vec![StateEntry::new("x", json!(second))],
            status: 0,
            transaction: tx.clone(),
        };

        let members: Vec<Vk> = vec![wallet.verifying_key()];
        let message = codec::proof_message(&tx_result, &hlc, &[], &members).unwrap();
        let proof = Proof {
            signature: wallet.sign(&message.message),
            signer: wallet.verifying_key(),
            members_list_hash: message.members_list_hash,
            num_of_members: message.num_of_members,
            tx_result_hash: None,
        };

        let processing_results = ProcessingResult {
            hlc_timestamp: hlc.clone(),
            tx_result,
            rewards: vec![],
            proof: None,
            tx_message: TxMessage {
                tx,
                hlc_timestamp: hlc,
                signature: "dd".repeat(64),
                sender: wallet.verifying_key(),
            },
        };

        minter::block_from_processing_results(&processing_results, vec![proof], previous, wallet)
    }

    fn genesis(wallet: &Wallet) -> Block {
        minter::genesis_block_from_state(
            vec![StateEntry::new("masternodes.members", json!([wallet.verifying_key()]))],
            wallet,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn catches_up_to_peer_tip() {
        let tmp = TempDir::new().unwrap();
        let wallet = Wallet::new();

        let g = genesis(&wallet);
        let mut chain = vec![g.clone()];
        let mut previous = g.hash.clone();
        for i in 1..=5u32 {
            let block = signed_block_at(i, i as u64, &previous, &wallet);
            previous = block.hash.clone();
            chain.push(block);
        }

        let blocks = BlockStorage::open(tmp.path()).unwrap();
        blocks.store_block(&g).unwrap();

        let mut driver = StateDriver::new(Box::new(MemKvStore::new()));
        let nonces = NonceStorage::open(tmp.path()).unwrap();
        let mut events = EventWriter::open(tmp.path()).unwrap();

        let peers = PeerSet::new(vec![Arc::new(MockPeer::new("peer-a", chain.clone()))]);

        let imported = CatchupHandler::default()
            .run(&peers, &blocks, &mut driver, &nonces, &mut events)
            .await
            .unwrap();

        assert_eq!(imported, 5);
        assert_eq!(blocks.total_blocks(), 6);
        assert_eq!(
            blocks.get_latest_block().unwrap().hash,
            chain.last().unwrap().hash
        );
        // State and nonces followed the imported blocks.
        assert_eq!(driver.lookup("x"), Some(json!(5)));
        assert_eq!(
            nonces.get_nonce(&wallet.verifying_key(), &wallet.verifying_key()),
            Some(5)
        );
    }

    #[tokio::test]
    async fn already_caught_up_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let wallet = Wallet::new();
        let g = genesis(&wallet);

        let blocks = BlockStorage::open(tmp.path()).unwrap();
        blocks.store_block(&g).unwrap();

        let mut driver = StateDriver::new(Box::new(MemKvStore::new()));
        let nonces = NonceStorage::open(tmp.path()).unwrap();
        let mut events = EventWriter::open(tmp.path()).unwrap();
        let peers = PeerSet::new(vec![Arc::new(MockPeer::new("peer-a", vec![g]))]);

        let imported = CatchupHandler::default()
            .run(&peers, &blocks, &mut driver, &nonces, &mut events)
            .await
            .unwrap();
        assert_eq!(imported, 0);
    }

    #[tokio::test]
    async fn mismatched_peer_chain_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let wallet = Wallet::new();
        let g = genesis(&wallet);

        // Peer's first block links to a different genesis.
        let foreign = signed_block_at(1, 1, &"12".repeat(32), &wallet);

        let blocks = BlockStorage::open(tmp.path()).unwrap();
        blocks.store_block(&g).unwrap();

        let mut driver = StateDriver::new(Box::new(MemKvStore::new()));
        let nonces = NonceStorage::open(tmp.path()).unwrap();
        let mut events = EventWriter::open(tmp.path()).unwrap();
        let peers = PeerSet::new(vec![Arc::new(MockPeer::new("peer-a", vec![foreign.clone()]))]);

        match CatchupHandler::default()
            .run(&peers, &blocks, &mut driver, &nonces, &mut events)
            .await
        {
            Err(CatchupError::BrokenLink { number }) => assert_eq!(number, foreign.number),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
