//! Detecting and repairing gaps in the stored chain.
//!
//! Components that notice a previous-hash mismatch write a marker file
//! named after the missing block number under `missing_blocks/`. The
//! handler sweeps those markers, sources each block from connected peers,
//! verifies it, imports its state, and then rewrites every later block's
//! `previous`/`hash` so the chain is contiguous again (emitting one
//! `block_reorg` event per rewritten block).

use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

use tokio::time::timeout;
use tracing::{info, warn};

use crate::consensus::minter::recalc_block_info;
use crate::catchup::{CatchupError, import_block_state};
use crate::events::{BLOCK_REORG_EVENT, Event, EventWriter};
use crate::network::{DEFAULT_RPC_TIMEOUT, PeerSet};
use crate::state::StateDriver;
use crate::storage::{BlockStorage, BlockStorageError, NonceStorage};
use crate::types::Block;
use crate::validation::{BlockVerifyError, verify_block};

/// Errors raised while repairing missing blocks.
#[derive(Debug)]
pub enum MissingBlocksError {
    /// Block 0 can never be fetched from peers; asking for it is a
    /// programming error upstream.
    GenesisRequested,
    InvalidBlock { number: u64, source: BlockVerifyError },
    Storage(BlockStorageError),
    Catchup(CatchupError),
    Io(io::Error),
}

impl fmt::Display for MissingBlocksError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissingBlocksError::GenesisRequested => {
                write!(f, "genesis block must never be fetched from peers")
            }
            MissingBlocksError::InvalidBlock { number, source } => {
                write!(f, "fetched block {number} failed verification: {source}")
            }
            MissingBlocksError::Storage(e) => write!(f, "{e}"),
            MissingBlocksError::Catchup(e) => write!(f, "{e}"),
            MissingBlocksError::Io(e) => write!(f, "missing block marker io error: {e}"),
        }
    }
}

impl std::error::Error for MissingBlocksError {}

impl From<BlockStorageError> for MissingBlocksError {
    fn from(e: BlockStorageError) -> Self {
        MissingBlocksError::Storage(e)
    }
}

impl From<CatchupError> for MissingBlocksError {
    fn from(e: CatchupError) -> Self {
        MissingBlocksError::Catchup(e)
    }
}

impl From<io::Error> for MissingBlocksError {
    fn from(e: io::Error) -> Self {
        MissingBlocksError::Io(e)
    }
}

/// Drops marker files for block numbers other components found missing.
pub struct MissingBlocksWriter {
    missing_blocks_dir: PathBuf,
}

impl MissingBlocksWriter {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, io::Error> {
        let missing_blocks_dir = root.into().join("missing_blocks");
        fs::create_dir_all(&missing_blocks_dir)?;
        Ok(Self { missing_blocks_dir })
    }

    /// Writes a marker for `number`. Re-writing an existing marker is a
    /// no-op.
    pub fn write_missing_block(&self, number: u64) -> Result<(), io::Error> {
        fs::write(self.missing_blocks_dir.join(number.to_string()), "")
    }
}

/// Sweeps missing-block markers and repairs the chain.
pub struct MissingBlocksHandler {
    missing_blocks_dir: PathBuf,
    /// Blocks at or below this height skip signature verification.
    pub safe_block_num: Option<u64>,
}

impl MissingBlocksHandler {
    pub fn open(
        root: impl Into<PathBuf>,
        safe_block_num: Option<u64>,
    ) -> Result<Self, io::Error> {
        let missing_blocks_dir = root.into().join("missing_blocks");
        fs::create_dir_all(&missing_blocks_dir)?;
        Ok(Self {
            missing_blocks_dir,
            safe_block_num,
        })
    }

    /// Reads and removes all marker files, returning the numbers sorted
    /// ascending. Unparseable markers are discarded.
    pub fn gather_missing_block_numbers(&self) -> Result<Vec<u64>, io::Error> {
        let mut numbers = Vec::new();
        for entry in fs::read_dir(&self.missing_blocks_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            fs::remove_file(entry.path())?;

            match name.to_str().and_then(|s| s.parse::<u64>().ok()) {
                Some(number) => numbers.push(number),
                None => warn!(marker = ?name, "discarding unparseable missing-block marker"),
            }
        }
        numbers.sort_unstable();
        numbers.dedup();
        Ok(numbers)
    }

    /// First peer that can serve `number`.
    async fn fetch_block(&self, peers: &PeerSet, number: u64) -> Option<Block> {
        for peer in peers.iter() {
            match timeout(DEFAULT_RPC_TIMEOUT, peer.get_block_by_number(number)).await {
                Ok(Ok(Some(block))) => return Some(block),
                Ok(Ok(None)) => {}
                Ok(Err(err)) => warn!(peer = %peer.vk(), number, %err, "block fetch failed"),
                Err(_) => warn!(peer = %peer.vk(), number, "block fetch timed out"),
            }
        }
        None
    }

    /// Verifies and imports one fetched block.
    fn process_block(
        &self,
        block: &Block,
        blocks: &BlockStorage,
        driver: &mut StateDriver,
        nonces: &NonceStorage,
    ) -> Result<(), MissingBlocksError> {
        let number = block.number;
        if number == 0 {
            return Err(MissingBlocksError::GenesisRequested);
        }

        let below_safe_height = self
            .safe_block_num
            .map(|safe| number <= safe)
            .unwrap_or(false);
        if !below_safe_height {
            verify_block(block, None)
                .map_err(|source| MissingBlocksError::InvalidBlock { number, source })?;
        }

        import_block_state(block, driver, nonces)?;
        blocks.store_block(block)?;
        Ok(())
    }

    /// Rewrites `previous`/`hash` of every block after `starting` so the
    /// chain is contiguous, emitting a `block_reorg` event per rewrite.
    pub fn recalc_block_hashes(
        &self,
        starting: u64,
        blocks: &BlockStorage,
        events: &mut EventWriter,
    ) -> Result<usize, MissingBlocksError> {
        let Some(start_block) = blocks.get_block(starting) else {
            return Ok(0);
        };

        let mut prev_hash = start_block.hash;
        let mut rewritten = 0;

        let later: Vec<u64> = blocks
            .block_numbers()
            .into_iter()
            .filter(|n| *n > starting)
            .collect();

        for number in later {
            let Some(block) = blocks.get_block(number) else {
                continue;
            };

            if block.previous == prev_hash {
                prev_hash = block.hash;
                continue;
            }

            let updated = recalc_block_info(block, &prev_hash);
            blocks.store_block(&updated)?;
            let _ = events.write_event(&Event::new(
                BLOCK_REORG_EVENT,
                serde_json::to_value(&updated)
                    .unwrap_or(serde_json::Value::Null),
            ));

            prev_hash = updated.hash;
            rewritten += 1;
        }

        Ok(rewritten)
    }

    /// One full sweep: gather markers, fetch, verify, import, relink.
    /// Returns how many missing blocks were repaired.
    pub async fn run(
        &self,
        peers: &PeerSet,
        blocks: &BlockStorage,
        driver: &mut StateDriver,
        nonces: &NonceStorage,
        events: &mut EventWriter,
    ) -> Result<usize, MissingBlocksError> {
        let numbers = self.gather_missing_block_numbers()?;
        if numbers.is_empty() {
            return Ok(0);
        }

        info!(count = numbers.len(), "repairing missing blocks");
        let mut repaired = 0;

        for number in numbers {
            if number == 0 {
                return Err(MissingBlocksError::GenesisRequested);
            }
            if blocks.get_block(number).is_some() {
                continue;
            }

            let Some(block) = self.fetch_block(peers, number).await else {
                warn!(number, "no peer could serve missing block");
                continue;
            };

            self.process_block(&block, blocks, driver, nonces)?;
            self.recalc_block_hashes(number, blocks, events)?;
            repaired += 1;
        }

        Ok(repaired)
    }
}
