//! File-backed, content-addressed block and transaction storage.
//!
//! Layout under the storage root:
//!
//! - `blocks/<number zero-padded to 64 digits>` — canonical block JSON with
//!   the processed transaction culled to its hash,
//! - `blocks/alias/<block hash>` — symlink to the numbered file,
//! - `blocks/txs/<tx hash>` — canonical processed-transaction JSON.
//!
//! Blocks are totally ordered by number (the HLC nanosecond value), so the
//! numbered files double as the chain index. Writes are idempotent: a
//! rewrite of the same number replaces the file, and alias re-creation is
//! tolerated when the link already exists.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, error};

use crate::codec::{self, CodecError};
use crate::hlc::Hlc;
use crate::types::{Block, TxResult};

/// Width of the zero-padded block number filenames.
const BLOCK_NAME_WIDTH: usize = 64;

/// Errors raised by block storage.
#[derive(Debug)]
pub enum BlockStorageError {
    Io(io::Error),
    Codec(CodecError),
    /// Block lacked the data needed to store it (e.g. no processed tx and
    /// no genesis state list).
    Malformed(&'static str),
}

impl fmt::Display for BlockStorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockStorageError::Io(e) => write!(f, "block storage io error: {e}"),
            BlockStorageError::Codec(e) => write!(f, "block storage codec error: {e}"),
            BlockStorageError::Malformed(msg) => write!(f, "malformed block: {msg}"),
        }
    }
}

impl std::error::Error for BlockStorageError {}

impl From<io::Error> for BlockStorageError {
    fn from(e: io::Error) -> Self {
        BlockStorageError::Io(e)
    }
}

impl From<CodecError> for BlockStorageError {
    fn from(e: CodecError) -> Self {
        BlockStorageError::Codec(e)
    }
}

/// File-backed block store with number and hash indexes.
pub struct BlockStorage {
    root: PathBuf,
    blocks_dir: PathBuf,
    alias_dir: PathBuf,
    txs_dir: PathBuf,
}

impl BlockStorage {
    /// Opens (or creates) block storage under `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BlockStorageError> {
        let root = root.into();
        let blocks_dir = root.join("blocks");
        let alias_dir = blocks_dir.join("alias");
        let txs_dir = blocks_dir.join("txs");

        fs::create_dir_all(&alias_dir)?;
        fs::create_dir_all(&txs_dir)?;

        debug!(root = %root.display(), "opened block storage");
        Ok(Self {
            root,
            blocks_dir,
            alias_dir,
            txs_dir,
        })
    }

    /// The storage root this store was opened with.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn block_path(&self, number: u64) -> PathBuf {
        self.blocks_dir
            .join(format!("{number:0>width$}", width = BLOCK_NAME_WIDTH))
    }

    /// Persists a block, culling its processed transaction into the tx
    /// store. Rewrites of an existing number replace the previous content.
    pub fn store_block(&self, block: &Block) -> Result<(), BlockStorageError> {
        let mut value =
            serde_json::to_value(block).map_err(|e| CodecError::Encode(e.to_string()))?;

        if let Some(processed) = &block.processed {
            let encoded_tx = codec::canonical_json(processed)?;
            fs::write(self.txs_dir.join(&processed.hash), encoded_tx)?;
            value["processed"] = Value::String(processed.hash.clone());
        } else if block.genesis.is_none() {
            return Err(BlockStorageError::Malformed(
                "block has neither processed transaction nor genesis state",
            ));
        }

        let path = self.block_path(block.number);
        fs::write(&path, value.to_string())?;

        let alias = self.alias_dir.join(&block.hash);
        match std::os::unix::fs::symlink(&path, &alias) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        debug!(number = block.number, hash = %block.hash, "stored block");
        Ok(())
    }

    fn read_block_file(&self, path: &Path) -> Option<Block> {
        let encoded = fs::read_to_string(path).ok()?;
        let mut value: Value = serde_json::from_str(&encoded).ok()?;

        // Re-hydrate a culled transaction reference.
        if let Some(tx_hash) = value.get("processed").and_then(Value::as_str) {
            let tx = self.get_tx(tx_hash)?;
            value["processed"] = serde_json::to_value(tx).ok()?;
        }

        match serde_json::from_value(value) {
            Ok(block) => Some(block),
            Err(err) => {
                error!(path = %path.display(), %err, "unreadable block file");
                None
            }
        }
    }

    /// Fetches a block by number.
    pub fn get_block(&self, number: u64) -> Option<Block> {
        let path = self.block_path(number);
        if !path.is_file() {
            return None;
        }
        self.read_block_file(&path)
    }

    /// Fetches a block by the nanosecond value of an HLC timestamp.
    pub fn get_block_by_hlc(&self, hlc: &Hlc) -> Option<Block> {
        self.get_block(hlc.nanos())
    }

    /// Fetches a block through the hash alias index.
    pub fn get_block_by_hash(&self, hash: &str) -> Option<Block> {
        let path = self.alias_dir.join(hash);
        if !path.exists() {
            return None;
        }
        self.read_block_file(&path)
    }

    /// Fetches a stored processed transaction by hash.
    pub fn get_tx(&self, tx_hash: &str) -> Option<TxResult> {
        let encoded = fs::read_to_string(self.txs_dir.join(tx_hash)).ok()?;
        codec::decode(&encoded).ok()
    }

    /// All stored block numbers, ascending.
    pub fn block_numbers(&self) -> Vec<u64> {
        let Ok(entries) = fs::read_dir(&self.blocks_dir) else {
            return Vec::new();
        };

        let mut numbers: Vec<u64> = entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                if !entry.file_type().ok()?.is_file() {
                    return None;
                }
                entry.file_name().to_str()?.parse().ok()
            })
            .collect();
        numbers.sort_unstable();
        numbers
    }

    /// The block with the highest number strictly below `number`.
    pub fn get_previous_block(&self, number: u64) -> Option<Block> {
        let prev = self
            .block_numbers()
            .into_iter()
            .filter(|n| *n < number)
            .next_back()?;
        self.get_block(prev)
    }

    /// All blocks with numbers strictly greater than `hlc`'s nanosecond
    /// value, ascending.
    pub fn get_later_blocks(&self, hlc: &Hlc) -> Vec<Block> {
        let start = hlc.nanos();
        self.block_numbers()
            .into_iter()
            .filter(|n| *n > start)
            .filter_map(|n| self.get_block(n))
            .collect()
    }

    /// The highest-numbered stored block.
    pub fn get_latest_block(&self) -> Option<Block> {
        let latest = self.block_numbers().into_iter().next_back()?;
        self.get_block(latest)
    }

    /// Number of stored blocks.
    pub fn total_blocks(&self) -> usize {
        self.block_numbers().len()
    }

    /// Whether block 0 is present.
    pub fn has_genesis(&self) -> bool {
        self.block_path(0).is_file()
    }

    /// Removes blocks with numbers strictly greater than `number`, along
    /// with their hash aliases. Used by the rollback handler.
    pub fn remove_blocks_after(&self, number: u64) -> Result<Vec<u64>, BlockStorageError> {
        let doomed: Vec<u64> = self
            .block_numbers()
            .into_iter()
            .filter(|n| *n > number)
            .collect();

        for n in &doomed {
            if let Some(block) = self.get_block(*n) {
                let _ = fs::remove_file(self.alias_dir.join(&block.hash));
            }
            fs::remove_file(self.block_path(*n))?;
        }

        Ok(doomed)
    }
}
