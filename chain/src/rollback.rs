//! Rolling the chain back to an earlier HLC.
//!
//! Driven by `--rollback-to <hlc>` at startup. Blocks after the rollback
//! point are deleted, then durable state and the nonce tables are rebuilt
//! by replaying the surviving chain from genesis; the pending layer holds
//! no durable pre-images, so replay is the only faithful way back.

use std::fmt;
use std::io;

use tracing::info;

use crate::catchup::{CatchupError, import_block_state};
use crate::hlc::Hlc;
use crate::state::{StateDriver, StateError};
use crate::storage::{BlockStorage, BlockStorageError, NonceStorage};

/// Errors raised while rolling back.
#[derive(Debug)]
pub enum RollbackError {
    Storage(BlockStorageError),
    State(StateError),
    Replay(CatchupError),
    Io(io::Error),
}

impl fmt::Display for RollbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackError::Storage(e) => write!(f, "{e}"),
            RollbackError::State(e) => write!(f, "{e}"),
            RollbackError::Replay(e) => write!(f, "state replay failed: {e}"),
            RollbackError::Io(e) => write!(f, "nonce storage error: {e}"),
        }
    }
}

impl std::error::Error for RollbackError {}

impl From<BlockStorageError> for RollbackError {
    fn from(e: BlockStorageError) -> Self {
        RollbackError::Storage(e)
    }
}

impl From<StateError> for RollbackError {
    fn from(e: StateError) -> Self {
        RollbackError::State(e)
    }
}

impl From<CatchupError> for RollbackError {
    fn from(e: CatchupError) -> Self {
        RollbackError::Replay(e)
    }
}

impl From<io::Error> for RollbackError {
    fn from(e: io::Error) -> Self {
        RollbackError::Io(e)
    }
}

/// Deletes blocks after a rollback point and rebuilds state from the
/// remaining chain.
#[derive(Clone, Copy, Debug, Default)]
pub struct RollbackBlocksHandler;

impl RollbackBlocksHandler {
    /// Rolls back to `rollback_point` (blocks with a later HLC are
    /// removed). Returns how many blocks were deleted.
    pub fn run(
        &self,
        rollback_point: &Hlc,
        blocks: &BlockStorage,
        driver: &mut StateDriver,
        nonces: &NonceStorage,
    ) -> Result<usize, RollbackError> {
        let target_number = rollback_point.nanos();
        info!(%rollback_point, target_number, "rolling back chain");

        let removed = blocks.remove_blocks_after(target_number)?;

        driver.flush_durable()?;
        nonces.flush()?;

        for number in blocks.block_numbers() {
            if let Some(block) = blocks.get_block(number) {
                import_block_state(&block, driver, nonces)?;
            }
        }

        info!(
            removed = removed.len(),
            remaining = blocks.total_blocks(),
            "rollback complete"
        );
        Ok(removed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::consensus::minter;
    use crate::crypto::Wallet;
    use crate::state::MemKvStore;
    use crate::types::{
        Block, ProcessingResult, Proof, StateEntry, Transaction, TxMessage, TxMetadata,
        TxPayload, TxResult, Vk,
    };
    use serde_json::json;
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

        let hlc = crate::hlc::Hlc::new(format!("1970-01-01T00:00:{second:02}.000000000Z_0"));
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

    #[test]
    fn rollback_deletes_later_blocks_and_rebuilds_state() {
        let tmp = TempDir::new().unwrap();
        let wallet = Wallet::new();
        let blocks = BlockStorage::open(tmp.path()).unwrap();
        let nonces = NonceStorage::open(tmp.path()).unwrap();
        let mut driver = StateDriver::new(Box::new(MemKvStore::new()));

        let genesis = minter::genesis_block_from_state(
            vec![StateEntry::new("genesis.key", json!("seed"))],
            &wallet,
        )
        .unwrap();
        let b1 = signed_block_at(1, 1, &genesis.hash, &wallet);
        let b2 = signed_block_at(2, 2, &b1.hash, &wallet);
        let b3 = signed_block_at(3, 3, &b2.hash, &wallet);

        for block in [&genesis, &b1, &b2, &b3] {
            blocks.store_block(block).unwrap();
            import_block_state(block, &mut driver, &nonces).unwrap();
        }
        assert_eq!(driver.lookup("x"), Some(json!(3)));

        let removed = RollbackBlocksHandler
            .run(&b1.hlc_timestamp, &blocks, &mut driver, &nonces)
            .unwrap();

        assert_eq!(removed, 2);
        assert_eq!(blocks.total_blocks(), 2);
        assert_eq!(blocks.get_latest_block().unwrap().number, b1.number);

        // State reflects only genesis + b1.
        assert_eq!(driver.lookup("x"), Some(json!(1)));
        assert_eq!(driver.lookup("genesis.key"), Some(json!("seed")));
        assert_eq!(
            nonces.get_nonce(&wallet.verifying_key(), &wallet.verifying_key()),
            Some(1)
        );
    }

    #[test]
    fn rollback_is_a_no_op_at_the_tip() {
        let tmp = TempDir::new().unwrap();
        let wallet = Wallet::new();
        let blocks = BlockStorage::open(tmp.path()).unwrap();
        let nonces = NonceStorage::open(tmp.path()).unwrap();
        let mut driver = StateDriver::new(Box::new(MemKvStore::new()));

        let genesis = minter::genesis_block_from_state(vec![], &wallet).unwrap();
        let b1 = signed_block_at(1, 1, &genesis.hash, &wallet);
        blocks.store_block(&genesis).unwrap();
        blocks.store_block(&b1).unwrap();

        let removed = RollbackBlocksHandler
            .run(&b1.hlc_timestamp, &blocks, &mut driver, &nonces)
            .unwrap();
        assert_eq!(removed, 0);
        assert_eq!(blocks.total_blocks(), 2);
    }
}
