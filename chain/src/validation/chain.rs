//! Start-time validation of the stored chain.
//!
//! Walks every stored block in height order and checks the linkage
//! invariants end to end: `previous` pointers, `number == nanos(hlc)`, and
//! (above the safe block height) full hash and signature verification.

use std::fmt;

use tracing::{debug, info};

use crate::storage::BlockStorage;

use super::signatures::{BlockVerifyError, verify_block};

/// Why chain validation failed.
#[derive(Debug)]
pub enum ChainValidationError {
    /// No genesis block is stored but later blocks exist.
    MissingGenesis,
    /// A stored block number could not be loaded.
    UnreadableBlock(u64),
    /// A block's `previous` does not point at its predecessor's hash.
    BrokenLink { number: u64, expected: String, found: String },
    /// A block failed full verification.
    InvalidBlock { number: u64, source: BlockVerifyError },
}

impl fmt::Display for ChainValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainValidationError::MissingGenesis => {
                write!(f, "chain has blocks but no genesis")
            }
            ChainValidationError::UnreadableBlock(number) => {
                write!(f, "block {number} is stored but unreadable")
            }
            ChainValidationError::BrokenLink {
                number,
                expected,
                found,
            } => write!(
                f,
                "block {number} links to {found} but its predecessor's hash is {expected}"
            ),
            ChainValidationError::InvalidBlock { number, source } => {
                write!(f, "block {number} failed verification: {source}")
            }
        }
    }
}

impl std::error::Error for ChainValidationError {}

/// Validates the whole stored chain before the node starts serving.
#[derive(Clone, Copy, Debug, Default)]
pub struct ValidateChainHandler {
    /// Blocks at or below this height skip signature verification (their
    /// proofs may predate the current proof format).
    pub safe_block_num: Option<u64>,
}

impl ValidateChainHandler {
    pub fn new(safe_block_num: Option<u64>) -> Self {
        Self { safe_block_num }
    }

    pub fn run(&self, blocks: &BlockStorage) -> Result<(), ChainValidationError> {
        let numbers = blocks.block_numbers();
        if numbers.is_empty() {
            info!("no blocks stored, skipping chain validation");
            return Ok(());
        }
        if numbers[0] != 0 {
            return Err(ChainValidationError::MissingGenesis);
        }

        info!(total = numbers.len(), "validating stored chain");

        let mut previous_hash: Option<String> = None;
        for number in numbers {
            let block = blocks
                .get_block(number)
                .ok_or(ChainValidationError::UnreadableBlock(number))?;

            if let Some(expected) = previous_hash {
                if block.previous != expected {
                    return Err(ChainValidationError::BrokenLink {
                        number,
                        expected,
                        found: block.previous.clone(),
                    });
                }
            }

            let below_safe_height = self
                .safe_block_num
                .map(|safe| number <= safe)
                .unwrap_or(false);
            if !below_safe_height {
                verify_block(&block, None).map_err(|source| {
                    ChainValidationError::InvalidBlock { number, source }
                })?;
            } else {
                debug!(number, "below safe height, linkage check only");
            }

            previous_hash = Some(block.hash);
        }

        info!("chain validation passed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::consensus::minter;
    use crate::crypto::Wallet;
    use crate::hlc::Hlc;
    use crate::types::{
        ProcessingResult, Proof, StateEntry, Transaction, TxMessage, TxMetadata, TxPayload,
        TxResult,
    };
    use serde_json::json;
    use tempfile::TempDir;

    fn signed_chain(len: u32) -> (TempDir, BlockStorage, Wallet) {
        let tmp = TempDir::new().unwrap();
        let store = BlockStorage::open(tmp.path()).unwrap();

        let founder = Wallet::new();
        let genesis = minter::genesis_block_from_state(
            vec![StateEntry::new("masternodes.members", json!([founder.verifying_key()]))],
            &founder,
        )
        .unwrap();
        store.store_block(&genesis).unwrap();

        let mut previous = genesis.hash.clone();
        for i in 1..=len {
            let block = signed_block_at(i, &previous, &founder);
            store.store_block(&block).unwrap();
            previous = block.hash;
        }

        (tmp, store, founder)
    }

    fn signed_block_at(second: u32, previous: &str, wallet: &Wallet) -> crate::types::Block {
        let payload = TxPayload {
            contract: "kv".to_string(),
            function: "set".to_string(),
            kwargs: json!({"key": "x", "value": second}),
            nonce: second as u64,
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

        let members = vec![wallet.verifying_key()];
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
    fn valid_chain_passes() {
        let (_tmp, store, _wallet) = signed_chain(3);
        ValidateChainHandler::default().run(&store).unwrap();
    }

    #[test]
    fn broken_link_is_reported() {
        let (_tmp, store, wallet) = signed_chain(2);

        // Overwrite block 3's slot with a block linked to garbage.
        let orphan = signed_block_at(3, &"12".repeat(32), &wallet);
        store.store_block(&orphan).unwrap();

        match ValidateChainHandler::default().run(&store) {
            Err(ChainValidationError::BrokenLink { number, .. }) => {
                assert_eq!(number, orphan.number);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn safe_height_skips_signature_checks() {
        let (_tmp, store, wallet) = signed_chain(1);

        // A block whose payload was tampered after signing.
        let mut bad = signed_block_at(2, &store.get_latest_block().unwrap().hash, &wallet);
        if let Some(processed) = &mut bad.processed {
            processed.state[0].value = json!(999);
            // Keep the tx hash consistent so only signatures break.
        }
        store.store_block(&bad).unwrap();

        assert!(ValidateChainHandler::default().run(&store).is_err());

        // With the safe height above it, only linkage is checked.
        ValidateChainHandler::new(Some(bad.number)).run(&store).unwrap();
    }
}
