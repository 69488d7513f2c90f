//! Building blocks from consensus results and rewriting them on reorg.
//!
//! A block's hash covers only its linking fields `(hlc_timestamp, number,
//! previous)`, so inserting an earlier block rewrites later blocks by
//! recomputing exactly those two fields; payloads, proofs, and origins are
//! untouched.

use crate::codec::{self, CodecError};
use crate::crypto::Wallet;
use crate::hlc::Hlc;
use crate::types::{Block, BlockOrigin, ProcessingResult, Proof, StateEntry, zero_hash};

/// Mints a block from a consensus-winning processing result.
///
/// `number` is the nanosecond value of the HLC timestamp; `origin` is this
/// node's attestation over `tx_hash ∥ hlc_timestamp`.
pub fn block_from_processing_results(
    processing_results: &ProcessingResult,
    proofs: Vec<Proof>,
    prev_block_hash: &str,
    wallet: &Wallet,
) -> Block {
    let hlc = processing_results.hlc_timestamp.clone();
    let number = hlc.nanos();
    let tx_result = processing_results.tx_result.clone();

    let origin_message = format!("{}{}", tx_result.hash, hlc);

    Block {
        number,
        hash: codec::block_hash(&hlc, number, prev_block_hash),
        hlc_timestamp: hlc,
        previous: prev_block_hash.to_string(),
        proofs,
        rewards: processing_results.rewards.clone(),
        processed: Some(tx_result),
        genesis: None,
        origin: BlockOrigin {
            sender: wallet.verifying_key(),
            signature: wallet.sign(&origin_message),
        },
    }
}

/// Rewrites a block's linking fields after the chain below it changed.
pub fn recalc_block_info(mut block: Block, new_prev_hash: &str) -> Block {
    block.previous = new_prev_hash.to_string();
    block.hash = codec::block_hash(&block.hlc_timestamp, block.number, &block.previous);
    block
}

/// Builds a genesis block (number 0, all-zero previous, fixed HLC) from an
/// initial state list, signed by the founding wallet over the hash of the
/// canonical state changes.
pub fn genesis_block_from_state(
    genesis_state: Vec<StateEntry>,
    wallet: &Wallet,
) -> Result<Block, CodecError> {
    let hlc = Hlc::genesis();
    let state_hash = codec::sha3_hex(codec::canonical_json(&genesis_state)?.as_bytes());

    Ok(Block {
        number: 0,
        hash: codec::block_hash(&hlc, 0, &zero_hash()),
        hlc_timestamp: hlc,
        previous: zero_hash(),
        proofs: vec![],
        rewards: vec![],
        processed: None,
        genesis: Some(genesis_state),
        origin: BlockOrigin {
            sender: wallet.verifying_key(),
            signature: wallet.sign(&state_hash),
        },
    })
}
