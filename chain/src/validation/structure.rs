//! Structural (shape) checks for blocks and their contents.
//!
//! The type system already guarantees most of the shape; what remains are
//! the hex-string lengths, the number/HLC relationship, and the presence
//! rules that differ between genesis and normal blocks.

use std::fmt;

use crate::types::{Block, Transaction, is_hash_hex, is_signature_hex, zero_hash};

/// A block or transaction failed a shape check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StructureError {
    BlockHashMalformed,
    PreviousHashMalformed,
    NumberMismatch,
    HlcInvalid,
    OriginSenderMalformed,
    OriginSignatureMalformed,
    ProofsMissing,
    ProofMalformed(&'static str),
    ProcessedMissing,
    ProcessedHashMalformed,
    GenesisShape,
    TransactionSignatureMalformed,
    TransactionProcessorMalformed,
    TransactionSenderMalformed,
}

impl fmt::Display for StructureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            StructureError::BlockHashMalformed => "block hash is malformed",
            StructureError::PreviousHashMalformed => "block previous hash is malformed",
            StructureError::NumberMismatch => {
                "block number does not equal the HLC nanosecond value"
            }
            StructureError::HlcInvalid => "block HLC timestamp is invalid",
            StructureError::OriginSenderMalformed => "block origin sender is malformed",
            StructureError::OriginSignatureMalformed => "block origin signature is malformed",
            StructureError::ProofsMissing => "block carries no proofs",
            StructureError::ProofMalformed(field) => {
                return write!(f, "block proof field '{field}' is malformed");
            }
            StructureError::ProcessedMissing => "block carries no processed transaction",
            StructureError::ProcessedHashMalformed => "processed transaction hash is malformed",
            StructureError::GenesisShape => "genesis block shape is invalid",
            StructureError::TransactionSignatureMalformed => {
                "transaction signature is malformed"
            }
            StructureError::TransactionProcessorMalformed => {
                "transaction processor is malformed"
            }
            StructureError::TransactionSenderMalformed => "transaction sender is malformed",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for StructureError {}

/// Shape checks for a transaction.
pub fn validate_transaction_structure(transaction: &Transaction) -> Result<(), StructureError> {
    if !is_signature_hex(&transaction.metadata.signature) {
        return Err(StructureError::TransactionSignatureMalformed);
    }
    if !is_hash_hex(&transaction.payload.processor) {
        return Err(StructureError::TransactionProcessorMalformed);
    }
    if !is_hash_hex(&transaction.payload.sender) {
        return Err(StructureError::TransactionSenderMalformed);
    }
    Ok(())
}

/// Shape checks for a whole block, genesis or normal.
pub fn validate_block_structure(block: &Block) -> Result<(), StructureError> {
    if !is_hash_hex(&block.hash) {
        return Err(StructureError::BlockHashMalformed);
    }
    if !is_hash_hex(&block.previous) {
        return Err(StructureError::PreviousHashMalformed);
    }
    if !is_hash_hex(&block.origin.sender) {
        return Err(StructureError::OriginSenderMalformed);
    }
    if !is_signature_hex(&block.origin.signature) {
        return Err(StructureError::OriginSignatureMalformed);
    }

    if block.is_genesis() {
        if block.number != 0 || block.previous != zero_hash() || block.processed.is_some() {
            return Err(StructureError::GenesisShape);
        }
        return Ok(());
    }

    if !block.hlc_timestamp.is_valid() {
        return Err(StructureError::HlcInvalid);
    }
    if block.number != block.hlc_timestamp.nanos() {
        return Err(StructureError::NumberMismatch);
    }

    if block.proofs.is_empty() {
        return Err(StructureError::ProofsMissing);
    }
    for proof in &block.proofs {
        if !is_hash_hex(&proof.signer) {
            return Err(StructureError::ProofMalformed("signer"));
        }
        if !is_signature_hex(&proof.signature) {
            return Err(StructureError::ProofMalformed("signature"));
        }
        if !is_hash_hex(&proof.members_list_hash) {
            return Err(StructureError::ProofMalformed("members_list_hash"));
        }
    }

    let Some(processed) = &block.processed else {
        return Err(StructureError::ProcessedMissing);
    };
    if !is_hash_hex(&processed.hash) {
        return Err(StructureError::ProcessedHashMalformed);
    }

    validate_transaction_structure(&processed.transaction)
}
