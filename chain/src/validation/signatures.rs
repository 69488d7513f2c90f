//! Full block verification: shape, hash recomputation, and signatures.

use std::fmt;

use crate::codec::{self, CodecError};
use crate::crypto;
use crate::types::{Block, Vk};

use super::structure::{StructureError, validate_block_structure};

/// Why a block failed verification.
#[derive(Debug)]
pub enum BlockVerifyError {
    Structure(StructureError),
    Codec(CodecError),
    /// `hash` does not equal `H(hlc ∥ number ∥ previous)`.
    BlockHashMismatch,
    /// `processed.hash` does not equal the canonical transaction hash.
    TxHashMismatch,
    /// Sender signature over the payload does not verify.
    TransactionSignature,
    /// Origin signature over `tx_hash ∥ hlc` does not verify.
    OriginSignature,
    /// A proof signature does not verify.
    ProofSignature(Vk),
    /// A proof was built against a different member set than ours.
    MembersListMismatch(Vk),
}

impl fmt::Display for BlockVerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockVerifyError::Structure(e) => write!(f, "{e}"),
            BlockVerifyError::Codec(e) => write!(f, "{e}"),
            BlockVerifyError::BlockHashMismatch => write!(f, "block hash mismatch"),
            BlockVerifyError::TxHashMismatch => write!(f, "processed transaction hash mismatch"),
            BlockVerifyError::TransactionSignature => {
                write!(f, "transaction signature does not verify")
            }
            BlockVerifyError::OriginSignature => write!(f, "origin signature does not verify"),
            BlockVerifyError::ProofSignature(vk) => {
                write!(f, "proof signature from {vk} does not verify")
            }
            BlockVerifyError::MembersListMismatch(vk) => {
                write!(f, "proof from {vk} was built against a different member set")
            }
        }
    }
}

impl std::error::Error for BlockVerifyError {}

impl From<StructureError> for BlockVerifyError {
    fn from(e: StructureError) -> Self {
        BlockVerifyError::Structure(e)
    }
}

impl From<CodecError> for BlockVerifyError {
    fn from(e: CodecError) -> Self {
        BlockVerifyError::Codec(e)
    }
}

/// Verifies all recomputable hashes in a block.
pub fn validate_all_hashes(block: &Block) -> Result<(), BlockVerifyError> {
    let expected = codec::block_hash(&block.hlc_timestamp, block.number, &block.previous);
    if expected != block.hash {
        return Err(BlockVerifyError::BlockHashMismatch);
    }

    if let Some(processed) = &block.processed {
        let tx_hash = codec::tx_hash_from_tx(&processed.transaction)?;
        if tx_hash != processed.hash {
            return Err(BlockVerifyError::TxHashMismatch);
        }
    }

    Ok(())
}

/// Verifies the transaction, origin, and proof signatures of a block.
///
/// When `expected_members` is given, every proof must additionally carry
/// the hash of exactly that member set; proofs minted against a different
/// set are rejected outright.
pub fn validate_all_signatures(
    block: &Block,
    expected_members: Option<&[Vk]>,
) -> Result<(), BlockVerifyError> {
    if block.is_genesis() {
        // Genesis carries only the founder's signature over the hash of
        // the canonical state list.
        let genesis_state = block.genesis.as_deref().unwrap_or(&[]);
        let state_hash = codec::sha3_hex(codec::canonical_json(&genesis_state)?.as_bytes());
        if !crypto::verify(&block.origin.sender, &state_hash, &block.origin.signature) {
            return Err(BlockVerifyError::OriginSignature);
        }
        return Ok(());
    }

    let Some(processed) = &block.processed else {
        return Err(StructureError::ProcessedMissing.into());
    };

    let payload_message = codec::canonical_json(&processed.transaction.payload)?;
    if !crypto::verify(
        &processed.transaction.payload.sender,
        &payload_message,
        &processed.transaction.metadata.signature,
    ) {
        return Err(BlockVerifyError::TransactionSignature);
    }

    let origin_message = format!("{}{}", processed.hash, block.hlc_timestamp);
    if !crypto::verify(&block.origin.sender, &origin_message, &block.origin.signature) {
        return Err(BlockVerifyError::OriginSignature);
    }

    let result_hash =
        codec::tx_result_hash(processed, &block.hlc_timestamp, &block.rewards)?;
    let local_members_hash = match expected_members {
        Some(members) => Some(codec::hash_members_list(members)?),
        None => None,
    };

    for proof in &block.proofs {
        if let Some(local) = &local_members_hash {
            if &proof.members_list_hash != local {
                return Err(BlockVerifyError::MembersListMismatch(proof.signer.clone()));
            }
        }

        let message = format!("{result_hash}{}", proof.members_list_hash);
        if !crypto::verify(&proof.signer, &message, &proof.signature) {
            return Err(BlockVerifyError::ProofSignature(proof.signer.clone()));
        }
    }

    Ok(())
}

/// Complete verification: structure, hashes, then signatures.
pub fn verify_block(block: &Block, expected_members: Option<&[Vk]>) -> Result<(), BlockVerifyError> {
    validate_block_structure(block)?;
    validate_all_hashes(block)?;
    validate_all_signatures(block, expected_members)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::minter;
    use crate::crypto::Wallet;
    use crate::hlc::Hlc;
    use crate::types::{
        ProcessingResult, Proof, StateEntry, Transaction, TxMessage, TxMetadata, TxPayload,
        TxResult, zero_hash,
    };
    use serde_json::json;

    /// Builds a fully signed block the way the node does: sender-signed
    /// payload, origin signature, and one valid proof per given wallet.
    fn signed_block(
        sender_wallet: &Wallet,
        origin_wallet: &Wallet,
        proof_wallets: &[&Wallet],
        members: &[Vk],
    ) -> Block {
        let payload = TxPayload {
            contract: "kv".to_string(),
            function: "set".to_string(),
            kwargs: json!({"key": "x", "value": 1}),
            nonce: 0,
            processor: origin_wallet.verifying_key(),
            sender: sender_wallet.verifying_key(),
            stamps_supplied: 10,
        };
        let payload_message = codec::canonical_json(&payload).unwrap();
        let tx = Transaction {
            metadata: TxMetadata {
                signature: sender_wallet.sign(&payload_message),
            },
            payload,
        };

        let hlc = Hlc::new("1970-01-01T00:00:05.000000000Z_0");
        let tx_result = TxResult {
            hash: codec::tx_hash_from_tx(&tx).unwrap(),
            result: "None".to_string(),
            stamps_used: 1,
            state: vec![StateEntry::new("x", json!(1))],
            status: 0,
            transaction: tx.clone(),
        };

        let processing_results = ProcessingResult {
            hlc_timestamp: hlc.clone(),
            tx_result: tx_result.clone(),
            rewards: vec![],
            proof: None,
            tx_message: TxMessage {
                tx,
                hlc_timestamp: hlc.clone(),
                signature: "dd".repeat(64),
                sender: origin_wallet.verifying_key(),
            },
        };

        let proofs: Vec<Proof> = proof_wallets
            .iter()
            .map(|wallet| {
                let message =
                    codec::proof_message(&tx_result, &hlc, &[], members).unwrap();
                Proof {
                    signature: wallet.sign(&message.message),
                    signer: wallet.verifying_key(),
                    members_list_hash: message.members_list_hash,
                    num_of_members: message.num_of_members,
                    tx_result_hash: None,
                }
            })
            .collect();

        minter::block_from_processing_results(
            &processing_results,
            proofs,
            &zero_hash(),
            origin_wallet,
        )
    }

    #[test]
    fn fully_signed_block_verifies() {
        let sender = Wallet::new();
        let origin = Wallet::new();
        let voter = Wallet::new();
        let members = vec![origin.verifying_key(), voter.verifying_key()];

        let block = signed_block(&sender, &origin, &[&voter], &members);
        verify_block(&block, Some(&members)).unwrap();
    }

    #[test]
    fn tampered_state_breaks_proof_signatures() {
        let sender = Wallet::new();
        let origin = Wallet::new();
        let voter = Wallet::new();
        let members = vec![origin.verifying_key(), voter.verifying_key()];

        let mut block = signed_block(&sender, &origin, &[&voter], &members);
        if let Some(processed) = &mut block.processed {
            processed.state[0].value = json!(999);
        }

        match verify_block(&block, Some(&members)) {
            Err(BlockVerifyError::ProofSignature(vk)) => {
                assert_eq!(vk, voter.verifying_key());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn wrong_member_set_is_rejected_before_signature_check() {
        let sender = Wallet::new();
        let origin = Wallet::new();
        let voter = Wallet::new();
        let members = vec![origin.verifying_key(), voter.verifying_key()];

        let block = signed_block(&sender, &origin, &[&voter], &members);

        let other_members = vec![origin.verifying_key()];
        match verify_block(&block, Some(&other_members)) {
            Err(BlockVerifyError::MembersListMismatch(vk)) => {
                assert_eq!(vk, voter.verifying_key());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn tampered_block_hash_is_caught() {
        let sender = Wallet::new();
        let origin = Wallet::new();
        let voter = Wallet::new();
        let members = vec![origin.verifying_key(), voter.verifying_key()];

        let mut block = signed_block(&sender, &origin, &[&voter], &members);
        block.hash = "00".repeat(32);

        match verify_block(&block, Some(&members)) {
            Err(BlockVerifyError::BlockHashMismatch) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn genesis_verifies_with_founder_signature() {
        let founder = Wallet::new();
        let genesis = minter::genesis_block_from_state(
            vec![StateEntry::new("masternodes.members", json!(["aa"]))],
            &founder,
        )
        .unwrap();

        verify_block(&genesis, None).unwrap();

        let mut tampered = genesis.clone();
        if let Some(state) = &mut tampered.genesis {
            state.push(StateEntry::new("sneaky", json!(1)));
        }
        assert!(verify_block(&tampered, None).is_err());
    }
}
