//! Canonical encoding and the hash derivations built on it.
//!
//! Canonical form is JSON with lexicographically sorted map keys, plain
//! decimal integers, `{"__fixed__": "..."}`-tagged fixed-point numbers, and
//! no insignificant whitespace. Every structure is converted to a
//! `serde_json::Value` before rendering; `serde_json`'s default map is
//! ordered, so key sorting falls out of the value model rather than being
//! a property of any particular struct's field order.
//!
//! All consensus-relevant hashes are SHA3-256 over canonical bytes and are
//! carried as 64-char lowercase hex strings:
//!
//! - `tx_hash = H(canonical(tx))`
//! - `block_hash = H(hlc_timestamp ∥ number ∥ previous)`
//! - `tx_result_hash = H(canonical(tx_result) ∥ hlc_timestamp ∥ canonical(rewards))`
//! - `members_list_hash = H(canonical(sorted(member_vks)))`

use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;
use sha3::{Digest, Sha3_256};

use crate::hlc::Hlc;
use crate::types::{HashHex, StateEntry, Transaction, TxResult, Vk};

/// Errors produced while encoding or decoding canonical JSON.
#[derive(Debug)]
pub enum CodecError {
    /// A value could not be represented as JSON.
    Encode(String),
    /// Bytes did not decode into the expected structure.
    Decode(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Encode(msg) => write!(f, "canonical encode failed: {msg}"),
            CodecError::Decode(msg) => write!(f, "canonical decode failed: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        CodecError::Decode(e.to_string())
    }
}

/// Renders any serializable value in canonical form.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, CodecError> {
    let v = serde_json::to_value(value).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(v.to_string())
}

/// Decodes canonical JSON into a concrete structure.
pub fn decode<T: DeserializeOwned>(encoded: &str) -> Result<T, CodecError> {
    Ok(serde_json::from_str(encoded)?)
}

/// SHA3-256 of raw bytes, hex encoded.
pub fn sha3_hex(data: &[u8]) -> HashHex {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Canonical hash of a transaction.
pub fn tx_hash_from_tx(tx: &Transaction) -> Result<HashHex, CodecError> {
    Ok(sha3_hex(canonical_json(tx)?.as_bytes()))
}

/// Block hash over the three linking fields.
///
/// Deliberately excludes the payload: a reorg only recomputes `previous`
/// and `hash` of later blocks, never their contents.
pub fn block_hash(hlc_timestamp: &Hlc, number: u64, previous: &str) -> HashHex {
    sha3_hex(format!("{hlc_timestamp}{number}{previous}").as_bytes())
}

/// Result hash a node publishes and peers vote on.
pub fn tx_result_hash(
    tx_result: &TxResult,
    hlc_timestamp: &Hlc,
    rewards: &[StateEntry],
) -> Result<HashHex, CodecError> {
    let mut message = canonical_json(tx_result)?;
    message.push_str(hlc_timestamp.as_str());
    message.push_str(&canonical_json(&rewards)?);
    Ok(sha3_hex(message.as_bytes()))
}

/// Hash of the sorted member verifying-key list.
pub fn hash_members_list(members: &[Vk]) -> Result<HashHex, CodecError> {
    let mut sorted: Vec<&Vk> = members.iter().collect();
    sorted.sort();
    Ok(sha3_hex(canonical_json(&sorted)?.as_bytes()))
}

/// The message a proof signature covers, plus the member-set binding.
#[derive(Clone, Debug, PartialEq)]
pub struct ProofMessage {
    pub message: String,
    pub members_list_hash: HashHex,
    pub num_of_members: u64,
}

/// Builds the signable proof message for a result.
///
/// The message is `tx_result_hash ∥ members_list_hash`, so a proof cannot
/// be replayed against a different member set; verification additionally
/// requires the embedded `members_list_hash` to equal the verifier's own.
pub fn proof_message(
    tx_result: &TxResult,
    hlc_timestamp: &Hlc,
    rewards: &[StateEntry],
    members: &[Vk],
) -> Result<ProofMessage, CodecError> {
    let result_hash = tx_result_hash(tx_result, hlc_timestamp, rewards)?;
    let members_list_hash = hash_members_list(members)?;
    Ok(ProofMessage {
        message: format!("{result_hash}{members_list_hash}"),
        members_list_hash,
        num_of_members: members.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Block, BlockOrigin, Fixed, TxMetadata, TxPayload, zero_hash};

    fn sample_tx() -> Transaction {
        Transaction {
            metadata: TxMetadata {
                signature: "aa".repeat(64),
            },
            payload: TxPayload {
                contract: "currency".to_string(),
                function: "transfer".to_string(),
                kwargs: serde_json::json!({"b": 1, "a": 2}),
                nonce: 0,
                processor: "bb".repeat(32),
                sender: "cc".repeat(32),
                stamps_supplied: 10,
            },
        }
    }

    #[test]
    fn canonical_json_sorts_map_keys() {
        let value = serde_json::json!({"zebra": 1, "apple": {"y": 2, "x": 3}});
        let encoded = canonical_json(&value).unwrap();
        assert_eq!(encoded, r#"{"apple":{"x":3,"y":2},"zebra":1}"#);
    }

    #[test]
    fn canonical_json_keeps_fixed_tag() {
        let encoded = canonical_json(&Fixed::new("10.5")).unwrap();
        assert_eq!(encoded, r#"{"__fixed__":"10.5"}"#);
    }

    #[test]
    fn tx_hash_is_stable_and_field_order_independent() {
        let tx = sample_tx();
        let h1 = tx_hash_from_tx(&tx).unwrap();
        let h2 = tx_hash_from_tx(&tx).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);

        // Same logical tx reconstructed from JSON with different key order.
        let json = serde_json::to_string(&tx).unwrap();
        let reparsed: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(tx_hash_from_tx(&reparsed).unwrap(), h1);
    }

    #[test]
    fn block_hash_depends_on_all_three_fields() {
        let hlc = Hlc::new("2024-01-15T12:00:00.000000000Z_0");
        let base = block_hash(&hlc, 7, &zero_hash());
        assert_ne!(base, block_hash(&hlc, 8, &zero_hash()));
        assert_ne!(base, block_hash(&hlc, 7, &"1".repeat(64)));
        assert_ne!(
            base,
            block_hash(&Hlc::new("2024-01-15T12:00:00.000000001Z_0"), 7, &zero_hash())
        );
    }

    #[test]
    fn members_list_hash_ignores_input_order() {
        let a = vec!["bb".repeat(32), "aa".repeat(32)];
        let b = vec!["aa".repeat(32), "bb".repeat(32)];
        assert_eq!(hash_members_list(&a).unwrap(), hash_members_list(&b).unwrap());
    }

    #[test]
    fn block_roundtrips_through_canonical_form() {
        let hlc = Hlc::new("2024-01-15T12:00:00.000000000Z_0");
        let block = Block {
            number: hlc.nanos(),
            hash: block_hash(&hlc, hlc.nanos(), &zero_hash()),
            hlc_timestamp: hlc.clone(),
            previous: zero_hash(),
            proofs: vec![],
            rewards: vec![StateEntry::new("r", serde_json::json!({"__fixed__": "0.1"}))],
            processed: Some(TxResult {
                hash: tx_hash_from_tx(&sample_tx()).unwrap(),
                result: "None".to_string(),
                stamps_used: 2,
                state: vec![StateEntry::new("k", serde_json::json!("v"))],
                status: 0,
                transaction: sample_tx(),
            }),
            genesis: None,
            origin: BlockOrigin {
                sender: "ff".repeat(32),
                signature: "ab".repeat(64),
            },
        };

        let encoded = canonical_json(&block).unwrap();
        let back: Block = decode(&encoded).unwrap();
        assert_eq!(back, block);
        assert_eq!(canonical_json(&back).unwrap(), encoded);
    }
}
