//! Core domain types shared across the node.
//!
//! The wire and storage format of this chain is canonical JSON, so the
//! records here stay close to their encoded shape: verifying keys, hashes,
//! and signatures are lowercase hex strings, state values are JSON values,
//! and timestamps are [`Hlc`](crate::hlc::Hlc) strings.

use serde::{Deserialize, Serialize};

pub mod block;
pub mod transaction;

pub use block::{Block, BlockOrigin, ProcessingResult, Proof, StateEntry, TxResult};
pub use transaction::{Transaction, TxMessage, TxMetadata, TxPayload};

/// Hex length of a 32-byte value (verifying keys, hashes).
pub const HASH_HEX_LEN: usize = 64;

/// Hex length of a 64-byte Ed25519 signature.
pub const SIGNATURE_HEX_LEN: usize = 128;

/// A verifying key: 32 bytes, hex encoded.
pub type Vk = String;

/// A SHA3-256 digest: 32 bytes, hex encoded.
pub type HashHex = String;

/// The all-zero hash used as the `previous` pointer of the genesis block.
pub fn zero_hash() -> HashHex {
    "0".repeat(HASH_HEX_LEN)
}

/// Returns `true` if `s` is a well-formed 64-char hex digest.
pub fn is_hash_hex(s: &str) -> bool {
    s.len() == HASH_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Returns `true` if `s` is a well-formed 128-char hex signature.
pub fn is_signature_hex(s: &str) -> bool {
    s.len() == SIGNATURE_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Fixed-point decimal wrapper.
///
/// Canonical encoding tags fixed-point numbers as
/// `{"__fixed__": "<decimal-string>"}` so that hashing is independent of
/// any binary float representation. The wrapper keeps the decimal string
/// verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fixed {
    #[serde(rename = "__fixed__")]
    pub value: String,
}

impl Fixed {
    pub fn new(value: impl Into<String>) -> Self {
        Fixed {
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_hex_shape() {
        assert!(is_hash_hex(&zero_hash()));
        assert!(!is_hash_hex("abc"));
        assert!(!is_hash_hex(&"z".repeat(HASH_HEX_LEN)));
    }

    #[test]
    fn fixed_serializes_with_tag() {
        let f = Fixed::new("1.5");
        let json = serde_json::to_string(&f).unwrap();
        assert_eq!(json, r#"{"__fixed__":"1.5"}"#);

        let back: Fixed = serde_json::from_str(&json).unwrap();
        assert_eq!(back, f);
    }
}
