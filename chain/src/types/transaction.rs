//! Transactions and the messages that carry them between nodes.

use serde::{Deserialize, Serialize};

use crate::hlc::Hlc;

use super::Vk;

/// The signed body of a transaction.
///
/// `nonce` is strictly increasing per `(processor, sender)` pair; the work
/// validator rejects anything at or below the last seen nonce. `kwargs` is
/// an open JSON object interpreted by the contract engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxPayload {
    /// Contract the transaction targets.
    pub contract: String,
    /// Function within the contract.
    pub function: String,
    /// Call arguments, passed through to the contract engine verbatim.
    pub kwargs: serde_json::Value,
    /// Anti-replay counter relative to `(processor, sender)`.
    pub nonce: u64,
    /// Node expected to process this transaction.
    pub processor: Vk,
    /// Account that signed the transaction.
    pub sender: Vk,
    /// Execution budget supplied by the sender.
    pub stamps_supplied: u64,
}

/// Metadata attached to a transaction by its sender.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxMetadata {
    /// Sender's signature over the canonical encoding of the payload.
    pub signature: String,
}

/// A complete transaction: payload plus sender metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub metadata: TxMetadata,
    pub payload: TxPayload,
}

/// What a node broadcasts when it admits a transaction.
///
/// The admitting node stamps the transaction with a fresh HLC timestamp and
/// signs `tx_hash ∥ hlc_timestamp` so peers can attribute the ordering
/// decision to it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxMessage {
    pub tx: Transaction,
    pub hlc_timestamp: Hlc,
    /// Admitting node's signature over `tx_hash ∥ hlc_timestamp`.
    pub signature: String,
    /// Verifying key of the admitting node.
    pub sender: Vk,
}
