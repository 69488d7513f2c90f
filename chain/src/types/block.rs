//! Blocks, execution results, and consensus proofs.
//!
//! One [`Block`] record covers both genesis (which carries a `genesis`
//! state list and no processed transaction) and normal blocks (which carry
//! exactly one processed transaction). Optional fields are omitted from the
//! canonical encoding when absent so the two shapes hash independently.

use serde::{Deserialize, Serialize};

use crate::hlc::Hlc;

use super::{HashHex, Transaction, TxMessage, Vk};

/// A single `key -> value` state write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub key: String,
    pub value: serde_json::Value,
}

impl StateEntry {
    pub fn new(key: impl Into<String>, value: serde_json::Value) -> Self {
        StateEntry {
            key: key.into(),
            value,
        }
    }
}

/// The outcome of executing one transaction.
///
/// `hash` is the canonical hash of `transaction`; `state` lists the writes
/// the execution produced (post-values only). A non-zero `status` marks a
/// failed execution whose `result` holds the error string.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxResult {
    pub hash: HashHex,
    pub result: String,
    pub stamps_used: u64,
    pub state: Vec<StateEntry>,
    pub status: u64,
    pub transaction: Transaction,
}

/// A node's signed attestation that executing a transaction at an HLC
/// yielded a specific result hash.
///
/// `members_list_hash` binds the proof to the member set the signer
/// believed in at proof time; proofs are only comparable between nodes
/// sharing the same member set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Proof {
    pub signature: String,
    pub signer: Vk,
    pub members_list_hash: HashHex,
    pub num_of_members: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_result_hash: Option<HashHex>,
}

/// Everything the processing queue produces for one executed transaction.
///
/// This is what gets broadcast on the contender topic (with `proof` set)
/// and collected by the validation queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub hlc_timestamp: Hlc,
    pub tx_result: TxResult,
    pub rewards: Vec<StateEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<Proof>,
    pub tx_message: TxMessage,
}

/// Attribution of a block to the node that admitted its transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockOrigin {
    pub sender: Vk,
    /// Signature over `tx_hash ∥ hlc_timestamp` (for genesis: over the hash
    /// of the canonical genesis state list).
    pub signature: String,
}

/// A committed block.
///
/// `number` equals the nanosecond value of `hlc_timestamp` for non-genesis
/// blocks; genesis has `number == 0` and an all-zero `previous`. `hash` is
/// derived from `(hlc_timestamp, number, previous)` only, which is what
/// makes in-place reorgs (recomputing `previous` and `hash` of later
/// blocks) possible without touching their payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub number: u64,
    pub hash: HashHex,
    pub hlc_timestamp: Hlc,
    pub previous: HashHex,
    pub proofs: Vec<Proof>,
    pub rewards: Vec<StateEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<TxResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genesis: Option<Vec<StateEntry>>,
    pub origin: BlockOrigin,
}

impl Block {
    /// Returns `true` for the genesis block (number 0 with a genesis state
    /// list instead of a processed transaction).
    pub fn is_genesis(&self) -> bool {
        self.number == 0 && self.genesis.is_some()
    }

    /// The state writes this block commits, regardless of its shape.
    pub fn state_changes(&self) -> &[StateEntry] {
        if let Some(genesis) = &self.genesis {
            genesis
        } else if let Some(processed) = &self.processed {
            &processed.state
        } else {
            &[]
        }
    }
}
