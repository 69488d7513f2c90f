//! The contract execution oracle and result construction.
//!
//! Contract semantics are external to this crate: the node only needs an
//! [`Executor`] that evaluates a transaction against the current state
//! view, staging its writes in the driver's pending layer. Execution is
//! synchronous and non-suspending.
//!
//! [`run_tx`] wraps an executor call into the [`ProcessingResult`] shape
//! consensus operates on. Oracle failures are captured as `status != 0`
//! results with empty state; they are never retried.

use std::fmt;

use serde_json::Value;
use tracing::warn;

use crate::codec;
use crate::state::StateDriver;
use crate::types::{ProcessingResult, StateEntry, TxMessage, TxResult};

/// Status value of a successful execution.
pub const STATUS_OK: u64 = 0;

/// Status value of a failed execution.
pub const STATUS_FAILED: u64 = 1;

/// What an executor reports for a successful evaluation. Writes are not
/// part of the outcome; they land in the state driver's pending layer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecOutcome {
    /// Human-readable return value of the contract call.
    pub result: String,
    /// Execution budget consumed.
    pub stamps_used: u64,
    /// Reward writes distributed for this transaction.
    pub rewards: Vec<StateEntry>,
}

/// Raised by an executor when evaluation fails.
#[derive(Debug)]
pub struct ExecError {
    pub message: String,
}

impl ExecError {
    pub fn new(message: impl Into<String>) -> Self {
        ExecError {
            message: message.into(),
        }
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "execution failed: {}", self.message)
    }
}

impl std::error::Error for ExecError {}

/// The contract execution oracle.
pub trait Executor: Send {
    /// Evaluates `tx` against the current state view. Reads and writes go
    /// through `state`; staged writes are collected by the caller.
    fn execute(&self, tx: &TxMessage, state: &mut StateDriver) -> Result<ExecOutcome, ExecError>;
}

/// Executes a transaction and folds the outcome into a
/// [`ProcessingResult`].
///
/// On failure the staged writes are discarded so the recorded delta is
/// empty, and the error string becomes the `result` of a `status != 0`
/// transaction. The caller is responsible for `soft_apply`.
pub fn run_tx(
    tx_message: &TxMessage,
    driver: &mut StateDriver,
    executor: &dyn Executor,
) -> ProcessingResult {
    let tx_hash = codec::tx_hash_from_tx(&tx_message.tx).unwrap_or_else(|err| {
        warn!(%err, "unhashable transaction");
        String::new()
    });

    let (status, result, stamps_used, rewards) =
        match executor.execute(tx_message, driver) {
            Ok(outcome) => (
                STATUS_OK,
                outcome.result,
                outcome.stamps_used,
                outcome.rewards,
            ),
            Err(err) => {
                driver.discard_pending_writes();
                (STATUS_FAILED, err.to_string(), 0, Vec::new())
            }
        };

    let state: Vec<StateEntry> = driver
        .pending_writes()
        .iter()
        .map(|(key, post)| StateEntry {
            key: key.clone(),
            value: post.clone().unwrap_or(Value::Null),
        })
        .collect();

    ProcessingResult {
        hlc_timestamp: tx_message.hlc_timestamp.clone(),
        tx_result: TxResult {
            hash: tx_hash,
            result,
            stamps_used,
            state,
            status,
            transaction: tx_message.tx.clone(),
        },
        rewards,
        proof: None,
        tx_message: tx_message.clone(),
    }
}

/// Deterministic key/value executor for tests and devnets.
///
/// Understands two functions on any contract:
///
/// - `set {key, value}` — writes `value` under `key`,
/// - `add_from {read_key, write_key, amount}` — reads `read_key` as an
///   integer (0 when absent) and writes the sum under `write_key`.
///
/// Anything else fails, which exercises the `status != 0` path.
#[derive(Clone, Copy, Debug, Default)]
pub struct SetterExecutor;

impl SetterExecutor {
    fn kwarg<'a>(tx: &'a TxMessage, name: &str) -> Result<&'a Value, ExecError> {
        tx.tx
            .payload
            .kwargs
            .get(name)
            .ok_or_else(|| ExecError::new(format!("missing kwarg '{name}'")))
    }

    fn kwarg_str<'a>(tx: &'a TxMessage, name: &str) -> Result<&'a str, ExecError> {
        Self::kwarg(tx, name)?
            .as_str()
            .ok_or_else(|| ExecError::new(format!("kwarg '{name}' must be a string")))
    }
}

impl Executor for SetterExecutor {
    fn execute(&self, tx: &TxMessage, state: &mut StateDriver) -> Result<ExecOutcome, ExecError> {
        match tx.tx.payload.function.as_str() {
            "set" => {
                let key = Self::kwarg_str(tx, "key")?.to_string();
                let value = Self::kwarg(tx, "value")?.clone();
                state.set(&key, value);
                Ok(ExecOutcome {
                    result: "None".to_string(),
                    stamps_used: 1,
                    rewards: Vec::new(),
                })
            }
            "add_from" => {
                let read_key = Self::kwarg_str(tx, "read_key")?.to_string();
                let write_key = Self::kwarg_str(tx, "write_key")?.to_string();
                let amount = Self::kwarg(tx, "amount")?
                    .as_i64()
                    .ok_or_else(|| ExecError::new("kwarg 'amount' must be an integer"))?;

                let base = state
                    .get(&read_key)
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                state.set(&write_key, Value::from(base + amount));
                Ok(ExecOutcome {
                    result: "None".to_string(),
                    stamps_used: 2,
                    rewards: Vec::new(),
                })
            }
            other => Err(ExecError::new(format!("unknown function '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlc::Hlc;
    use crate::state::MemKvStore;
    use crate::types::{Transaction, TxMetadata, TxPayload};
    use serde_json::json;

    fn driver() -> StateDriver {
        StateDriver::new(Box::new(MemKvStore::new()))
    }

    fn tx_message(function: &str, kwargs: Value) -> TxMessage {
        TxMessage {
            tx: Transaction {
                metadata: TxMetadata {
                    signature: "aa".repeat(64),
                },
                payload: TxPayload {
                    contract: "kv".to_string(),
                    function: function.to_string(),
                    kwargs,
                    nonce: 0,
                    processor: "bb".repeat(32),
                    sender: "cc".repeat(32),
                    stamps_supplied: 10,
                },
            },
            hlc_timestamp: Hlc::new("2024-01-15T12:00:00.000000000Z_0"),
            signature: "dd".repeat(64),
            sender: "ee".repeat(32),
        }
    }

    #[test]
    fn set_stages_a_write_and_reports_state() {
        let mut d = driver();
        let tx = tx_message("set", json!({"key": "x", "value": 5}));

        let result = run_tx(&tx, &mut d, &SetterExecutor);

        assert_eq!(result.tx_result.status, STATUS_OK);
        assert_eq!(result.tx_result.state.len(), 1);
        assert_eq!(result.tx_result.state[0].key, "x");
        assert_eq!(result.tx_result.state[0].value, json!(5));
        assert_eq!(d.pending_writes().len(), 1);
    }

    #[test]
    fn add_from_reads_through_the_driver() {
        let mut d = driver();
        d.set("x", json!(10));
        d.soft_apply(&Hlc::new("2024-01-15T11:00:00.000000000Z_0"));

        let tx = tx_message(
            "add_from",
            json!({"read_key": "x", "write_key": "y", "amount": 1}),
        );
        let result = run_tx(&tx, &mut d, &SetterExecutor);

        assert_eq!(result.tx_result.state[0].value, json!(11));
        // The read was tracked for dependency detection.
        d.soft_apply(&tx.hlc_timestamp);
        assert!(d.pending_deltas()[&tx.hlc_timestamp].reads.contains("x"));
    }

    #[test]
    fn failures_produce_status_one_with_empty_state() {
        let mut d = driver();
        let tx = tx_message("no_such_function", json!({}));

        let result = run_tx(&tx, &mut d, &SetterExecutor);

        assert_eq!(result.tx_result.status, STATUS_FAILED);
        assert!(result.tx_result.state.is_empty());
        assert!(result.tx_result.result.contains("no_such_function"));
        assert!(d.pending_writes().is_empty());
    }
}
