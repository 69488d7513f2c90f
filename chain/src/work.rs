//! Admission checks for transaction messages arriving from peers.
//!
//! Work is only accepted from current members, with both signatures
//! verifying and a nonce strictly greater than anything already seen for
//! the `(processor, sender)` pair. Accepted work advances the local HLC
//! clock and the pending nonce table; rejected work is dropped with a log
//! line and never retried.

use std::fmt;
use std::io;

use tracing::warn;

use crate::codec::{self, CodecError};
use crate::crypto;
use crate::hlc::HlcClock;
use crate::state::StateDriver;
use crate::storage::NonceStorage;
use crate::types::TxMessage;

/// Why a transaction message was refused admission.
#[derive(Debug)]
pub enum WorkError {
    MalformedHlc,
    UnknownSender,
    BadSenderSignature,
    BadPayloadSignature,
    StaleNonce { supplied: u64, latest: u64 },
    Codec(CodecError),
    Io(io::Error),
}

impl fmt::Display for WorkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkError::MalformedHlc => write!(f, "malformed hlc timestamp"),
            WorkError::UnknownSender => write!(f, "sender is not a current member"),
            WorkError::BadSenderSignature => write!(f, "sender signature does not verify"),
            WorkError::BadPayloadSignature => write!(f, "payload signature does not verify"),
            WorkError::StaleNonce { supplied, latest } => {
                write!(f, "nonce {supplied} is not greater than latest {latest}")
            }
            WorkError::Codec(e) => write!(f, "{e}"),
            WorkError::Io(e) => write!(f, "nonce storage error: {e}"),
        }
    }
}

impl std::error::Error for WorkError {}

impl From<CodecError> for WorkError {
    fn from(e: CodecError) -> Self {
        WorkError::Codec(e)
    }
}

impl From<io::Error> for WorkError {
    fn from(e: io::Error) -> Self {
        WorkError::Io(e)
    }
}

/// Validates incoming work and records its side effects (clock merge,
/// pending nonce) on success.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkValidator;

impl WorkValidator {
    /// Runs all admission checks for `tx_message`.
    ///
    /// On success the local clock has absorbed the message's HLC and the
    /// pending nonce table records its nonce.
    pub fn validate_and_admit(
        &self,
        tx_message: &TxMessage,
        driver: &StateDriver,
        nonces: &NonceStorage,
        clock: &mut HlcClock,
    ) -> Result<(), WorkError> {
        if !tx_message.hlc_timestamp.is_valid() {
            return Err(WorkError::MalformedHlc);
        }

        let members = driver.member_vk_list();
        if !members.is_empty() && !members.contains(&tx_message.sender) {
            return Err(WorkError::UnknownSender);
        }

        let tx_hash = codec::tx_hash_from_tx(&tx_message.tx)?;
        let sender_message = format!("{tx_hash}{}", tx_message.hlc_timestamp);
        if !crypto::verify(&tx_message.sender, &sender_message, &tx_message.signature) {
            return Err(WorkError::BadSenderSignature);
        }

        let payload = &tx_message.tx.payload;
        let payload_message = codec::canonical_json(payload)?;
        if !crypto::verify(
            &payload.sender,
            &payload_message,
            &tx_message.tx.metadata.signature,
        ) {
            return Err(WorkError::BadPayloadSignature);
        }

        if let Some(latest) = nonces.get_latest_nonce(&payload.processor, &payload.sender) {
            if payload.nonce <= latest {
                return Err(WorkError::StaleNonce {
                    supplied: payload.nonce,
                    latest,
                });
            }
        }

        clock.merge(&tx_message.hlc_timestamp);
        nonces.set_pending_nonce(&payload.processor, &payload.sender, payload.nonce)?;
        Ok(())
    }

    /// Convenience wrapper that logs and swallows rejections.
    pub fn admit_or_drop(
        &self,
        tx_message: &TxMessage,
        driver: &StateDriver,
        nonces: &NonceStorage,
        clock: &mut HlcClock,
    ) -> bool {
        match self.validate_and_admit(tx_message, driver, nonces, clock) {
            Ok(()) => true,
            Err(err) => {
                warn!(hlc = %tx_message.hlc_timestamp, %err, "dropping invalid work");
                false
            }
        }
    }
}
