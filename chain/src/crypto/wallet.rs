//! Ed25519 wallet used for all node-level signing.
//!
//! Keys and signatures cross the wire as hex strings: a 64-char verifying
//! key and 128-char detached signatures over UTF-8 message strings.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::types::Vk;

/// Errors raised when importing key material.
#[derive(Debug)]
pub enum WalletError {
    /// Seed was not 64 hex chars / 32 bytes.
    BadSeed(String),
}

impl fmt::Display for WalletError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalletError::BadSeed(msg) => write!(f, "bad wallet seed: {msg}"),
        }
    }
}

impl std::error::Error for WalletError {}

/// A node identity: an Ed25519 signing key plus its derived verifying key.
pub struct Wallet {
    signing: SigningKey,
}

impl Wallet {
    /// Generates a fresh random wallet.
    pub fn new() -> Self {
        Wallet {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Imports a wallet from a 32-byte hex seed (the `--wallet` flag).
    pub fn from_seed_hex(seed: &str) -> Result<Self, WalletError> {
        let bytes = hex::decode(seed).map_err(|e| WalletError::BadSeed(e.to_string()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| WalletError::BadSeed("expected 32 bytes".to_string()))?;
        Ok(Wallet {
            signing: SigningKey::from_bytes(&seed),
        })
    }

    /// Hex-encoded verifying key of this wallet.
    pub fn verifying_key(&self) -> Vk {
        hex::encode(self.signing.verifying_key().as_bytes())
    }

    /// Signs a message string, returning a 128-char hex signature.
    pub fn sign(&self, message: &str) -> String {
        hex::encode(self.signing.sign(message.as_bytes()).to_bytes())
    }
}

impl Default for Wallet {
    fn default() -> Self {
        Wallet::new()
    }
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet")
            .field("verifying_key", &self.verifying_key())
            .finish()
    }
}

/// Verifies a hex signature over a message string against a hex verifying
/// key. Malformed keys or signatures simply fail verification.
pub fn verify(vk: &str, message: &str, signature: &str) -> bool {
    let Ok(vk_bytes) = hex::decode(vk) else {
        return false;
    };
    let Ok(vk_arr) = <[u8; 32]>::try_from(vk_bytes) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&vk_arr) else {
        return false;
    };

    let Ok(sig_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(sig_arr) = <[u8; 64]>::try_from(sig_bytes) else {
        return false;
    };
    let sig = Signature::from_bytes(&sig_arr);

    key.verify(message.as_bytes(), &sig).is_ok()
}
