//! Signing keys and signature verification.

pub mod wallet;

pub use wallet::{Wallet, WalletError, verify};
