//! Durable chain storage: content-addressed blocks and nonce tables.

pub mod blocks;
pub mod nonces;

pub use blocks::{BlockStorage, BlockStorageError};
pub use nonces::NonceStorage;
