//! Layered state: durable KV backends and the speculative driver on top.

pub mod driver;
pub mod kv;

pub use driver::{Delta, MEMBERS_KEY, SAFE_BLOCK_HEIGHT_KEY, StateDriver, StateError};
pub use kv::{KvError, KvStore, MemKvStore, RocksDbConfig, RocksDbKvStore};
