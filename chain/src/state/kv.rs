//! Durable key-value backends for the state driver.
//!
//! The driver's durable layer is a flat `key -> JSON value` store with two
//! implementations:
//!
//! - [`MemKvStore`]: `BTreeMap`-backed, for unit tests and small devnets,
//! - [`RocksDbKvStore`]: RocksDB with a dedicated `"state"` column family,
//!   values stored as canonical JSON bytes.
//!
//! Writes must be atomic per key; a failed write is a fatal condition for
//! the node, so the write path returns errors instead of swallowing them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use rocksdb::{BoundColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options};
use serde_json::Value;
use tracing::warn;

/// Configuration for [`RocksDbKvStore`].
#[derive(Clone, Debug)]
pub struct RocksDbConfig {
    /// Filesystem path to the RocksDB database directory.
    pub path: String,
    /// Whether to create the database and missing column families if they
    /// do not yet exist.
    pub create_if_missing: bool,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            path: "data/state-db".to_string(),
            create_if_missing: true,
        }
    }
}

/// Storage-level error type.
#[derive(Debug)]
pub enum KvError {
    /// Underlying RocksDB error.
    RocksDb(rocksdb::Error),
    /// Required column family was not found.
    MissingColumnFamily(&'static str),
    /// A stored value did not decode as JSON.
    CorruptedValue(String),
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvError::RocksDb(e) => write!(f, "rocksdb error: {e}"),
            KvError::MissingColumnFamily(cf) => write!(f, "missing column family '{cf}'"),
            KvError::CorruptedValue(key) => write!(f, "corrupted value under key '{key}'"),
        }
    }
}

impl std::error::Error for KvError {}

impl From<rocksdb::Error> for KvError {
    fn from(e: rocksdb::Error) -> Self {
        KvError::RocksDb(e)
    }
}

/// Abstract durable KV interface used by the state driver.
///
/// Reads return `None` for both missing and unreadable values (unreadable
/// ones are logged); writes propagate failures so the node can shut down
/// cleanly on storage trouble.
pub trait KvStore: Send {
    /// Fetches the value stored under `key`, if any.
    fn get(&self, key: &str) -> Option<Value>;

    /// Stores `value` under `key`.
    fn set(&mut self, key: &str, value: &Value) -> Result<(), KvError>;

    /// Removes `key` if present.
    fn delete(&mut self, key: &str) -> Result<(), KvError>;

    /// Drops every key. Used by rollback when state is rebuilt from blocks.
    fn flush(&mut self) -> Result<(), KvError>;
}

/// In-memory implementation of [`KvStore`].
#[derive(Default)]
pub struct MemKvStore {
    entries: BTreeMap<String, Value>,
}

impl MemKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvStore for MemKvStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &Value) -> Result<(), KvError> {
        self.entries.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), KvError> {
        self.entries.remove(key);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), KvError> {
        self.entries.clear();
        Ok(())
    }
}

/// RocksDB-backed implementation of [`KvStore`].
pub struct RocksDbKvStore {
    db: DB,
}

impl RocksDbKvStore {
    /// Opens (or creates) a RocksDB-backed state store at the given path.
    ///
    /// This sets up the `"state"` column family. The `"default"` column
    /// family is also created to keep RocksDB happy, but it is not used.
    pub fn open(cfg: &RocksDbConfig) -> Result<Self, KvError> {
        let path = Path::new(&cfg.path);

        let mut opts = Options::default();
        opts.create_if_missing(cfg.create_if_missing);
        opts.create_missing_column_families(cfg.create_if_missing);

        let cfs = vec![
            ColumnFamilyDescriptor::new("default", Options::default()),
            ColumnFamilyDescriptor::new("state", Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;

        Ok(Self { db })
    }

    fn cf_state(&self) -> Result<Arc<BoundColumnFamily<'_>>, KvError> {
        self.db
            .cf_handle("state")
            .ok_or(KvError::MissingColumnFamily("state"))
    }
}

impl KvStore for RocksDbKvStore {
    fn get(&self, key: &str) -> Option<Value> {
        let cf = self.cf_state().ok()?;
        match self.db.get_cf(&cf, key.as_bytes()) {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(key, %err, "dropping unreadable state value");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(key, %err, "state read failed");
                None
            }
        }
    }

    fn set(&mut self, key: &str, value: &Value) -> Result<(), KvError> {
        let cf = self.cf_state()?;
        let bytes = value.to_string();
        self.db.put_cf(&cf, key.as_bytes(), bytes.as_bytes())?;
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), KvError> {
        let cf = self.cf_state()?;
        self.db.delete_cf(&cf, key.as_bytes())?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), KvError> {
        let cf = self.cf_state()?;
        let keys: Vec<Vec<u8>> = self
            .db
            .iterator_cf(&cf, IteratorMode::Start)
            .filter_map(|item| item.ok().map(|(k, _)| k.to_vec()))
            .collect();
        for key in keys {
            self.db.delete_cf(&cf, key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(store: &mut dyn KvStore) {
        assert_eq!(store.get("k"), None);

        store.set("k", &serde_json::json!({"n": 1})).unwrap();
        assert_eq!(store.get("k"), Some(serde_json::json!({"n": 1})));

        store.set("k", &serde_json::json!(2)).unwrap();
        assert_eq!(store.get("k"), Some(serde_json::json!(2)));

        store.delete("k").unwrap();
        assert_eq!(store.get("k"), None);

        store.set("a", &serde_json::json!("x")).unwrap();
        store.set("b", &serde_json::json!("y")).unwrap();
        store.flush().unwrap();
        assert_eq!(store.get("a"), None);
        assert_eq!(store.get("b"), None);
    }

    #[test]
    fn mem_store_roundtrip() {
        let mut store = MemKvStore::new();
        exercise(&mut store);
    }

    #[test]
    fn rocksdb_store_roundtrip() {
        let tmp = TempDir::new().expect("create temp dir");
        let cfg = RocksDbConfig {
            path: tmp.path().to_string_lossy().to_string(),
            create_if_missing: true,
        };

        let mut store = RocksDbKvStore::open(&cfg).expect("open RocksDB");
        exercise(&mut store);
    }

    #[test]
    fn rocksdb_store_survives_reopen() {
        let tmp = TempDir::new().expect("create temp dir");
        let cfg = RocksDbConfig {
            path: tmp.path().to_string_lossy().to_string(),
            create_if_missing: true,
        };

        {
            let mut store = RocksDbKvStore::open(&cfg).expect("open RocksDB");
            store.set("persist", &serde_json::json!(42)).unwrap();
        }

        let store = RocksDbKvStore::open(&cfg).expect("reopen RocksDB");
        assert_eq!(store.get("persist"), Some(serde_json::json!(42)));
    }
}
