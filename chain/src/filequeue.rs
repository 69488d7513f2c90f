//! On-disk transaction admission queue.
//!
//! The admission endpoint (external to this crate) drops one canonical
//! JSON transaction per file into `<root>/txq/`. The node pops files in
//! name order, so the directory doubles as a bounded FIFO with free
//! crash-persistence.

use std::fs;
use std::io;
use std::path::PathBuf;

use tracing::warn;

use crate::types::Transaction;

/// File-backed FIFO of admitted transactions.
pub struct FileQueue {
    queue_dir: PathBuf,
}

impl FileQueue {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, io::Error> {
        let queue_dir = root.into().join("txq");
        fs::create_dir_all(&queue_dir)?;
        Ok(Self { queue_dir })
    }

    fn sorted_entries(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.queue_dir) else {
            return Vec::new();
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                entry.file_type().ok()?.is_file().then(|| entry.path())
            })
            .collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.sorted_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted_entries().is_empty()
    }

    /// Appends a transaction (used by tests and local tooling; the real
    /// admission endpoint writes files directly).
    pub fn push(&self, tx: &Transaction) -> Result<(), io::Error> {
        let name = format!(
            "{:020}-{}.json",
            self.len(),
            &tx.metadata.signature[..16.min(tx.metadata.signature.len())]
        );
        let encoded = serde_json::to_string(tx)?;
        fs::write(self.queue_dir.join(name), encoded)
    }

    /// Pops the oldest queued transaction, deleting its file. Unreadable
    /// files are discarded with a warning rather than wedging the queue.
    pub fn pop(&self) -> Option<Transaction> {
        for path in self.sorted_entries() {
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(err) => {
                    warn!(path = %path.display(), %err, "unreadable tx file, removing");
                    let _ = fs::remove_file(&path);
                    continue;
                }
            };
            let _ = fs::remove_file(&path);

            match serde_json::from_str(&content) {
                Ok(tx) => return Some(tx),
                Err(err) => {
                    warn!(path = %path.display(), %err, "malformed tx file, dropping");
                    continue;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TxMetadata, TxPayload};
    use serde_json::json;
    use tempfile::TempDir;

    fn tx(nonce: u64) -> Transaction {
        Transaction {
            metadata: TxMetadata {
                signature: format!("{nonce:0128}"),
            },
            payload: TxPayload {
                contract: "kv".to_string(),
                function: "set".to_string(),
                kwargs: json!({}),
                nonce,
                processor: "aa".repeat(32),
                sender: "bb".repeat(32),
                stamps_supplied: 1,
            },
        }
    }

    #[test]
    fn pops_in_fifo_order() {
        let tmp = TempDir::new().unwrap();
        let queue = FileQueue::open(tmp.path()).unwrap();

        queue.push(&tx(1)).unwrap();
        queue.push(&tx(2)).unwrap();
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop().unwrap().payload.nonce, 1);
        assert_eq!(queue.pop().unwrap().payload.nonce, 2);
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn malformed_files_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let queue = FileQueue::open(tmp.path()).unwrap();

        fs::write(tmp.path().join("txq").join("00-bad.json"), "not json").unwrap();
        queue.push(&tx(7)).unwrap();

        assert_eq!(queue.pop().unwrap().payload.nonce, 7);
        assert!(queue.is_empty());
    }
}
