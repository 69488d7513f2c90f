//! Per-`(processor, sender)` nonce tables.
//!
//! Committed nonces live under `nonces/`, speculative ones under
//! `pending_nonces/`, one file per pair named `<processor>.<sender>`.
//! Committed nonces are strictly increasing; the pending table smooths
//! admission of several transactions from the same sender before any of
//! them commits.

use std::fs;
use std::io;
use std::path::PathBuf;

use tracing::warn;

use crate::types::Vk;

/// File-backed nonce storage.
pub struct NonceStorage {
    nonces_dir: PathBuf,
    pending_dir: PathBuf,
}

impl NonceStorage {
    /// Opens (or creates) nonce storage under `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, io::Error> {
        let root = root.into();
        let nonces_dir = root.join("nonces");
        let pending_dir = root.join("pending_nonces");
        fs::create_dir_all(&nonces_dir)?;
        fs::create_dir_all(&pending_dir)?;
        Ok(Self {
            nonces_dir,
            pending_dir,
        })
    }

    fn file_name(processor: &Vk, sender: &Vk) -> String {
        format!("{processor}.{sender}")
    }

    fn read(dir: &PathBuf, processor: &Vk, sender: &Vk) -> Option<u64> {
        let path = dir.join(Self::file_name(processor, sender));
        let content = fs::read_to_string(path).ok()?;
        match content.trim().parse() {
            Ok(n) => Some(n),
            Err(err) => {
                warn!(%processor, %sender, %err, "unreadable nonce file");
                None
            }
        }
    }

    fn write(dir: &PathBuf, processor: &Vk, sender: &Vk, value: u64) -> Result<(), io::Error> {
        fs::write(dir.join(Self::file_name(processor, sender)), value.to_string())
    }

    /// Last committed nonce for the pair, if any.
    pub fn get_nonce(&self, processor: &Vk, sender: &Vk) -> Option<u64> {
        Self::read(&self.nonces_dir, processor, sender)
    }

    /// Records a committed nonce.
    pub fn set_nonce(&self, processor: &Vk, sender: &Vk, value: u64) -> Result<(), io::Error> {
        Self::write(&self.nonces_dir, processor, sender, value)
    }

    /// Last pending (admitted but uncommitted) nonce for the pair, if any.
    pub fn get_pending_nonce(&self, processor: &Vk, sender: &Vk) -> Option<u64> {
        Self::read(&self.pending_dir, processor, sender)
    }

    /// Records a pending nonce.
    pub fn set_pending_nonce(
        &self,
        processor: &Vk,
        sender: &Vk,
        value: u64,
    ) -> Result<(), io::Error> {
        Self::write(&self.pending_dir, processor, sender, value)
    }

    /// The newest nonce known for the pair: pending first, then committed.
    pub fn get_latest_nonce(&self, processor: &Vk, sender: &Vk) -> Option<u64> {
        self.get_pending_nonce(processor, sender)
            .or_else(|| self.get_nonce(processor, sender))
    }

    /// The nonce the next admitted transaction must carry.
    pub fn get_next_nonce(&self, processor: &Vk, sender: &Vk) -> u64 {
        match self.get_latest_nonce(processor, sender) {
            Some(n) => n + 1,
            None => 0,
        }
    }

    /// Drops all pending nonces (e.g. after a rollback).
    pub fn flush_pending(&self) -> Result<(), io::Error> {
        for entry in fs::read_dir(&self.pending_dir)? {
            let entry = entry?;
            fs::remove_file(entry.path())?;
        }
        Ok(())
    }

    /// Drops everything, committed and pending.
    pub fn flush(&self) -> Result<(), io::Error> {
        for dir in [&self.nonces_dir, &self.pending_dir] {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pair() -> (Vk, Vk) {
        ("aa".repeat(32), "bb".repeat(32))
    }

    #[test]
    fn nonce_roundtrip_and_next() {
        let tmp = TempDir::new().unwrap();
        let store = NonceStorage::open(tmp.path()).unwrap();
        let (processor, sender) = pair();

        assert_eq!(store.get_nonce(&processor, &sender), None);
        assert_eq!(store.get_next_nonce(&processor, &sender), 0);

        store.set_nonce(&processor, &sender, 4).unwrap();
        assert_eq!(store.get_nonce(&processor, &sender), Some(4));
        assert_eq!(store.get_next_nonce(&processor, &sender), 5);
    }

    #[test]
    fn pending_nonce_shadows_committed() {
        let tmp = TempDir::new().unwrap();
        let store = NonceStorage::open(tmp.path()).unwrap();
        let (processor, sender) = pair();

        store.set_nonce(&processor, &sender, 2).unwrap();
        store.set_pending_nonce(&processor, &sender, 7).unwrap();

        assert_eq!(store.get_latest_nonce(&processor, &sender), Some(7));
        assert_eq!(store.get_next_nonce(&processor, &sender), 8);

        store.flush_pending().unwrap();
        assert_eq!(store.get_latest_nonce(&processor, &sender), Some(2));
    }

    #[test]
    fn pairs_are_independent() {
        let tmp = TempDir::new().unwrap();
        let store = NonceStorage::open(tmp.path()).unwrap();
        let (processor, sender) = pair();
        let other_sender = "cc".repeat(32);

        store.set_nonce(&processor, &sender, 9).unwrap();
        assert_eq!(store.get_nonce(&processor, &other_sender), None);
    }
}
