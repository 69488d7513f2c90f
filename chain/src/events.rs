//! Observer events.
//!
//! Outside observers (explorers, upgrade tooling) watch a directory where
//! the node drops one JSON file per event, named by a zero-padded monotonic
//! sequence number so directory order is emission order.

use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Event topics the node emits.
pub const NEW_BLOCK_EVENT: &str = "new_block";
pub const BLOCK_REORG_EVENT: &str = "block_reorg";
pub const UPGRADE_EVENT: &str = "upgrade";
pub const NETWORK_ERROR_EVENT: &str = "network_error";
pub const SYNC_BLOCKS_EVENT: &str = "sync_blocks";

/// One observer event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub topics: Vec<String>,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(topic: &str, data: serde_json::Value) -> Self {
        Event {
            topics: vec![topic.to_string()],
            data,
        }
    }
}

/// Writes events as ordered files under `<root>/events/`.
pub struct EventWriter {
    events_dir: PathBuf,
    next_seq: u64,
}

impl EventWriter {
    /// Opens (or creates) the events directory and resumes the sequence
    /// after any files already present.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, io::Error> {
        let events_dir = root.into().join("events");
        fs::create_dir_all(&events_dir)?;

        let next_seq = fs::read_dir(&events_dir)?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let name = entry.file_name();
                let stem = name.to_str()?.strip_suffix(".json")?;
                stem.parse::<u64>().ok()
            })
            .max()
            .map(|max| max + 1)
            .unwrap_or(0);

        Ok(Self {
            events_dir,
            next_seq,
        })
    }

    /// Writes one event file and bumps the sequence.
    pub fn write_event(&mut self, event: &Event) -> Result<(), io::Error> {
        let path = self.events_dir.join(format!("{:020}.json", self.next_seq));
        let encoded = serde_json::to_string(event)?;
        fs::write(&path, encoded)?;

        debug!(topics = ?event.topics, seq = self.next_seq, "wrote event");
        self.next_seq += 1;
        Ok(())
    }
}
