//! Layered state store with per-HLC speculative deltas.
//!
//! Reads resolve newest-first: current pending writes, then the cache
//! (which holds the merged post-state of every soft-applied delta plus
//! read-through copies of durable values), then the durable store. Writes
//! land in the pending layer and only reach the durable store through
//! [`StateDriver::hard_apply_one`].
//!
//! The pending layer is deliberately not crash-safe; everything in it can
//! be reconstructed by re-executing transactions. Durable writes are atomic
//! per key.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde_json::Value;
use tracing::debug;

use crate::hlc::Hlc;
use crate::types::Vk;

use super::kv::{KvError, KvStore};

/// State key holding the governance member list.
pub const MEMBERS_KEY: &str = "masternodes.members";

/// State key holding the safe block height marker.
pub const SAFE_BLOCK_HEIGHT_KEY: &str = "__safe_block_height";

/// One speculative delta: the keys a transaction read and, for each key it
/// wrote, the `(pre, post)` value pair. `None` means "absent".
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Delta {
    pub reads: HashSet<String>,
    pub writes: BTreeMap<String, (Option<Value>, Option<Value>)>,
}

/// Errors surfaced by the state driver.
#[derive(Debug)]
pub enum StateError {
    /// Durable store failure; fatal for the node.
    Kv(KvError),
    /// `hard_apply_one` was asked for an HLC that has no pending delta.
    UnknownDelta(Hlc),
    /// `hard_apply_one` was asked for an HLC that is not the oldest pending
    /// delta; hard-applied HLCs must form a strictly increasing sequence.
    NotOldestPending(Hlc),
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::Kv(e) => write!(f, "{e}"),
            StateError::UnknownDelta(hlc) => write!(f, "no pending delta for {hlc}"),
            StateError::NotOldestPending(hlc) => {
                write!(f, "{hlc} is not the oldest pending delta")
            }
        }
    }
}

impl std::error::Error for StateError {}

impl From<KvError> for StateError {
    fn from(e: KvError) -> Self {
        StateError::Kv(e)
    }
}

/// The process-wide layered state store.
pub struct StateDriver {
    durable: Box<dyn KvStore>,
    cache: HashMap<String, Option<Value>>,
    pending_writes: BTreeMap<String, Option<Value>>,
    reads: HashSet<String>,
    pending_deltas: BTreeMap<Hlc, Delta>,
}

impl StateDriver {
    pub fn new(durable: Box<dyn KvStore>) -> Self {
        StateDriver {
            durable,
            cache: HashMap::new(),
            pending_writes: BTreeMap::new(),
            reads: HashSet::new(),
            pending_deltas: BTreeMap::new(),
        }
    }

    /// Tracked read: records `key` in the current read set and returns the
    /// newest visible value (pending > cache > durable).
    pub fn get(&mut self, key: &str) -> Option<Value> {
        self.reads.insert(key.to_string());

        if let Some(value) = self.pending_writes.get(key) {
            return value.clone();
        }
        if let Some(value) = self.cache.get(key) {
            return value.clone();
        }

        let value = self.durable.get(key);
        self.cache.insert(key.to_string(), value.clone());
        value
    }

    /// Untracked read with the same layering as [`get`](Self::get), for
    /// lookups outside transaction execution (member lists, config keys).
    pub fn lookup(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.pending_writes.get(key) {
            return value.clone();
        }
        if let Some(value) = self.cache.get(key) {
            return value.clone();
        }
        self.durable.get(key)
    }

    /// Stages a write for the transaction currently executing.
    pub fn set(&mut self, key: &str, value: Value) {
        self.pending_writes.insert(key.to_string(), Some(value));
    }

    /// Stages a deletion for the transaction currently executing.
    pub fn delete(&mut self, key: &str) {
        self.pending_writes.insert(key.to_string(), None);
    }

    /// Keys staged by the transaction currently executing.
    pub fn pending_write_keys(&self) -> Vec<String> {
        self.pending_writes.keys().cloned().collect()
    }

    /// Drops the current staged writes and read set without recording a
    /// delta. Used when an execution fails and must leave no trace.
    pub fn discard_pending_writes(&mut self) {
        self.pending_writes.clear();
        self.reads.clear();
    }

    /// Current staged writes as `key -> post value`.
    pub fn pending_writes(&self) -> &BTreeMap<String, Option<Value>> {
        &self.pending_writes
    }

    /// Snapshots the current pending writes and read set into
    /// `pending_deltas[hlc]`, merges the writes into the cache, and clears
    /// the working layers.
    ///
    /// Pre-values are captured relative to the state *before* this delta
    /// (cache, then durable), so rolling the delta back restores exactly
    /// what older deltas and the durable store would produce.
    pub fn soft_apply(&mut self, hlc: &Hlc) {
        let mut writes = BTreeMap::new();

        let staged: Vec<(String, Option<Value>)> = self.pending_writes.iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (key, post) in staged {
            let pre = match self.cache.get(&key) {
                Some(value) => value.clone(),
                None => self.durable.get(&key),
            };
            self.cache.insert(key.clone(), post.clone());
            writes.insert(key, (pre, post));
        }

        let delta = Delta {
            reads: std::mem::take(&mut self.reads),
            writes,
        };

        self.pending_writes.clear();
        self.pending_deltas.insert(hlc.clone(), delta);
    }

    /// Promotes the delta at `hlc` — which must be the oldest pending one —
    /// to the durable store and removes it from the pending set.
    ///
    /// Later deltas are untouched; reads they performed may now be stale,
    /// which is the reprocessor's problem, not this layer's.
    pub fn hard_apply_one(&mut self, hlc: &Hlc) -> Result<Delta, StateError> {
        let oldest = self
            .pending_deltas
            .keys()
            .next()
            .cloned()
            .ok_or_else(|| StateError::UnknownDelta(hlc.clone()))?;

        if &oldest != hlc {
            if !self.pending_deltas.contains_key(hlc) {
                return Err(StateError::UnknownDelta(hlc.clone()));
            }
            return Err(StateError::NotOldestPending(hlc.clone()));
        }

        let delta = self
            .pending_deltas
            .remove(&oldest)
            .ok_or_else(|| StateError::UnknownDelta(hlc.clone()))?;

        for (key, (_pre, post)) in &delta.writes {
            match post {
                Some(value) => self.durable.set(key, value)?,
                None => self.durable.delete(key)?,
            }
        }

        debug!(%hlc, writes = delta.writes.len(), "hard applied delta");
        Ok(delta)
    }

    /// Whether a pending delta exists for `hlc`.
    pub fn has_pending(&self, hlc: &Hlc) -> bool {
        self.pending_deltas.contains_key(hlc)
    }

    /// The ordered pending delta map.
    pub fn pending_deltas(&self) -> &BTreeMap<Hlc, Delta> {
        &self.pending_deltas
    }

    /// Rolls speculative state back to just before `hlc`.
    ///
    /// Every delta with key ≥ `hlc` is undone in reverse order (its
    /// pre-values restored into the cache) and dropped. `None` clears all
    /// speculative state, returning reads to the durable store.
    pub fn rollback_to(&mut self, hlc: Option<&Hlc>) {
        self.reads.clear();
        self.pending_writes.clear();

        let Some(hlc) = hlc else {
            self.cache.clear();
            self.pending_deltas.clear();
            return;
        };

        let to_undo: Vec<Hlc> = self
            .pending_deltas
            .range(hlc.clone()..)
            .map(|(k, _)| k.clone())
            .rev()
            .collect();

        for key in to_undo {
            if let Some(delta) = self.pending_deltas.remove(&key) {
                for (state_key, (pre, _post)) in delta.writes {
                    self.cache.insert(state_key, pre);
                }
            }
        }
    }

    /// Clears all speculative state (cache, working layers, deltas).
    pub fn clear_pending_state(&mut self) {
        self.rollback_to(None);
    }

    /// Drops cache entries for the given keys so subsequent reads hit the
    /// durable store. Called after a hard apply with that delta's writes.
    pub fn bust_cache<'a>(&mut self, keys: impl IntoIterator<Item = &'a String>) {
        for key in keys {
            self.cache.remove(key);
        }
    }

    /// Re-stages a previously snapshotted delta (post-values and read set)
    /// as the current working layers. Used by the reprocessor when a replay
    /// is not needed and the old delta should be kept verbatim.
    pub fn restore_delta(&mut self, delta: &Delta) {
        self.pending_writes = delta
            .writes
            .iter()
            .map(|(k, (_pre, post))| (k.clone(), post.clone()))
            .collect();
        self.reads = delta.reads.clone();
    }

    /// Writes `key` durably only if no speculative layer has touched it.
    ///
    /// Used by catch-up paths that import committed state from peers while
    /// local speculation is in flight: a locally pending write is newer
    /// information than the imported block.
    pub fn safe_set(&mut self, key: &str, value: &Value) -> Result<bool, StateError> {
        let touched = self.pending_writes.contains_key(key)
            || self
                .pending_deltas
                .values()
                .any(|delta| delta.writes.contains_key(key));
        if touched {
            return Ok(false);
        }

        self.durable.set(key, value)?;
        self.cache.remove(key);
        Ok(true)
    }

    /// Governance member list from state, or empty when unset.
    pub fn member_vk_list(&self) -> Vec<Vk> {
        match self.lookup(MEMBERS_KEY) {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Wipes the durable store. Only rollback uses this, right before
    /// replaying the surviving chain from genesis.
    pub fn flush_durable(&mut self) -> Result<(), StateError> {
        self.clear_pending_state();
        self.durable.flush()?;
        Ok(())
    }
}

impl fmt::Debug for StateDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateDriver")
            .field("cache_entries", &self.cache.len())
            .field("pending_writes", &self.pending_writes.len())
            .field("pending_deltas", &self.pending_deltas.len())
            .finish()
    }
}
