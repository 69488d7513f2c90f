//! Replaying speculative state after an out-of-order arrival.
//!
//! When a transaction arrives with an HLC earlier than ones this node has
//! already executed, the relative order of HLCs must not change — instead
//! the state is rolled back to the new HLC, the new transaction is
//! executed, and every later HLC whose recorded reads overlap the keys
//! changed so far is replayed. Replays whose writes actually changed are
//! republished to the network; untouched HLCs get their snapshotted delta
//! restored verbatim (including the read set, which later reprocessing
//! rounds depend on).
//!
//! Change detection is uniform: the symmetric difference of the previous
//! and new write-key sets, plus every key whose post-value differs.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;
use tracing::{debug, info};

use crate::execution::Executor;
use crate::hlc::Hlc;
use crate::queues::{ProcessingQueue, ValidationQueue};
use crate::state::{Delta, StateDriver};
use crate::types::{ProcessingResult, TxMessage, Vk};

/// What one reprocessing run did.
#[derive(Debug, Default)]
pub struct ReprocessOutcome {
    /// Results that must be re-signed and re-broadcast, in HLC order. The
    /// new transaction's result is always first.
    pub to_publish: Vec<ProcessingResult>,
    /// HLCs that were re-executed.
    pub replayed: Vec<Hlc>,
    /// HLCs restored from their snapshot without re-execution.
    pub restored: Vec<Hlc>,
}

/// Keys whose effect differs between a snapshotted delta and the writes
/// currently staged in the driver.
fn changed_write_keys(
    prev: &BTreeMap<String, (Option<Value>, Option<Value>)>,
    new: &BTreeMap<String, Option<Value>>,
) -> HashSet<String> {
    let mut diff = HashSet::new();

    for (key, post) in new {
        match prev.get(key) {
            None => {
                diff.insert(key.clone());
            }
            Some((_pre, prev_post)) if prev_post != post => {
                diff.insert(key.clone());
            }
            Some(_) => {}
        }
    }
    for key in prev.keys() {
        if !new.contains_key(key) {
            diff.insert(key.clone());
        }
    }

    diff
}

/// Rolls back to `new_tx`'s HLC, executes it, and replays every later
/// pending HLC whose reads overlap the changed keys.
///
/// The caller has already checked that the new HLC is later than the last
/// hard-applied one; earlier arrivals are a chain rewrite, not a
/// reprocess.
pub fn reprocess(
    new_tx: &TxMessage,
    driver: &mut StateDriver,
    queue: &ProcessingQueue,
    executor: &dyn Executor,
    validation: &ValidationQueue,
    my_vk: &Vk,
) -> ReprocessOutcome {
    let snapshot: BTreeMap<Hlc, Delta> = driver.pending_deltas().clone();
    let new_hlc = new_tx.hlc_timestamp.clone();

    info!(%new_hlc, pending = snapshot.len(), "reprocessing after out-of-order arrival");

    let mut hlcs: Vec<Hlc> = snapshot.keys().cloned().collect();
    if !hlcs.contains(&new_hlc) {
        hlcs.push(new_hlc.clone());
        hlcs.sort();
    }

    let mut changed_keys: HashSet<String> = HashSet::new();
    let mut outcome = ReprocessOutcome::default();

    for hlc in hlcs {
        if hlc < new_hlc {
            continue;
        }

        if hlc == new_hlc {
            driver.rollback_to(Some(&new_hlc));

            let result = queue.process_tx(new_tx, driver, executor);
            changed_keys.extend(driver.pending_write_keys());
            driver.soft_apply(&new_hlc);
            outcome.to_publish.push(result);
            continue;
        }

        let Some(prev) = snapshot.get(&hlc) else {
            continue;
        };

        let overlaps = prev.reads.iter().any(|key| changed_keys.contains(key));
        if !overlaps {
            driver.restore_delta(prev);
            driver.soft_apply(&hlc);
            outcome.restored.push(hlc);
            continue;
        }

        let Some(tx_message) = validation.get_recreated_tx_message(&hlc, my_vk) else {
            // No stored solution of our own to replay from; keep the old
            // delta rather than losing the HLC.
            debug!(%hlc, "no recreated tx message, restoring snapshot");
            driver.restore_delta(prev);
            driver.soft_apply(&hlc);
            outcome.restored.push(hlc);
            continue;
        };

        let result = queue.process_tx(&tx_message, driver, executor);
        let diff = changed_write_keys(&prev.writes, driver.pending_writes());
        driver.soft_apply(&hlc);

        if diff.is_empty() {
            debug!(%hlc, "replay produced identical writes");
        } else {
            debug!(%hlc, changed = diff.len(), "replay changed writes, republishing");
            changed_keys.extend(diff);
            outcome.to_publish.push(result);
        }
        outcome.replayed.push(hlc);
    }

    outcome
}
