//! The validation queue: collects peer proofs per HLC and decides when a
//! result has consensus.
//!
//! Only the earliest pending HLC is ever committed, which keeps the chain
//! linear: later HLCs wait even when their votes are already decisive.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::consensus::determine::{ConsensusResult, check_consensus};
use crate::hlc::Hlc;
use crate::storage::BlockStorage;
use crate::types::{HashHex, ProcessingResult, Proof, TxMessage, Vk};

/// Cached outcome of the most recent consensus check for one HLC.
#[derive(Clone, Debug, PartialEq)]
pub struct CheckInfo {
    pub has_consensus: bool,
    pub ideal_consensus_possible: bool,
    pub eager_consensus_possible: bool,
    pub solution: Option<HashHex>,
}

impl Default for CheckInfo {
    fn default() -> Self {
        Self {
            has_consensus: false,
            ideal_consensus_possible: true,
            eager_consensus_possible: true,
            solution: None,
        }
    }
}

/// Everything collected for one HLC.
#[derive(Debug)]
pub struct ValidationRecord {
    /// vk -> result hash that node voted for.
    pub solutions: HashMap<Vk, HashHex>,
    /// vk -> the proof carrying that vote.
    pub proofs: HashMap<Vk, Proof>,
    /// result hash -> one full processing result with that hash.
    pub result_lookup: HashMap<HashHex, ProcessingResult>,
    pub last_check_info: CheckInfo,
    created_at: Instant,
}

impl Default for ValidationRecord {
    fn default() -> Self {
        Self {
            solutions: HashMap::new(),
            proofs: HashMap::new(),
            result_lookup: HashMap::new(),
            last_check_info: CheckInfo::default(),
            created_at: Instant::now(),
        }
    }
}

/// Proof collection and consensus decisions, keyed by HLC.
#[derive(Default)]
pub struct ValidationQueue {
    results: BTreeMap<Hlc, ValidationRecord>,
    last_hlc_in_consensus: Option<Hlc>,
}

impl ValidationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// The newest HLC that reached consensus and was committed.
    pub fn last_hlc_in_consensus(&self) -> Option<&Hlc> {
        self.last_hlc_in_consensus.as_ref()
    }

    /// Advances the committed watermark without a local consensus round
    /// (used when blocks are force-applied from the network).
    pub fn advance_last_hlc(&mut self, hlc: &Hlc) {
        match &self.last_hlc_in_consensus {
            Some(last) if last >= hlc => {}
            _ => self.last_hlc_in_consensus = Some(hlc.clone()),
        }
    }

    /// Records one node's processing result.
    ///
    /// Results for HLCs that are already inside a committed block are
    /// dropped. A node re-voting resets the possibility flags (its new vote
    /// can revive a stalled round) and prunes result payloads no current
    /// vote references.
    pub fn append(&mut self, processing_results: ProcessingResult, blocks: &BlockStorage) {
        let hlc = processing_results.hlc_timestamp.clone();

        let Some(proof) = processing_results.proof.clone() else {
            warn!(%hlc, "dropping processing result without proof");
            return;
        };
        let Some(result_hash) = proof.tx_result_hash.clone() else {
            warn!(%hlc, "dropping proof without result hash");
            return;
        };
        let node_vk = proof.signer.clone();

        if let Some(last) = &self.last_hlc_in_consensus {
            if &hlc <= last && blocks.get_block_by_hlc(&hlc).is_some() {
                return;
            }
        }

        let record = self.results.entry(hlc.clone()).or_default();

        if record.last_check_info.has_consensus {
            return;
        }

        if record.solutions.contains_key(&node_vk) {
            record.last_check_info.ideal_consensus_possible = true;
            record.last_check_info.eager_consensus_possible = true;
        }

        record.solutions.insert(node_vk.clone(), result_hash.clone());
        record.proofs.insert(node_vk, proof);
        record
            .result_lookup
            .entry(result_hash)
            .or_insert(processing_results);

        Self::clean_result_lookup(record);
    }

    /// Drops result payloads that no current vote references.
    fn clean_result_lookup(record: &mut ValidationRecord) {
        let referenced: Vec<HashHex> = record.solutions.values().cloned().collect();
        record
            .result_lookup
            .retain(|hash, _| referenced.contains(hash));
    }

    /// The earliest HLC with collected results.
    pub fn earliest_hlc(&self) -> Option<&Hlc> {
        self.results.keys().next()
    }

    pub fn is_earliest(&self, hlc: &Hlc) -> bool {
        self.earliest_hlc() == Some(hlc)
    }

    pub fn awaiting_validation(&self, hlc: &Hlc) -> bool {
        self.results.contains_key(hlc)
    }

    /// Runs the consensus check for one HLC and caches the outcome.
    pub fn check_one(
        &mut self,
        hlc: &Hlc,
        num_participants: usize,
        consensus_percent: u64,
    ) -> Option<&CheckInfo> {
        let record = self.results.get_mut(hlc)?;

        let ConsensusResult {
            has_consensus,
            ideal_consensus_possible,
            eager_consensus_possible,
            solution,
            top_votes,
        } = check_consensus(&record.solutions, num_participants, consensus_percent);

        record.last_check_info = CheckInfo {
            has_consensus,
            ideal_consensus_possible,
            eager_consensus_possible,
            solution,
        };

        debug!(
            %hlc,
            has_consensus,
            top_votes,
            votes = record.solutions.len(),
            "checked consensus"
        );
        Some(&record.last_check_info)
    }

    pub fn hlc_has_consensus(&self, hlc: &Hlc) -> bool {
        self.results
            .get(hlc)
            .map(|r| r.last_check_info.has_consensus)
            .unwrap_or(false)
    }

    /// Number of votes collected for an HLC.
    pub fn count_solutions(&self, hlc: &Hlc) -> usize {
        self.results.get(hlc).map(|r| r.solutions.len()).unwrap_or(0)
    }

    /// The full processing result the consensus solution refers to.
    pub fn get_consensus_result(&self, hlc: &Hlc) -> Option<ProcessingResult> {
        let record = self.results.get(hlc)?;
        let solution = record.last_check_info.solution.as_ref()?;
        record.result_lookup.get(solution).cloned()
    }

    /// All proofs whose vote matches the consensus solution.
    pub fn get_proofs(&self, hlc: &Hlc) -> Vec<Proof> {
        let Some(record) = self.results.get(hlc) else {
            return Vec::new();
        };
        if !record.last_check_info.has_consensus {
            return Vec::new();
        }
        let solution = record.last_check_info.solution.clone();

        let mut proofs: Vec<Proof> = record
            .proofs
            .values()
            .filter(|proof| proof.tx_result_hash == solution)
            .cloned()
            .collect();
        proofs.sort_by(|a, b| a.signer.cmp(&b.signer));
        proofs
    }

    /// Whether this node's own vote equals the consensus solution.
    pub fn consensus_matches_me(&self, hlc: &Hlc, my_vk: &Vk) -> bool {
        let Some(record) = self.results.get(hlc) else {
            return false;
        };
        let mine = record.solutions.get(my_vk);
        mine.is_some() && mine == record.last_check_info.solution.as_ref()
    }

    /// This node's recorded result hash for an HLC.
    pub fn get_result_hash_for_vk(&self, hlc: &Hlc, vk: &Vk) -> Option<&HashHex> {
        self.results.get(hlc)?.solutions.get(vk)
    }

    /// Rebuilds the transaction message this node executed at `hlc`, for
    /// replay during reprocessing.
    pub fn get_recreated_tx_message(&self, hlc: &Hlc, my_vk: &Vk) -> Option<TxMessage> {
        let record = self.results.get(hlc)?;
        let my_solution = record.solutions.get(my_vk)?;
        let result = record.result_lookup.get(my_solution)?;
        Some(result.tx_message.clone())
    }

    /// Marks an HLC committed: advances the watermark and flushes its
    /// record.
    pub fn mark_committed(&mut self, hlc: &Hlc) {
        self.advance_last_hlc(hlc);
        self.flush_hlc(hlc);
    }

    /// Drops everything collected for an HLC.
    pub fn flush_hlc(&mut self, hlc: &Hlc) {
        self.results.remove(hlc);
    }

    /// Removes a voted-out node's solutions for HLCs at or before
    /// `max_hlc`, reopening those rounds.
    pub fn clear_solutions(&mut self, node_vk: &Vk, max_hlc: &Hlc) {
        for (hlc, record) in self.results.iter_mut() {
            if hlc > max_hlc {
                continue;
            }
            if record.solutions.remove(node_vk).is_some() {
                record.proofs.remove(node_vk);
                record.last_check_info.ideal_consensus_possible = true;
                record.last_check_info.eager_consensus_possible = true;
                Self::clean_result_lookup(record);
            }
        }
    }

    /// Drops records that can no longer reach consensus and have been
    /// sitting longer than `max_age`. Returns the flushed HLCs.
    pub fn purge_stalled(&mut self, max_age: Duration) -> Vec<Hlc> {
        let stalled: Vec<Hlc> = self
            .results
            .iter()
            .filter(|(_, record)| {
                !record.last_check_info.has_consensus
                    && !record.last_check_info.ideal_consensus_possible
                    && !record.last_check_info.eager_consensus_possible
                    && record.created_at.elapsed() >= max_age
            })
            .map(|(hlc, _)| hlc.clone())
            .collect();

        for hlc in &stalled {
            warn!(%hlc, "dropping stalled consensus round");
            self.results.remove(hlc);
        }
        stalled
    }
}
