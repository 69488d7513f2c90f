//! The single consensus rule.
//!
//! Every call site uses the same comparison: a result hash wins once it
//! holds at least `needed = ceil(N * percent / 100)` votes, where `N`
//! counts all members including the local node.
//!
//! Two flavors of certainty:
//!
//! - **ideal**: a unique hash reached `needed` votes,
//! - **eager**: enough votes exist but the top hashes are tied and no
//!   outstanding vote can break the tie; the lexicographically smallest
//!   top hash is chosen so every honest node picks the same one.
//!
//! When neither flavor can still be reached the HLC is stalled and both
//! `*_possible` flags go false; the validation queue surfaces that as a
//! diagnostic and the transaction is eventually dropped.

use std::collections::{BTreeMap, HashMap};

use crate::types::{HashHex, Vk};

/// Outcome of one consensus check over the currently known solutions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConsensusResult {
    pub has_consensus: bool,
    pub ideal_consensus_possible: bool,
    pub eager_consensus_possible: bool,
    /// The winning result hash, when `has_consensus` is true.
    pub solution: Option<HashHex>,
    /// Votes currently held by the best hash.
    pub top_votes: u64,
}

/// Votes required for consensus: `ceil(num_participants * percent / 100)`,
/// never less than one.
pub fn needed_votes(num_participants: usize, consensus_percent: u64) -> u64 {
    let n = num_participants as u64;
    ((n * consensus_percent).div_ceil(100)).max(1)
}

/// Checks the known `solutions` (vk -> result hash) against the member
/// count and consensus percentage.
pub fn check_consensus(
    solutions: &HashMap<Vk, HashHex>,
    num_participants: usize,
    consensus_percent: u64,
) -> ConsensusResult {
    let needed = needed_votes(num_participants, consensus_percent);

    // BTreeMap so tie-breaking by smallest hash is deterministic.
    let mut tallies: BTreeMap<&HashHex, u64> = BTreeMap::new();
    for hash in solutions.values() {
        *tallies.entry(hash).or_insert(0) += 1;
    }

    let max_votes = tallies.values().copied().max().unwrap_or(0);
    let top_hashes: Vec<&HashHex> = tallies
        .iter()
        .filter(|(_, votes)| **votes == max_votes)
        .map(|(hash, _)| *hash)
        .collect();
    let tied = top_hashes.len() > 1;

    let remaining = (num_participants as u64).saturating_sub(solutions.len() as u64);
    let reachable = max_votes + remaining >= needed;

    let ideal_consensus_possible = reachable && !(tied && remaining == 0);
    let eager_consensus_possible = reachable;

    if max_votes >= needed && !tied {
        return ConsensusResult {
            has_consensus: true,
            ideal_consensus_possible: true,
            eager_consensus_possible: true,
            solution: top_hashes.first().map(|h| (*h).clone()),
            top_votes: max_votes,
        };
    }

    // Ideal is off the table but the tied leaders have enough votes:
    // break the tie deterministically.
    if max_votes >= needed && tied && !ideal_consensus_possible {
        return ConsensusResult {
            has_consensus: true,
            ideal_consensus_possible: false,
            eager_consensus_possible: true,
            solution: top_hashes.first().map(|h| (*h).clone()),
            top_votes: max_votes,
        };
    }

    ConsensusResult {
        has_consensus: false,
        ideal_consensus_possible,
        eager_consensus_possible,
        solution: None,
        top_votes: max_votes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solutions(votes: &[(&str, &str)]) -> HashMap<Vk, HashHex> {
        votes
            .iter()
            .map(|(vk, hash)| (vk.to_string(), hash.to_string()))
            .collect()
    }

    #[test]
    fn needed_votes_rounds_up() {
        assert_eq!(needed_votes(3, 51), 2);
        assert_eq!(needed_votes(4, 51), 3);
        assert_eq!(needed_votes(10, 51), 6);
        assert_eq!(needed_votes(1, 51), 1);
        assert_eq!(needed_votes(2, 100), 2);
    }

    #[test]
    fn unique_majority_is_ideal_consensus() {
        let s = solutions(&[("a", "h1"), ("b", "h1"), ("c", "h2")]);
        let result = check_consensus(&s, 3, 51);

        assert!(result.has_consensus);
        assert!(result.ideal_consensus_possible);
        assert_eq!(result.solution.as_deref(), Some("h1"));
        assert_eq!(result.top_votes, 2);
    }

    #[test]
    fn no_consensus_while_votes_outstanding() {
        let s = solutions(&[("a", "h1")]);
        let result = check_consensus(&s, 3, 51);

        assert!(!result.has_consensus);
        assert!(result.ideal_consensus_possible);
        assert!(result.eager_consensus_possible);
    }

    #[test]
    fn exhausted_tie_resolves_eagerly_to_smallest_hash() {
        let s = solutions(&[("a", "h2"), ("b", "h1"), ("c", "h2"), ("d", "h1")]);
        let result = check_consensus(&s, 4, 50);

        assert!(result.has_consensus);
        assert!(!result.ideal_consensus_possible);
        assert!(result.eager_consensus_possible);
        assert_eq!(result.solution.as_deref(), Some("h1"));
    }

    #[test]
    fn tie_with_votes_outstanding_waits_for_ideal() {
        // Two vs two with one vote outstanding at 51% of 5 (needed = 3):
        // neither hash has enough yet, but the last vote can decide.
        let s = solutions(&[("a", "h1"), ("b", "h1"), ("c", "h2"), ("d", "h2")]);
        let result = check_consensus(&s, 5, 51);

        assert!(!result.has_consensus);
        assert!(result.ideal_consensus_possible);
        assert!(result.eager_consensus_possible);
    }

    #[test]
    fn unreachable_majority_stalls() {
        // Five participants, needed = 3, and three distinct hashes with all
        // votes in: the max (1) plus remaining (2... none) cannot reach 3.
        let s = solutions(&[
            ("a", "h1"),
            ("b", "h2"),
            ("c", "h3"),
            ("d", "h4"),
            ("e", "h5"),
        ]);
        let result = check_consensus(&s, 5, 51);

        assert!(!result.has_consensus);
        assert!(!result.ideal_consensus_possible);
        assert!(!result.eager_consensus_possible);
    }

    #[test]
    fn empty_solutions_are_open() {
        let s = HashMap::new();
        let result = check_consensus(&s, 3, 51);
        assert!(!result.has_consensus);
        assert!(result.ideal_consensus_possible);
        assert!(result.eager_consensus_possible);
        assert_eq!(result.top_votes, 0);
    }
}
