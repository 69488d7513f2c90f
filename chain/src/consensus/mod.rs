//! Consensus determination and block minting.

pub mod determine;
pub mod minter;

pub use determine::{ConsensusResult, check_consensus, needed_votes};
pub use minter::{block_from_processing_results, genesis_block_from_state, recalc_block_info};
