//! Block validity checks: shape, hashes, signatures, and whole-chain
//! validation at startup.

pub mod chain;
pub mod signatures;
pub mod structure;

pub use chain::{ChainValidationError, ValidateChainHandler};
pub use signatures::{BlockVerifyError, verify_block};
pub use structure::{StructureError, validate_block_structure};
