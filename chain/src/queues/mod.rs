//! The two HLC-ordered queues driving the node: processing (execute) and
//! validation (collect peer proofs, decide consensus).

pub mod processing;
pub mod validation;

pub use processing::{AppendOutcome, ProcessingDelay, ProcessingQueue};
pub use validation::{CheckInfo, ValidationQueue, ValidationRecord};
