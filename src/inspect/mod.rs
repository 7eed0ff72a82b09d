//! Per-exchange inspection core
//!
//! Header projection, body reassembly, the transaction state machine
//! and the shared in-flight registry.

pub mod body;
pub mod headers;
pub mod registry;
pub mod transaction;

pub use registry::TransactionRegistry;
pub use transaction::{Phase, Transaction, Verdict};
