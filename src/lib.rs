//! Inline WAF enforcement for Envoy external processing
//!
//! Sits at Envoy's ext_proc / ext_authz extension points and mediates
//! every HTTP exchange through a pluggable rule engine before traffic
//! continues.
//!
//! ## Components
//!
//! - **extproc**: streaming external processor (header/body phases)
//! - **authz**: single-shot authorization check (headers only)
//! - **inspect**: per-exchange transaction state machine and registry
//! - **engine**: the rule-engine contract the adapter drives

pub mod authz;
pub mod config;
pub mod engine;
pub mod extproc;
pub mod inspect;
pub mod proto;

pub use config::AdapterConfig;
pub use engine::{Interruption, RuleEngine};
pub use inspect::registry::TransactionRegistry;

use thiserror::Error;

/// Adapter errors
#[derive(Error, Debug)]
pub enum WafError {
    #[error("missing correlation id header")]
    MissingCorrelationId,

    #[error("unknown transaction {0}")]
    UnknownTransaction(String),

    #[error("transaction {0} already exists")]
    DuplicateTransaction(String),

    #[error("unexpected {event} event in phase {phase:?}")]
    OutOfOrder {
        event: &'static str,
        phase: inspect::transaction::Phase,
    },

    #[error("malformed address {0:?}")]
    MalformedAddress(String),

    #[error("missing host in authority {0:?}")]
    MissingHost(String),

    #[error("malformed status code {0:?}")]
    MalformedStatus(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WafError>;
