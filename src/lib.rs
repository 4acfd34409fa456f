//! Policy payment reconciliation service
//!
//! Matches a bank statement against an internal policy log:
//! - Extracts transactions from uploaded documents with an LLM collaborator
//! - Pairs them deterministically on reference id and amount
//! - Lets the LLM propose pairs for the leftovers, re-validating every proposal
//! - Persists each run as a batch and reports the unmatched exceptions
//!
//! RUN:
//! UPLOAD → PARSE → PERSIST → EXACT MATCH → FUZZY MATCH → COMMIT

pub mod api;
pub mod audit;
pub mod config;
pub mod documents;
pub mod error;
pub mod extraction;
pub mod gemini;
pub mod matching;
pub mod models;
pub mod orchestrator;
pub mod parser;
pub mod store;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use orchestrator::Orchestrator;
