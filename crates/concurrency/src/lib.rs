//! Concurrency layer for phasekv
//!
//! This crate implements transaction execution against the shared store:
//! - [`Transaction`]: the interface transaction bodies are written against
//! - [`OptimisticTxn`]: OCC with split-key routing to the local store
//! - [`PessimisticTxn`]: lock-on-access with bounded lock waits
//! - [`TxnContext`]: per-worker state (commit ids, local store, statistics)
//! - [`CandidateTracker`]: sampled contention statistics
//! - [`LocalStore`]: per-worker aggregation of split-key updates

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod candidates;
pub mod context;
pub mod local_store;
pub mod optimistic;
pub mod pessimistic;
pub mod transaction;

pub use candidates::{CandidateTracker, Stat};
pub use context::{TidGenerator, TxnContext, WorkerStats};
pub use local_store::{LocalDelta, LocalStore};
pub use optimistic::OptimisticTxn;
pub use pessimistic::PessimisticTxn;
pub use transaction::{AnyTxn, Transaction};
