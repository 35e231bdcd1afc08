//! Engine Integration Tests
//!
//! End-to-end tests through the `PhaseKv` facade: transaction semantics on
//! every concurrency strategy, split-key isolation and the epoch protocol.

#[path = "../common/mod.rs"]
mod common;

mod basics;
mod epochs;
mod split;
