//! Storage layer for phasekv
//!
//! This crate implements the shared in-memory store:
//! - [`Record`]: versioned cell with a CAS lock word, a split flag and
//!   contention counters
//! - [`ShardedStore`]: 256 independently locked shards selected by the
//!   key's first byte, plus the registries of split keys and contention
//!   candidates

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod record;
pub mod sharded;

pub use record::Record;
pub use sharded::{Shard, ShardedStore};
