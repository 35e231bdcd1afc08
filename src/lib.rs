//! # phasekv
//!
//! In-memory transactional key-value engine that splits contended keys.
//!
//! Transactions run on a fixed set of workers over a shared sharded store,
//! under either optimistic (OCC) or pessimistic (two-phase locking)
//! concurrency control. In the default mode, keys that see heavy write
//! contention are promoted to *split* mode: workers then apply commutative
//! updates (sum, max, top-k append) to private per-worker deltas instead of
//! the shared record. A coordinator periodically advances a global epoch;
//! at each epoch boundary workers merge their deltas back, the coordinator
//! promotes or demotes keys, and transactions that needed to read a split
//! key are replayed against the merged value.
//!
//! ## Quick Start
//!
//! ```
//! use phasekv::prelude::*;
//!
//! const ADD: TxnCode = 0;
//!
//! let db = PhaseKv::builder()
//!     .workers(2)
//!     .register(ADD, |req, txn| {
//!         txn.write_int32(req.args.keys[0], req.args.amount, ValueKind::Sum)?;
//!         txn.commit()?;
//!         Ok(None)
//!     })
//!     .open()?;
//!
//! let counter = Key::from_parts(1, 0);
//! db.create_int(counter, 0, ValueKind::Sum);
//! db.submit_with_retry(1, Request::new(ADD, Args::key(counter).with_amount(3)), 10,
//!     std::time::Duration::from_millis(1))?;
//! db.finish();
//! assert_eq!(db.get(&counter)?, Value::Int(3));
//! # Ok::<(), phasekv::Error>(())
//! ```
//!
//! ## Crates
//!
//! - `phasekv-core`: keys, values, update semantics, configuration
//! - `phasekv-storage`: records and the sharded store
//! - `phasekv-concurrency`: OCC and locking transactions, per-worker state
//! - `phasekv-engine`: workers, the epoch barrier and the coordinator

#![warn(missing_docs)]

mod database;
mod error;

pub mod prelude;

pub use database::{PhaseKv, PhaseKvBuilder};
pub use error::{Error, Result};
