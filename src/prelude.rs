//! Convenient imports for phasekv
//!
//! ```
//! use phasekv::prelude::*;
//!
//! let key = Key::from_parts(1, 0);
//! let req = Request::new(0, Args::key(key).with_amount(1));
//! assert_eq!(req.args.keys[0], key);
//! ```

pub use crate::database::{PhaseKv, PhaseKvBuilder};
pub use crate::error::{Error, Result};

pub use phasekv_concurrency::{Transaction, WorkerStats};
pub use phasekv_core::{
    EngineConfig, Entry, Key, Phase, SystemType, Tid, TxnError, Update, Value, ValueKind,
};
pub use phasekv_engine::{Args, Reply, Request, TxnCode, TxnRegistry};
