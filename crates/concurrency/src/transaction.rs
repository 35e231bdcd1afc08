//! The transaction interface
//!
//! Transaction bodies are written against [`Transaction`] and never know
//! which engine runs them. [`AnyTxn`] picks the engine from the worker's
//! [`SystemType`](phasekv_core::SystemType).
//!
//! # Lifecycle
//!
//! ```text
//! begin ─► read / write* ─► commit ─► Ok(tid)
//!                   │             └─► Err(Abort)   (locks released)
//!                   └─► Err(..) ─► abort            (idempotent)
//! ```
//!
//! Dropping a transaction that was neither committed nor aborted aborts it.

use phasekv_core::{Entry, Key, Phase, Tid, TxnError, Update, Value, ValueKind};
use phasekv_storage::ShardedStore;

use crate::context::TxnContext;
use crate::optimistic::OptimisticTxn;
use crate::pessimistic::PessimisticTxn;

/// Operations available to transaction bodies
pub trait Transaction {
    /// Read the current value of `key`
    ///
    /// Returns [`TxnError::NoKey`] for a missing key (unless this
    /// transaction already wrote it), [`TxnError::Stash`] for a split key in
    /// the split phase, [`TxnError::Abort`] on a conflict.
    fn read(&mut self, key: &Key) -> Result<Value, TxnError>;

    /// Buffer a write of `value`; the record is created at commit if absent
    fn write(&mut self, key: Key, value: Value, kind: ValueKind);

    /// Buffer a `Sum` or `Max` update on an existing key
    fn write_int32(&mut self, key: Key, delta: i32, kind: ValueKind) -> Result<(), TxnError>;

    /// Buffer a list append; the record is created at commit if absent
    fn write_list(&mut self, key: Key, entry: Entry);

    /// Declare that `key` will be written
    ///
    /// Lets the pessimistic engine take the exclusive lock on first read
    /// instead of upgrading later. Optimistic engines ignore it.
    fn maybe_write(&mut self, _key: &Key) {}

    /// Worker-unique id for new application rows
    fn uid(&mut self) -> u64;

    /// Enter `phase`
    fn set_phase(&mut self, phase: Phase);

    /// Current phase
    fn phase(&self) -> Phase;

    /// Make all buffered writes visible atomically
    fn commit(&mut self) -> Result<Tid, TxnError>;

    /// Release everything without applying; safe to call repeatedly
    fn abort(&mut self);
}

/// Build the update a plain `write` buffers
///
/// # Panics
///
/// `Sum`/`Max` kinds require an integer value.
pub(crate) fn update_for(kind: ValueKind, value: Value) -> Update {
    match kind {
        ValueKind::Sum | ValueKind::Max => match value.as_int() {
            Some(v) => Update::int(kind, v),
            None => panic!("{} write needs an integer, got {}", kind, value.type_name()),
        },
        ValueKind::Write | ValueKind::List => Update::Write(value),
    }
}

/// Engine chosen per worker at runtime
pub enum AnyTxn<'w> {
    /// Optimistic engine (`Doppel` and `Occ`)
    Optimistic(OptimisticTxn<'w>),
    /// Pessimistic engine (`Locking`)
    Pessimistic(PessimisticTxn<'w>),
}

impl<'w> AnyTxn<'w> {
    /// Start a transaction on the engine configured for `ctx`
    pub fn begin(store: &'w ShardedStore, ctx: &'w mut TxnContext) -> Self {
        if ctx.system().is_optimistic() {
            AnyTxn::Optimistic(OptimisticTxn::begin(store, ctx))
        } else {
            AnyTxn::Pessimistic(PessimisticTxn::begin(store, ctx))
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $txn:ident => $body:expr) => {
        match $self {
            AnyTxn::Optimistic($txn) => $body,
            AnyTxn::Pessimistic($txn) => $body,
        }
    };
}

impl Transaction for AnyTxn<'_> {
    fn read(&mut self, key: &Key) -> Result<Value, TxnError> {
        dispatch!(self, t => t.read(key))
    }

    fn write(&mut self, key: Key, value: Value, kind: ValueKind) {
        dispatch!(self, t => t.write(key, value, kind))
    }

    fn write_int32(&mut self, key: Key, delta: i32, kind: ValueKind) -> Result<(), TxnError> {
        dispatch!(self, t => t.write_int32(key, delta, kind))
    }

    fn write_list(&mut self, key: Key, entry: Entry) {
        dispatch!(self, t => t.write_list(key, entry))
    }

    fn maybe_write(&mut self, key: &Key) {
        dispatch!(self, t => t.maybe_write(key))
    }

    fn uid(&mut self) -> u64 {
        dispatch!(self, t => t.uid())
    }

    fn set_phase(&mut self, phase: Phase) {
        dispatch!(self, t => t.set_phase(phase))
    }

    fn phase(&self) -> Phase {
        dispatch!(self, t => t.phase())
    }

    fn commit(&mut self) -> Result<Tid, TxnError> {
        dispatch!(self, t => t.commit())
    }

    fn abort(&mut self) {
        dispatch!(self, t => t.abort())
    }
}
