//! Per-worker aggregation of split-key updates
//!
//! While a key is split, committed updates to it are not applied to the
//! shared record. The committing worker folds them into its own
//! [`LocalStore`] instead, where they combine without synchronization: sums
//! add up, maxima keep the larger value, list appends queue in order, plain
//! writes keep the last value. At the end of the epoch the worker merges
//! every pending delta into the shared store.

use phasekv_core::{Entry, Key, Tid, Update, ValueKind};
use phasekv_storage::ShardedStore;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Pending delta for one key
#[derive(Debug, Clone, PartialEq)]
pub enum LocalDelta {
    /// Sum of all `Sum` updates
    Sum(i32),
    /// Largest of all `Max` updates
    Max(i32),
    /// Appended entries in commit order
    List(SmallVec<[Entry; 4]>),
    /// Last plain write
    Write(phasekv_core::Value),
}

impl LocalDelta {
    fn from_update(update: &Update) -> Self {
        match update {
            Update::Sum(d) => LocalDelta::Sum(*d),
            Update::Max(m) => LocalDelta::Max(*m),
            Update::Append(e) => LocalDelta::List(smallvec::smallvec![*e]),
            Update::Write(v) => LocalDelta::Write(v.clone()),
        }
    }

    fn absorb(&mut self, update: &Update) {
        match (self, update) {
            (LocalDelta::Sum(cur), Update::Sum(d)) => *cur = cur.wrapping_add(*d),
            (LocalDelta::Max(cur), Update::Max(m)) => *cur = (*cur).max(*m),
            (LocalDelta::List(entries), Update::Append(e)) => entries.push(*e),
            (LocalDelta::Write(cur), Update::Write(v)) => *cur = v.clone(),
            (delta, update) => panic!(
                "cannot combine {} update with pending {} delta",
                update.kind(),
                delta.kind()
            ),
        }
    }

    /// Kind of record this delta targets
    pub fn kind(&self) -> ValueKind {
        match self {
            LocalDelta::Sum(_) => ValueKind::Sum,
            LocalDelta::Max(_) => ValueKind::Max,
            LocalDelta::List(_) => ValueKind::List,
            LocalDelta::Write(_) => ValueKind::Write,
        }
    }

    /// Store-level updates equivalent to this delta
    fn updates(self) -> SmallVec<[Update; 4]> {
        match self {
            LocalDelta::Sum(d) => smallvec::smallvec![Update::Sum(d)],
            LocalDelta::Max(m) => smallvec::smallvec![Update::Max(m)],
            LocalDelta::List(entries) => entries.into_iter().map(Update::Append).collect(),
            LocalDelta::Write(v) => smallvec::smallvec![Update::Write(v)],
        }
    }
}

/// A worker's pending split-key deltas
#[derive(Debug, Default)]
pub struct LocalStore {
    deltas: FxHashMap<Key, LocalDelta>,
}

impl LocalStore {
    /// Create an empty local store
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate an update for a split key
    ///
    /// # Panics
    ///
    /// Panics if `update` targets a different kind than the pending delta.
    pub fn apply(&mut self, key: Key, update: &Update) {
        match self.deltas.get_mut(&key) {
            Some(delta) => delta.absorb(update),
            None => {
                self.deltas.insert(key, LocalDelta::from_update(update));
            }
        }
    }

    /// Fold every pending delta into the shared store
    ///
    /// Each record is locked, updated and released with `tid` as its new
    /// version. Only called in the merge phase, when no transaction on any
    /// worker can read a split key. Returns the number of keys merged.
    pub fn merge(&mut self, store: &ShardedStore, tid: Tid) -> usize {
        let merged = self.deltas.len();
        for (key, delta) in self.deltas.drain() {
            let record = store.get_or_create(key, delta.kind());
            record.lock_blocking();
            for update in delta.updates() {
                store.apply(&record, &update);
            }
            record.unlock(tid);
        }
        if merged > 0 {
            tracing::trace!(merged, %tid, "merged local deltas");
        }
        merged
    }

    /// Pending delta for `key`
    pub fn pending(&self, key: &Key) -> Option<&LocalDelta> {
        self.deltas.get(key)
    }

    /// Number of keys with pending deltas
    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    /// Check if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }
}
