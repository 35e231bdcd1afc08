//! Optimistic engine
//!
//! Reads snapshot the record's version word; writes are buffered. Commit
//! follows the classic lock / stamp / validate / apply sequence:
//!
//! ```text
//! 1. lock every written record that is not split (CAS on the lock word)
//! 2. take a commit id from the worker's generator
//! 3. validate every read: the version must be unchanged, or locked by us
//!    with no commit in between when we also write the key
//! 4. apply: split keys fold into the local store, everything else goes to
//!    the shared record, which is then unlocked with the new commit id
//! ```
//!
//! A failure in step 1 or 3 releases every lock taken so far and returns
//! [`TxnError::Abort`].
//!
//! # Split keys
//!
//! In the split phase of a system that splits keys, a read of a split
//! record returns [`TxnError::Stash`] and writes to it skip both
//! pre-validation and locking: they are commutative deltas that only
//! this worker can see until the next merge.

use phasekv_core::{Entry, Key, Phase, Tid, TxnError, Update, Value, ValueKind};
use phasekv_storage::{Record, ShardedStore};
use std::sync::Arc;

use crate::context::TxnContext;
use crate::transaction::{update_for, Transaction};

/// A snapshotted read
#[derive(Debug)]
pub(crate) struct ReadSlot {
    record: Arc<Record>,
    last: Tid,
}

/// A buffered write
#[derive(Debug)]
pub(crate) struct WriteSlot {
    key: Key,
    kind: ValueKind,
    update: Update,
    record: Option<Arc<Record>>,
    locked: bool,
}

/// A transaction on the optimistic engine
pub struct OptimisticTxn<'w> {
    store: &'w ShardedStore,
    ctx: &'w mut TxnContext,
    /// A blind write found its record locked; commit must fail
    doomed: bool,
    finished: bool,
}

impl<'w> OptimisticTxn<'w> {
    /// Start a transaction
    pub fn begin(store: &'w ShardedStore, ctx: &'w mut TxnContext) -> Self {
        ctx.begin();
        Self {
            store,
            ctx,
            doomed: false,
            finished: false,
        }
    }

    /// Whether split records bypass the shared store right now
    #[inline]
    fn routes_split(&self) -> bool {
        self.ctx.system().splits_keys() && self.ctx.phase() == Phase::Split
    }

    /// Add `record` to the read set, or fail if it is locked
    fn snapshot(&mut self, record: &Arc<Record>) -> Result<(), TxnError> {
        match record.unlocked_version() {
            Some(last) => {
                self.ctx.reads.push(ReadSlot {
                    record: Arc::clone(record),
                    last,
                });
                Ok(())
            }
            None => {
                if self.ctx.sampling {
                    self.ctx.candidates.record_conflict(*record.key());
                }
                Err(TxnError::Abort)
            }
        }
    }

    /// Apply this transaction's buffered writes for `key` on top of `base`
    fn overlay(&self, key: &Key, mut base: Value) -> Value {
        for w in self.ctx.writes.iter().filter(|w| w.key == *key) {
            base.apply(&w.update);
        }
        base
    }

    fn buffered_kind(&self, key: &Key) -> Option<ValueKind> {
        self.ctx.writes.iter().find(|w| w.key == *key).map(|w| w.kind)
    }

    fn push_write(&mut self, key: Key, kind: ValueKind, update: Update, record: Option<Arc<Record>>) {
        if self.ctx.writes.len() >= self.ctx.write_set_capacity {
            panic!(
                "write set overflow: more than {} writes in one transaction",
                self.ctx.write_set_capacity
            );
        }
        self.ctx.writes.push(WriteSlot {
            key,
            kind,
            update,
            record,
            locked: false,
        });
    }

    /// Pre-validate a blind write when the record already exists
    fn prevalidate(&mut self, key: &Key) -> Option<Arc<Record>> {
        let record = self.store.get(key).ok()?;
        if !(self.routes_split() && record.is_split()) && self.snapshot(&record).is_err() {
            self.doomed = true;
        }
        Some(record)
    }

    fn release_locks(&mut self) {
        for w in self.ctx.writes.iter_mut().filter(|w| w.locked) {
            if let Some(record) = &w.record {
                record.unlock_abort();
            }
            w.locked = false;
        }
    }

    fn fail(&mut self) -> TxnError {
        self.abort();
        TxnError::Abort
    }
}

impl Transaction for OptimisticTxn<'_> {
    fn read(&mut self, key: &Key) -> Result<Value, TxnError> {
        let record = match self.store.get(key) {
            Ok(record) => record,
            Err(e) => {
                // Created by one of our own buffered writes
                return match self.buffered_kind(key) {
                    Some(kind) => Ok(self.overlay(key, kind.default_value())),
                    None => Err(e),
                };
            }
        };
        if self.routes_split() && record.is_split() {
            if self.ctx.sampling {
                self.ctx.candidates.record_stash(*key);
            }
            self.store.note_stash(&record);
            return Err(TxnError::Stash);
        }
        if let Err(e) = self.snapshot(&record) {
            self.abort();
            return Err(e);
        }
        let value = record.value();
        Ok(self.overlay(key, value))
    }

    fn write(&mut self, key: Key, value: Value, kind: ValueKind) {
        let update = update_for(kind, value);
        let record = self.prevalidate(&key);
        self.push_write(key, kind, update, record);
    }

    fn write_int32(&mut self, key: Key, delta: i32, kind: ValueKind) -> Result<(), TxnError> {
        let record = self.store.get(&key)?;
        if !(self.routes_split() && record.is_split()) {
            if let Err(e) = self.snapshot(&record) {
                self.abort();
                return Err(e);
            }
        }
        self.push_write(key, kind, Update::int(kind, delta), Some(record));
        Ok(())
    }

    fn write_list(&mut self, key: Key, entry: Entry) {
        let record = self.prevalidate(&key);
        self.push_write(key, ValueKind::List, Update::Append(entry), record);
    }

    fn uid(&mut self) -> u64 {
        self.ctx.tids.uid()
    }

    fn set_phase(&mut self, phase: Phase) {
        self.ctx.set_phase(phase);
    }

    fn phase(&self) -> Phase {
        self.ctx.phase()
    }

    fn commit(&mut self) -> Result<Tid, TxnError> {
        if self.finished || self.doomed {
            return Err(self.fail());
        }
        let routes_split = self.routes_split();
        let store = self.store;
        let ctx = &mut *self.ctx;

        // 1. Resolve and lock
        for i in 0..ctx.writes.len() {
            let record = match &ctx.writes[i].record {
                Some(record) => Arc::clone(record),
                None => {
                    let w = &ctx.writes[i];
                    store.get_or_create(w.key, w.kind)
                }
            };
            ctx.writes[i].record = Some(Arc::clone(&record));
            if routes_split && record.is_split() {
                continue;
            }
            // A key written twice is locked once
            let already = ctx.writes[..i]
                .iter()
                .any(|w| w.locked && w.key == ctx.writes[i].key);
            if already {
                continue;
            }
            if !record.try_lock() {
                if ctx.sampling {
                    ctx.candidates.record_conflict(*record.key());
                }
                ctx.stats.lock_failures += 1;
                return Err(self.fail());
            }
            ctx.writes[i].locked = true;
        }

        // 2. Commit id
        let tid = ctx.tids.commit_tid();

        // 3. Validate reads
        for r in &ctx.reads {
            let key = *r.record.key();
            if ctx.sampling {
                ctx.candidates.record_read(key);
            }
            if r.record.verify(r.last) {
                continue;
            }
            let ours = ctx.writes.iter().any(|w| w.key == key) && r.record.owns(r.last);
            if ours {
                continue;
            }
            if ctx.sampling {
                ctx.candidates.record_conflict(key);
            }
            ctx.stats.verify_failures += 1;
            tracing::trace!(%key, %tid, "read validation failed");
            return Err(self.fail());
        }

        // 4. Apply, then publish
        for w in &ctx.writes {
            let Some(record) = &w.record else { continue };
            if ctx.sampling {
                ctx.candidates.record_write(w.key);
            }
            if routes_split && record.is_split() {
                ctx.local.apply(w.key, &w.update);
            } else {
                store.apply(record, &w.update);
            }
        }
        for w in ctx.writes.iter_mut().filter(|w| w.locked) {
            if let Some(record) = &w.record {
                record.unlock(tid);
            }
            w.locked = false;
        }

        ctx.stats.committed += 1;
        self.finished = true;
        Ok(tid)
    }

    fn abort(&mut self) {
        self.release_locks();
        if !self.finished {
            self.finished = true;
            self.ctx.stats.aborted += 1;
        }
    }
}

impl Drop for OptimisticTxn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.abort();
        }
    }
}
