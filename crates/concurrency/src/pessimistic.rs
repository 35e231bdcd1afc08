//! Pessimistic engine
//!
//! Every record is locked on first touch through its value lock: shared for
//! reads, exclusive for writes. A key that was read and is later written is
//! upgraded by releasing the shared lock and taking the exclusive one; if
//! another transaction committed to the record in that window the upgrade
//! aborts. Locks are held until commit or abort and released in reverse
//! acquisition order, so commit needs no validation step.
//!
//! Lock waits are bounded by the configured `lock_wait`. A timeout aborts
//! the transaction, which turns lock-order cycles between workers into
//! retries instead of deadlocks.

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;
use phasekv_core::{Entry, Key, Phase, Tid, TxnError, Update, Value, ValueKind};
use phasekv_storage::{Record, ShardedStore};
use smallvec::SmallVec;
use std::sync::Arc;

use crate::context::TxnContext;
use crate::transaction::{update_for, Transaction};

pub(crate) enum Guard {
    Read(ArcRwLockReadGuard<RawRwLock, Value>),
    Write(ArcRwLockWriteGuard<RawRwLock, Value>),
}

/// A record locked by the current transaction
pub(crate) struct Held {
    key: Key,
    record: Arc<Record>,
    /// `None` only between releasing a shared lock and acquiring the
    /// exclusive one during an upgrade
    guard: Option<Guard>,
    /// Version observed when the lock was first taken
    seen: Tid,
    pending: SmallVec<[Update; 2]>,
}

impl Held {
    fn is_write(&self) -> bool {
        matches!(self.guard, Some(Guard::Write(_)))
    }

    /// Current value plus this transaction's pending updates
    fn visible(&self) -> Value {
        let mut value = match &self.guard {
            Some(Guard::Read(g)) => (**g).clone(),
            Some(Guard::Write(g)) => (**g).clone(),
            None => self.record.kind().default_value(),
        };
        for u in &self.pending {
            value.apply(u);
        }
        value
    }
}

impl std::fmt::Debug for Held {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Held")
            .field("key", &self.key)
            .field("write", &self.is_write())
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// A transaction on the pessimistic engine
pub struct PessimisticTxn<'w> {
    store: &'w ShardedStore,
    ctx: &'w mut TxnContext,
    /// Keys announced through `maybe_write`
    intents: SmallVec<[Key; 4]>,
    /// A write could not get its lock; commit must fail
    doomed: bool,
    finished: bool,
}

impl<'w> PessimisticTxn<'w> {
    /// Start a transaction
    pub fn begin(store: &'w ShardedStore, ctx: &'w mut TxnContext) -> Self {
        ctx.begin();
        Self {
            store,
            ctx,
            intents: SmallVec::new(),
            doomed: false,
            finished: false,
        }
    }

    fn position(&self, key: &Key) -> Option<usize> {
        self.ctx.held.iter().position(|h| h.key == *key)
    }

    fn lock_shared(&self, record: &Record) -> Option<Guard> {
        let lock = record.value_lock();
        let guard = match self.ctx.lock_wait {
            Some(wait) => lock.try_read_arc_for(wait)?,
            None => lock.read_arc(),
        };
        Some(Guard::Read(guard))
    }

    fn lock_exclusive(&self, record: &Record) -> Option<Guard> {
        let lock = record.value_lock();
        let guard = match self.ctx.lock_wait {
            Some(wait) => lock.try_write_arc_for(wait)?,
            None => lock.write_arc(),
        };
        Some(Guard::Write(guard))
    }

    fn timed_out(&mut self, key: &Key) -> TxnError {
        tracing::trace!(%key, "lock wait timed out");
        self.ctx.stats.lock_failures += 1;
        self.abort();
        TxnError::Abort
    }

    fn stale(&mut self, key: &Key) -> TxnError {
        tracing::trace!(%key, "record changed during lock upgrade");
        self.ctx.stats.verify_failures += 1;
        self.abort();
        TxnError::Abort
    }

    /// Make sure `record` is held exclusively, returning its index
    fn hold_for_write(&mut self, key: Key, record: Arc<Record>) -> Result<usize, TxnError> {
        if let Some(i) = self.position(&key) {
            if self.ctx.held[i].is_write() {
                return Ok(i);
            }
            // upgrade: drop the shared lock first
            self.ctx.held[i].guard = None;
            let guard = match self.lock_exclusive(&record) {
                Some(g) => g,
                None => return Err(self.timed_out(&key)),
            };
            self.ctx.held[i].guard = Some(guard);
            if self.ctx.held[i].record.version() != self.ctx.held[i].seen {
                return Err(self.stale(&key));
            }
            return Ok(i);
        }
        if self.ctx.held.len() >= self.ctx.write_set_capacity {
            panic!(
                "write set overflow: more than {} records in one transaction",
                self.ctx.write_set_capacity
            );
        }
        let guard = match self.lock_exclusive(&record) {
            Some(g) => g,
            None => return Err(self.timed_out(&key)),
        };
        let seen = record.version();
        self.ctx.held.push(Held {
            key,
            record,
            guard: Some(guard),
            seen,
            pending: SmallVec::new(),
        });
        Ok(self.ctx.held.len() - 1)
    }

    fn buffer(&mut self, key: Key, record: Arc<Record>, update: Update) {
        if self.finished {
            self.doomed = true;
            return;
        }
        match self.hold_for_write(key, record) {
            Ok(i) => self.ctx.held[i].pending.push(update),
            Err(_) => self.doomed = true,
        }
    }

    /// Release every lock, newest first
    fn release(&mut self) {
        while let Some(held) = self.ctx.held.pop() {
            drop(held);
        }
    }
}

impl Transaction for PessimisticTxn<'_> {
    fn read(&mut self, key: &Key) -> Result<Value, TxnError> {
        if self.finished {
            return Err(TxnError::Abort);
        }
        if let Some(i) = self.position(key) {
            return Ok(self.ctx.held[i].visible());
        }
        let record = self.store.get(key)?;
        let guard = if self.intents.contains(key) {
            self.lock_exclusive(&record)
        } else {
            self.lock_shared(&record)
        };
        let Some(guard) = guard else {
            return Err(self.timed_out(key));
        };
        let seen = record.version();
        let held = Held {
            key: *key,
            record,
            guard: Some(guard),
            seen,
            pending: SmallVec::new(),
        };
        let value = held.visible();
        self.ctx.held.push(held);
        Ok(value)
    }

    fn write(&mut self, key: Key, value: Value, kind: ValueKind) {
        let update = update_for(kind, value);
        let record = self.store.get_or_create(key, kind);
        self.buffer(key, record, update);
    }

    fn write_int32(&mut self, key: Key, delta: i32, kind: ValueKind) -> Result<(), TxnError> {
        if self.finished {
            return Err(TxnError::Abort);
        }
        let record = self.store.get(&key)?;
        let i = self.hold_for_write(key, record)?;
        self.ctx.held[i].pending.push(Update::int(kind, delta));
        Ok(())
    }

    fn write_list(&mut self, key: Key, entry: Entry) {
        let record = self.store.get_or_create(key, ValueKind::List);
        self.buffer(key, record, Update::Append(entry));
    }

    fn maybe_write(&mut self, key: &Key) {
        if !self.intents.contains(key) {
            self.intents.push(*key);
        }
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
            self.abort();
            return Err(TxnError::Abort);
        }
        let tid = self.ctx.tids.commit_tid();
        while let Some(mut held) = self.ctx.held.pop() {
            if let Some(Guard::Write(guard)) = held.guard.as_mut() {
                for u in &held.pending {
                    guard.apply(u);
                }
                if !held.pending.is_empty() {
                    held.record.stamp(tid);
                }
            }
        }
        self.ctx.stats.committed += 1;
        self.finished = true;
        Ok(tid)
    }

    fn abort(&mut self) {
        self.release();
        if !self.finished {
            self.finished = true;
            self.ctx.stats.aborted += 1;
        }
    }
}

impl Drop for PessimisticTxn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.abort();
        }
    }
}
