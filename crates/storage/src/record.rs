//! Record: the unit of storage
//!
//! A record couples a value with the metadata both engines and the epoch
//! protocol need:
//!
//! - a 64-bit version/lock word used by the optimistic engine. Unlocked it
//!   holds the [`Tid`] of the last commit; locked it additionally has
//!   [`Tid::LOCK_BIT`] set. Locking is a CAS from the unlocked word, release
//!   is a plain store.
//! - the value behind a reader/writer lock. The optimistic engine only holds
//!   it for the duration of a clone or an update; the pessimistic engine holds
//!   it for the whole transaction through an owned guard.
//! - the `split` flag, flipped only by the coordinator while every worker is
//!   parked at the epoch barrier.
//! - racy contention counters feeding promotion/demotion candidacy.
//!
//! A record's [`ValueKind`] never changes after creation.

use parking_lot::RwLock;
use phasekv_core::{Key, Tid, Update, Value, ValueKind};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Spins before a blocking lock attempt starts yielding the thread
const SPINS_BEFORE_YIELD: u32 = 64;

/// A stored key/value cell
pub struct Record {
    key: Key,
    kind: ValueKind,
    value: Arc<RwLock<Value>>,
    word: AtomicU64,
    split: AtomicBool,
    lock_misses: AtomicU32,
    stashes: AtomicU32,
}

impl Record {
    /// Create an unlocked, never-committed record
    pub fn new(key: Key, value: Value, kind: ValueKind) -> Self {
        Self {
            key,
            kind,
            value: Arc::new(RwLock::new(value)),
            word: AtomicU64::new(0),
            split: AtomicBool::new(false),
            lock_misses: AtomicU32::new(0),
            stashes: AtomicU32::new(0),
        }
    }

    /// Record key
    #[inline]
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Value kind, fixed at creation
    #[inline]
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Clone of the current value
    pub fn value(&self) -> Value {
        self.value.read().clone()
    }

    /// Integer value, if this is a `Sum`/`Max` record
    pub fn int_value(&self) -> Option<i32> {
        self.value.read().as_int()
    }

    /// The lock guarding the value
    ///
    /// Exposed for the pessimistic engine, which keeps owned guards for the
    /// duration of a transaction.
    pub fn value_lock(&self) -> &Arc<RwLock<Value>> {
        &self.value
    }

    /// Whether the key is managed through per-worker aggregation
    #[inline]
    pub fn is_split(&self) -> bool {
        self.split.load(Ordering::Acquire)
    }

    pub(crate) fn set_split(&self, split: bool) {
        self.split.store(split, Ordering::Release);
    }

    /// Raw version/lock word
    #[inline]
    pub fn word(&self) -> u64 {
        self.word.load(Ordering::Acquire)
    }

    /// Commit id of the last writer (ignores the lock bit)
    pub fn version(&self) -> Tid {
        Tid::from_raw(self.word() & !Tid::LOCK_BIT)
    }

    /// Whether some transaction currently holds the record lock
    pub fn is_locked(&self) -> bool {
        self.word() & Tid::LOCK_BIT != 0
    }

    /// Version to validate against later, or `None` if locked
    #[inline]
    pub fn unlocked_version(&self) -> Option<Tid> {
        let w = self.word();
        if w & Tid::LOCK_BIT != 0 {
            None
        } else {
            Some(Tid::from_raw(w))
        }
    }

    /// Unchanged and unlocked since `last` was observed
    #[inline]
    pub fn verify(&self, last: Tid) -> bool {
        self.word() == last.as_u64()
    }

    /// Locked (by the caller, who knows it holds the lock) with no commit
    /// since `last` was observed
    #[inline]
    pub fn owns(&self, last: Tid) -> bool {
        self.word() == last.as_u64() | Tid::LOCK_BIT
    }

    /// Try to take the exclusive lock bit
    ///
    /// A failed attempt counts as a lock miss for contention tracking.
    pub fn try_lock(&self) -> bool {
        let cur = self.word();
        if cur & Tid::LOCK_BIT == 0
            && self
                .word
                .compare_exchange(cur, cur | Tid::LOCK_BIT, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return true;
        }
        self.lock_misses.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Take the lock bit, spinning until it is free
    ///
    /// Used by merge, which must not fail. Holders are short-lived commits.
    pub fn lock_blocking(&self) {
        let mut spins = 0u32;
        loop {
            let cur = self.word();
            if cur & Tid::LOCK_BIT == 0
                && self
                    .word
                    .compare_exchange_weak(
                        cur,
                        cur | Tid::LOCK_BIT,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
                return;
            }
            spins += 1;
            if spins < SPINS_BEFORE_YIELD {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Release the lock, publishing `tid` as the new version
    #[inline]
    pub fn unlock(&self, tid: Tid) {
        debug_assert!(self.is_locked(), "unlock of unlocked record {}", self.key);
        self.word.store(tid.as_u64(), Ordering::Release);
    }

    /// Release the lock without changing the version
    #[inline]
    pub fn unlock_abort(&self) {
        self.word.fetch_and(!Tid::LOCK_BIT, Ordering::AcqRel);
    }

    /// Publish a new version without touching the lock bit protocol
    ///
    /// Used by the pessimistic engine, which serializes through the value lock.
    pub fn stamp(&self, tid: Tid) {
        self.word.store(tid.as_u64(), Ordering::Release);
    }

    /// Fold an update into the value under the value write lock
    pub(crate) fn apply(&self, update: &Update) {
        self.value.write().apply(update);
    }

    /// Failed lock attempts since the last reset
    pub fn lock_misses(&self) -> u32 {
        self.lock_misses.load(Ordering::Relaxed)
    }

    pub(crate) fn reset_lock_misses(&self) {
        self.lock_misses.store(0, Ordering::Relaxed);
    }

    /// Stashes caused by this record since the last reset
    pub fn stashes(&self) -> u32 {
        self.stashes.load(Ordering::Relaxed)
    }

    pub(crate) fn add_stash(&self) -> u32 {
        self.stashes.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn reset_stashes(&self) {
        self.stashes.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("version", &self.version())
            .field("locked", &self.is_locked())
            .field("split", &self.is_split())
            .finish()
    }
}
