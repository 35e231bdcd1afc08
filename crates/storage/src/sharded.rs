//! Sharded record store
//!
//! All records live in [`SHARD_COUNT`] independently locked shards. The shard
//! is a pure function of the key's first byte, so two keys with different
//! leading bytes never contend on a shard lock.
//!
//! # Design
//!
//! - `RwLock<FxHashMap<Key, Arc<Record>>>` per shard: O(1) lookups, the
//!   lock only protects the map structure. Values are mutated through the
//!   record itself (lock word + value lock), never under the shard lock.
//! - Records are created lazily and never deleted, so an `Arc<Record>`
//!   handed out by [`ShardedStore::get`] stays valid and current forever.
//! - Contention bookkeeping: a record that keeps missing its lock is
//!   registered as a promotion candidate; a split record that keeps causing
//!   stashes is registered as a demotion candidate. The coordinator drains
//!   both sets.
//!
//! # Thread Safety
//!
//! - get(): shard read lock (or a recursive read that never queues behind
//!   writers when read locks are disabled)
//! - create(): shard write lock, idempotent
//! - apply(): caller holds the record lock (optimistic) or the value write
//!   lock is taken internally

use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use phasekv_core::{EngineConfig, Key, TxnError, Update, Value, ValueKind, SHARD_COUNT};
use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::record::Record;

/// One shard of the store
///
/// Aligned so neighbouring shard locks do not share a cache line.
#[repr(align(128))]
#[derive(Debug, Default)]
pub struct Shard {
    rows: RwLock<FxHashMap<Key, Arc<Record>>>,
}

impl Shard {
    /// Number of records in this shard
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// Check if shard is empty
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

/// Store tuning taken from [`EngineConfig`]
#[derive(Debug, Clone, Copy)]
struct StoreOptions {
    track_contention: bool,
    use_read_locks: bool,
    lock_threshold: u32,
    stash_threshold: u32,
}

/// The shared store
pub struct ShardedStore {
    shards: Box<[Shard]>,
    options: StoreOptions,
    /// Keys currently in split mode
    split_keys: DashSet<Key>,
    /// Records whose lock misses crossed the threshold
    lock_candidates: DashMap<Key, Arc<Record>>,
    /// Split records whose stash count crossed the threshold
    stash_candidates: DashMap<Key, Arc<Record>>,
}

impl ShardedStore {
    /// Create an empty store
    pub fn new(config: &EngineConfig) -> Self {
        let shards: Vec<Shard> = (0..SHARD_COUNT).map(|_| Shard::default()).collect();
        Self {
            shards: shards.into_boxed_slice(),
            options: StoreOptions {
                track_contention: config.system.splits_keys(),
                use_read_locks: config.use_read_locks,
                lock_threshold: config.lock_threshold,
                stash_threshold: config.stash_threshold,
            },
            split_keys: DashSet::new(),
            lock_candidates: DashMap::new(),
            stash_candidates: DashMap::new(),
        }
    }

    #[inline]
    fn shard(&self, key: &Key) -> &Shard {
        &self.shards[key.shard()]
    }

    // ========================================================================
    // Get/Create
    // ========================================================================

    /// Look up a record
    ///
    /// Returns [`TxnError::NoKey`] if the key was never created.
    #[inline]
    pub fn get(&self, key: &Key) -> Result<Arc<Record>, TxnError> {
        let shard = self.shard(key);
        let found = if self.options.use_read_locks {
            shard.rows.read().get(key).cloned()
        } else {
            shard.rows.read_recursive().get(key).cloned()
        };
        found.ok_or(TxnError::NoKey)
    }

    /// Check if a key exists
    pub fn contains(&self, key: &Key) -> bool {
        self.get(key).is_ok()
    }

    /// Insert a record if absent
    ///
    /// Idempotent: if the key already exists (possibly created concurrently)
    /// the existing record is returned and `initial` is dropped.
    pub fn create(&self, key: Key, initial: Value, kind: ValueKind) -> Arc<Record> {
        let mut rows = self.shard(&key).rows.write();
        Arc::clone(
            rows.entry(key)
                .or_insert_with(|| Arc::new(Record::new(key, initial, kind))),
        )
    }

    /// Look up a record, creating it with the kind's default value if absent
    pub fn get_or_create(&self, key: Key, kind: ValueKind) -> Arc<Record> {
        match self.get(&key) {
            Ok(record) => record,
            Err(_) => self.create(key, kind.default_value(), kind),
        }
    }

    /// Create an integer record if absent
    pub fn create_int(&self, key: Key, value: i32, kind: ValueKind) -> Arc<Record> {
        self.create(key, Value::Int(value), kind)
    }

    // ========================================================================
    // Updates
    // ========================================================================

    /// Fold an update into a record's value
    ///
    /// The caller must hold the record lock (or otherwise exclude concurrent
    /// writers). Also runs the lock-contention check.
    pub fn apply(&self, record: &Arc<Record>, update: &Update) {
        if self.options.track_contention {
            self.check_lock(record);
        }
        record.apply(update);
    }

    fn check_lock(&self, record: &Arc<Record>) {
        if !record.is_split() && record.lock_misses() > self.options.lock_threshold {
            tracing::trace!(key = %record.key(), "lock contention candidate");
            self.lock_candidates
                .insert(*record.key(), Arc::clone(record));
            record.reset_lock_misses();
        }
    }

    /// Count a stash caused by a split record
    pub fn note_stash(&self, record: &Arc<Record>) {
        let n = record.add_stash();
        if record.is_split() && n > self.options.stash_threshold {
            self.stash_candidates
                .insert(*record.key(), Arc::clone(record));
            record.reset_stashes();
        }
    }

    /// Drain store-level promotion candidates
    pub fn take_lock_candidates(&self) -> Vec<Key> {
        drain_keys(&self.lock_candidates)
    }

    /// Drain store-level demotion candidates
    pub fn take_stash_candidates(&self) -> Vec<Key> {
        drain_keys(&self.stash_candidates)
    }

    // ========================================================================
    // Split mode
    // ========================================================================

    /// Flip a record's split flag
    ///
    /// Only the coordinator calls this, while every worker is parked at the
    /// epoch barrier.
    pub fn set_split(&self, record: &Record, split: bool) {
        record.set_split(split);
        if split {
            self.split_keys.insert(*record.key());
        } else {
            self.split_keys.remove(record.key());
        }
    }

    /// Keys currently in split mode
    pub fn split_keys(&self) -> Vec<Key> {
        self.split_keys.iter().map(|k| *k).collect()
    }

    /// Whether any key is in split mode
    pub fn has_split_keys(&self) -> bool {
        !self.split_keys.is_empty()
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Total number of records
    pub fn len(&self) -> usize {
        self.shards.iter().map(Shard::len).sum()
    }

    /// Check if the store holds no records
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(Shard::is_empty)
    }

    /// Number of records in shard `i`
    pub fn shard_len(&self, i: usize) -> usize {
        self.shards[i].len()
    }
}

/// Remove and return every key, one shard at a time under its write lock
fn drain_keys(map: &DashMap<Key, Arc<Record>>) -> Vec<Key> {
    let mut keys = Vec::with_capacity(map.len());
    map.retain(|k, _| {
        keys.push(*k);
        false
    });
    keys
}

impl Default for ShardedStore {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl std::fmt::Debug for ShardedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedStore")
            .field("records", &self.len())
            .field("split_keys", &self.split_keys.len())
            .finish()
    }
}
