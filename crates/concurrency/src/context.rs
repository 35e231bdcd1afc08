//! Per-worker execution state
//!
//! A [`TxnContext`] belongs to exactly one worker and is only ever touched by
//! the thread currently executing on behalf of that worker. It carries
//! everything a transaction needs besides the shared store: the commit id
//! generator, the local store for split keys, the candidate tracker, the
//! current phase, sampling state, counters, and the read/write buffers
//! reused across transactions.

use phasekv_core::{EngineConfig, Phase, SystemType, Tid};
use phasekv_storage::ShardedStore;
use std::time::Duration;

use crate::candidates::CandidateTracker;
use crate::local_store::LocalStore;
use crate::optimistic::{ReadSlot, WriteSlot};
use crate::pessimistic::Held;

// ============================================================================
// Commit ids
// ============================================================================

/// Per-worker commit id generator
///
/// Ids are unique across workers because the worker id is part of every
/// id, and unique within a worker and epoch because the sequence only
/// grows. No shared counter is touched.
#[derive(Debug, Clone)]
pub struct TidGenerator {
    worker: u8,
    epoch: Tid,
    seq: u64,
    uid: u64,
}

impl TidGenerator {
    /// Start in the first epoch
    pub fn new(worker: u8) -> Self {
        Self {
            worker,
            epoch: Tid::first_epoch(),
            seq: 0,
            uid: 0,
        }
    }

    /// Current epoch
    pub fn epoch(&self) -> Tid {
        self.epoch
    }

    /// Move to `epoch`, restarting the sequence
    pub fn set_epoch(&mut self, epoch: Tid) {
        if epoch != self.epoch {
            self.epoch = epoch.epoch();
            self.seq = 0;
        }
    }

    /// Next commit id in the current epoch
    pub fn commit_tid(&mut self) -> Tid {
        self.seq += 1;
        Tid::pack(self.epoch, self.seq, self.worker)
    }

    /// Next worker-unique id for application rows
    pub fn uid(&mut self) -> u64 {
        self.uid += 1;
        (self.uid << 8) | self.worker as u64
    }
}

// ============================================================================
// Counters
// ============================================================================

/// Worker counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerStats {
    /// Committed transactions
    pub committed: u64,
    /// Aborted transactions
    pub aborted: u64,
    /// Requests deferred to the join phase
    pub stashed: u64,
    /// Stashed requests replayed
    pub replayed: u64,
    /// Commits that failed to lock a record
    pub lock_failures: u64,
    /// Commits that failed read validation
    pub verify_failures: u64,
    /// Transactions that recorded statistics
    pub samples: u64,
    /// Merge passes that folded at least one key
    pub merges: u64,
    /// Epoch transitions completed
    pub epochs: u64,
    /// Time spent waiting at epoch barriers
    pub barrier_wait: Duration,
}

impl WorkerStats {
    /// Add another worker's counters
    pub fn accumulate(&mut self, other: &WorkerStats) {
        self.committed += other.committed;
        self.aborted += other.aborted;
        self.stashed += other.stashed;
        self.replayed += other.replayed;
        self.lock_failures += other.lock_failures;
        self.verify_failures += other.verify_failures;
        self.samples += other.samples;
        self.merges += other.merges;
        self.epochs += other.epochs;
        self.barrier_wait += other.barrier_wait;
    }
}

// ============================================================================
// Context
// ============================================================================

/// Everything a worker owns for executing transactions
#[derive(Debug)]
pub struct TxnContext {
    worker: u8,
    system: SystemType,
    phase: Phase,
    sample_rate: u64,
    countdown: u64,
    pub(crate) sampling: bool,
    pub(crate) write_set_capacity: usize,
    pub(crate) lock_wait: Option<Duration>,
    pub(crate) tids: TidGenerator,
    pub(crate) local: LocalStore,
    pub(crate) candidates: CandidateTracker,
    pub(crate) stats: WorkerStats,
    pub(crate) reads: Vec<ReadSlot>,
    pub(crate) writes: Vec<WriteSlot>,
    pub(crate) held: Vec<Held>,
}

impl TxnContext {
    /// Create the context for worker `worker`
    pub fn new(worker: u8, config: &EngineConfig) -> Self {
        Self {
            worker,
            system: config.system,
            phase: Phase::Split,
            sample_rate: config.sample_rate.max(1),
            countdown: 0,
            sampling: false,
            write_set_capacity: config.write_set_capacity,
            lock_wait: config.lock_wait(),
            tids: TidGenerator::new(worker),
            local: LocalStore::new(),
            candidates: CandidateTracker::new(config.ratio_threshold, config.conflict_weight),
            stats: WorkerStats::default(),
            reads: Vec::with_capacity(config.write_set_capacity),
            writes: Vec::with_capacity(config.write_set_capacity),
            held: Vec::new(),
        }
    }

    /// Owning worker
    pub fn worker(&self) -> u8 {
        self.worker
    }

    /// Concurrency strategy
    pub fn system(&self) -> SystemType {
        self.system
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Enter `phase`
    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    /// Epoch the worker is executing in
    pub fn epoch(&self) -> Tid {
        self.tids.epoch()
    }

    /// Adopt the coordinator's epoch
    pub fn set_epoch(&mut self, epoch: Tid) {
        self.tids.set_epoch(epoch);
    }

    /// Whether the current transaction records statistics
    pub fn is_sampling(&self) -> bool {
        self.sampling
    }

    /// Pending split-key deltas
    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    /// This worker's contention statistics
    pub fn candidates(&self) -> &CandidateTracker {
        &self.candidates
    }

    /// Mutable access to the contention statistics
    pub fn candidates_mut(&mut self) -> &mut CandidateTracker {
        &mut self.candidates
    }

    /// Counters
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Mutable counters
    pub fn stats_mut(&mut self) -> &mut WorkerStats {
        &mut self.stats
    }

    /// Fold the local store into the shared store
    ///
    /// Merged records are stamped with a fresh commit id of the current
    /// epoch. Returns the number of keys merged.
    pub fn merge_local(&mut self, store: &ShardedStore) -> usize {
        if self.local.is_empty() {
            return 0;
        }
        let tid = self.tids.commit_tid();
        let merged = self.local.merge(store, tid);
        self.stats.merges += 1;
        merged
    }

    /// Reset per-transaction state and decide whether to sample
    ///
    /// Statistics are only gathered when keys can be split, on one
    /// transaction out of every `sample_rate`.
    pub(crate) fn begin(&mut self) {
        self.reads.clear();
        self.writes.clear();
        debug_assert!(self.held.is_empty(), "locks leaked from a previous transaction");
        self.held.clear();

        self.sampling = false;
        if !self.system.splits_keys() {
            return;
        }
        if self.countdown == 0 {
            self.sampling = true;
            self.countdown = self.sample_rate - 1;
            self.stats.samples += 1;
        } else {
            self.countdown -= 1;
        }
    }
}
