//! Contention statistics for hot-key detection
//!
//! Every worker owns a [`CandidateTracker`] and feeds it from sampled
//! transactions. The coordinator periodically merges all of them into one
//! tracker and ranks keys by contention ratio:
//!
//! ```text
//! ratio = (writes + conflict_weight * conflicts) / reads
//! ```
//!
//! The numbers are approximate by construction (sampled, reset after every
//! analysis) and only steer promotion/demotion. Correctness never depends on
//! them.
//!
//! # Design
//!
//! Keys above the threshold are kept in a max-heap. Changing a key's counters
//! pushes a fresh heap entry stamped with a new generation; entries whose
//! generation no longer matches the key's current one are skipped when the
//! heap is drained (lazy deletion).

use phasekv_core::Key;
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Counters for one key
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Stat {
    /// Observed reads (including stashes)
    pub reads: f64,
    /// Observed writes
    pub writes: f64,
    /// Observed lock or validation conflicts
    pub conflicts: f64,
}

impl Stat {
    // A freshly observed key starts biased so the ratio is always defined.
    const FIRST_READ: Stat = Stat { reads: 2.0, writes: 1.0, conflicts: 1.0 };
    const FIRST_WRITE: Stat = Stat { reads: 1.0, writes: 2.0, conflicts: 1.0 };
    const FIRST_CONFLICT: Stat = Stat { reads: 1.0, writes: 1.0, conflicts: 2.0 };

    /// Contention ratio
    pub fn ratio(&self, conflict_weight: f64) -> f64 {
        (self.writes + conflict_weight * self.conflicts) / self.reads
    }

    fn add(&mut self, other: &Stat) {
        self.reads += other.reads;
        self.writes += other.writes;
        self.conflicts += other.conflicts;
    }
}

#[derive(Debug)]
struct Slot {
    stat: Stat,
    generation: u64,
}

#[derive(Debug)]
struct Ranked {
    ratio: f64,
    key: Key,
    generation: u64,
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ratio
            .total_cmp(&other.ratio)
            .then_with(|| other.key.cmp(&self.key))
            .then_with(|| self.generation.cmp(&other.generation))
    }
}

enum Observation {
    Read,
    Write,
    Conflict,
}

/// Per-key contention counters with a ranking of above-threshold keys
#[derive(Debug)]
pub struct CandidateTracker {
    stats: FxHashMap<Key, Slot>,
    heap: BinaryHeap<Ranked>,
    threshold: f64,
    conflict_weight: f64,
    generation: u64,
}

impl CandidateTracker {
    /// Create an empty tracker
    pub fn new(threshold: f64, conflict_weight: f64) -> Self {
        Self {
            stats: FxHashMap::default(),
            heap: BinaryHeap::new(),
            threshold,
            conflict_weight,
            generation: 0,
        }
    }

    /// Count a read of `key`
    pub fn record_read(&mut self, key: Key) {
        self.observe(key, Observation::Read);
    }

    /// Count a write of `key`
    pub fn record_write(&mut self, key: Key) {
        self.observe(key, Observation::Write);
    }

    /// Count a lock or validation conflict on `key`
    pub fn record_conflict(&mut self, key: Key) {
        self.observe(key, Observation::Conflict);
    }

    /// Count a transaction deferred because `key` is split
    ///
    /// A stash is a read that could not be served, so it lowers the ratio
    /// and pushes split keys toward demotion.
    pub fn record_stash(&mut self, key: Key) {
        self.observe(key, Observation::Read);
    }

    fn observe(&mut self, key: Key, what: Observation) {
        let stat = match self.stats.get_mut(&key) {
            Some(slot) => {
                match what {
                    Observation::Read => slot.stat.reads += 1.0,
                    Observation::Write => slot.stat.writes += 1.0,
                    Observation::Conflict => slot.stat.conflicts += 1.0,
                }
                slot.stat
            }
            None => {
                let stat = match what {
                    Observation::Read => Stat::FIRST_READ,
                    Observation::Write => Stat::FIRST_WRITE,
                    Observation::Conflict => Stat::FIRST_CONFLICT,
                };
                self.stats.insert(key, Slot { stat, generation: 0 });
                stat
            }
        };
        self.rank(key, stat);
    }

    /// Push `key` on the heap if it is above the threshold
    fn rank(&mut self, key: Key, stat: Stat) {
        let ratio = stat.ratio(self.conflict_weight);
        if ratio > self.threshold {
            self.generation += 1;
            let generation = self.generation;
            if let Some(slot) = self.stats.get_mut(&key) {
                slot.generation = generation;
            }
            self.heap.push(Ranked { ratio, key, generation });
        }
    }

    /// Add another tracker's counters into this one
    pub fn merge(&mut self, other: &CandidateTracker) {
        for (key, theirs) in &other.stats {
            let stat = {
                let slot = self.stats.entry(*key).or_insert(Slot {
                    stat: Stat::default(),
                    generation: 0,
                });
                slot.stat.add(&theirs.stat);
                slot.stat
            };
            self.rank(*key, stat);
        }
    }

    /// Counters for `key`
    pub fn get(&self, key: &Key) -> Option<Stat> {
        self.stats.get(key).map(|slot| slot.stat)
    }

    /// Contention ratio for `key`
    pub fn ratio(&self, key: &Key) -> Option<f64> {
        self.get(key).map(|s| s.ratio(self.conflict_weight))
    }

    /// Above-threshold keys, highest ratio first, each once
    ///
    /// Empties the ranking; the counters stay.
    pub fn drain_ranked(&mut self) -> Vec<(Key, Stat)> {
        let mut out = Vec::new();
        while let Some(top) = self.heap.pop() {
            match self.stats.get(&top.key) {
                Some(slot)
                    if slot.generation == top.generation
                        && slot.stat.ratio(self.conflict_weight) > self.threshold =>
                {
                    out.push((top.key, slot.stat));
                }
                _ => {}
            }
        }
        out
    }

    /// Forget everything
    pub fn reset(&mut self) {
        self.stats.clear();
        self.heap.clear();
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.stats.len()
    }

    /// Check if no key is tracked
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// Promotion threshold
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Conflict weight
    pub fn conflict_weight(&self) -> f64 {
        self.conflict_weight
    }
}
