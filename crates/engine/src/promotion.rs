//! Promotion and demotion of hot keys
//!
//! A key is promoted to split mode when it is not split yet, its contention
//! ratio exceeds the threshold and it has seen more than a minimum number of
//! writes. A split key is demoted when its ratio falls below half the
//! threshold. Split keys without any statistics keep their mode.
//!
//! The plan is computed before an epoch advance and applied by the
//! coordinator while every worker is parked at the epoch barrier.

use phasekv_concurrency::CandidateTracker;
use phasekv_core::{EngineConfig, Key};
use phasekv_storage::ShardedStore;
use rustc_hash::FxHashMap;

/// Mode changes for one epoch boundary
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromotionPlan {
    /// Keys entering split mode
    pub promote: Vec<Key>,
    /// Keys leaving split mode
    pub demote: Vec<Key>,
}

impl PromotionPlan {
    /// Decide mode changes from merged statistics
    ///
    /// Drains the tracker's ranking.
    pub fn analyze(global: &mut CandidateTracker, store: &ShardedStore, config: &EngineConfig) -> Self {
        let mut plan = PromotionPlan::default();
        let weight = config.conflict_weight;

        for (key, stat) in global.drain_ranked() {
            let Ok(record) = store.get(&key) else {
                continue;
            };
            let ratio = stat.ratio(weight);
            if record.is_split() {
                tracing::trace!(%key, ratio, "already split");
            } else if ratio > config.ratio_threshold && stat.writes > config.min_promotion_writes {
                tracing::debug!(
                    %key,
                    reads = stat.reads,
                    writes = stat.writes,
                    conflicts = stat.conflicts,
                    ratio,
                    "promoting key"
                );
                plan.promote.push(key);
            } else {
                tracing::trace!(%key, writes = stat.writes, ratio, "not enough writes to promote");
            }
        }

        for key in store.split_keys() {
            match global.get(&key) {
                Some(stat) if stat.ratio(weight) < config.ratio_threshold / 2.0 => {
                    tracing::debug!(%key, ratio = stat.ratio(weight), "demoting key");
                    plan.demote.push(key);
                }
                Some(_) => {}
                None => tracing::trace!(%key, "split key has no statistics"),
            }
        }
        plan
    }

    /// Fold in explicit requests (`true` = split); requests win over analysis
    pub fn add_requests(&mut self, requests: FxHashMap<Key, bool>) {
        for (key, split) in requests {
            self.promote.retain(|k| *k != key);
            self.demote.retain(|k| *k != key);
            if split {
                self.promote.push(key);
            } else {
                self.demote.push(key);
            }
        }
    }

    /// Check if nothing changes
    pub fn is_empty(&self) -> bool {
        self.promote.is_empty() && self.demote.is_empty()
    }

    /// Flip the records' split flags
    ///
    /// Only safe while no transaction is running on any worker. Keys that do
    /// not exist or already have the target mode are skipped. Returns the
    /// number of records flipped.
    pub fn apply(&self, store: &ShardedStore) -> usize {
        let mut flipped = 0;
        for (keys, split) in [(&self.promote, true), (&self.demote, false)] {
            for key in keys {
                match store.get(key) {
                    Ok(record) if record.is_split() != split => {
                        store.set_split(&record, split);
                        flipped += 1;
                    }
                    Ok(_) => {}
                    Err(_) => tracing::warn!(%key, split, "mode change for missing key ignored"),
                }
            }
        }
        flipped
    }
}
