//! Engine configuration
//!
//! Every tunable of the engine lives in [`EngineConfig`] and is passed to the
//! store, workers and coordinator at construction. Nothing is read from
//! process-global state.
//!
//! ```
//! use phasekv_core::{EngineConfig, SystemType};
//!
//! let config = EngineConfig::default()
//!     .with_system(SystemType::Doppel)
//!     .with_epoch_period_ms(20)
//!     .with_ratio_threshold(4.0);
//! assert!(config.validate().is_ok());
//! ```

use crate::error::{ConfigError, ConfigResult};
use crate::types::SystemType;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the store, engines, workers and coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrency strategy
    pub system: SystemType,
    /// Contention ratio above which a key becomes a split candidate
    pub ratio_threshold: f64,
    /// Weight of conflicts relative to writes in the contention ratio
    pub conflict_weight: f64,
    /// Writes a key needs before it may be promoted
    pub min_promotion_writes: f64,
    /// Record statistics on one of every `sample_rate` transactions
    pub sample_rate: u64,
    /// Coordinator timer period
    pub epoch_period_ms: u64,
    /// Run the promotion analysis on every N-th epoch attempt
    pub analysis_interval: u64,
    /// Take the shard read lock on lookups
    pub use_read_locks: bool,
    /// Lock misses before a record becomes a store-level promotion candidate
    pub lock_threshold: u32,
    /// Stashes before a split record becomes a store-level demotion candidate
    pub stash_threshold: u32,
    /// Maximum buffered writes per transaction
    pub write_set_capacity: usize,
    /// Stash queue length at which a worker votes for an early epoch
    pub stash_trigger: usize,
    /// How long the pessimistic engine waits for a record lock before aborting
    pub lock_wait_ms: Option<u64>,
    /// Period of each worker's idle epoch check
    pub worker_tick_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            system: SystemType::Doppel,
            ratio_threshold: 10.0,
            conflict_weight: 1.0,
            min_promotion_writes: 3.0,
            sample_rate: 10_000,
            epoch_period_ms: 80,
            analysis_interval: 10,
            use_read_locks: true,
            lock_threshold: 500,
            stash_threshold: 500,
            write_set_capacity: 128,
            stash_trigger: 100_000,
            lock_wait_ms: Some(10),
            worker_tick_ms: 240,
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document; missing fields take their defaults
    pub fn from_toml_str(s: &str) -> ConfigResult<Self> {
        let config: EngineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Check ranges
    pub fn validate(&self) -> ConfigResult<()> {
        if !(self.ratio_threshold > 0.0) {
            return Err(invalid("ratio_threshold", "must be positive"));
        }
        if !(self.conflict_weight >= 0.0) {
            return Err(invalid("conflict_weight", "must not be negative"));
        }
        if self.sample_rate == 0 {
            return Err(invalid("sample_rate", "must be at least 1"));
        }
        if self.epoch_period_ms == 0 {
            return Err(invalid("epoch_period_ms", "must be at least 1"));
        }
        if self.analysis_interval == 0 {
            return Err(invalid("analysis_interval", "must be at least 1"));
        }
        if self.write_set_capacity == 0 {
            return Err(invalid("write_set_capacity", "must be at least 1"));
        }
        if self.worker_tick_ms == 0 {
            return Err(invalid("worker_tick_ms", "must be at least 1"));
        }
        Ok(())
    }

    /// Coordinator timer period
    pub fn epoch_period(&self) -> Duration {
        Duration::from_millis(self.epoch_period_ms)
    }

    /// Pessimistic lock wait bound
    pub fn lock_wait(&self) -> Option<Duration> {
        self.lock_wait_ms.map(Duration::from_millis)
    }

    /// Worker idle check period
    pub fn worker_tick(&self) -> Duration {
        Duration::from_millis(self.worker_tick_ms)
    }

    /// Set the concurrency strategy
    pub fn with_system(mut self, system: SystemType) -> Self {
        self.system = system;
        self
    }

    /// Set the promotion ratio threshold
    pub fn with_ratio_threshold(mut self, threshold: f64) -> Self {
        self.ratio_threshold = threshold;
        self
    }

    /// Set the conflict weight
    pub fn with_conflict_weight(mut self, weight: f64) -> Self {
        self.conflict_weight = weight;
        self
    }

    /// Set the minimum writes for promotion
    pub fn with_min_promotion_writes(mut self, writes: f64) -> Self {
        self.min_promotion_writes = writes;
        self
    }

    /// Set the statistics sample rate
    pub fn with_sample_rate(mut self, rate: u64) -> Self {
        self.sample_rate = rate;
        self
    }

    /// Set the epoch timer period
    pub fn with_epoch_period_ms(mut self, ms: u64) -> Self {
        self.epoch_period_ms = ms;
        self
    }

    /// Set the analysis interval
    pub fn with_analysis_interval(mut self, every: u64) -> Self {
        self.analysis_interval = every;
        self
    }

    /// Enable or disable shard read locks
    pub fn with_read_locks(mut self, enabled: bool) -> Self {
        self.use_read_locks = enabled;
        self
    }

    /// Set the stash queue length that votes for an early epoch
    pub fn with_stash_trigger(mut self, len: usize) -> Self {
        self.stash_trigger = len;
        self
    }

    /// Set the maximum write-set size
    pub fn with_write_set_capacity(mut self, capacity: usize) -> Self {
        self.write_set_capacity = capacity;
        self
    }

    /// Set the pessimistic lock wait bound (`None` waits forever)
    pub fn with_lock_wait_ms(mut self, ms: Option<u64>) -> Self {
        self.lock_wait_ms = ms;
        self
    }

    /// Set the worker idle check period
    pub fn with_worker_tick_ms(mut self, ms: u64) -> Self {
        self.worker_tick_ms = ms;
        self
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}
