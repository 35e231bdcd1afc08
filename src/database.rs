//! Main entry point for phasekv
//!
//! [`PhaseKv`] owns the store, the workers and the coordinator. Build one
//! with [`PhaseKv::builder`], registering every transaction body up front.

use crate::error::{Error, Result};
use phasekv_concurrency::{Transaction, WorkerStats};
use phasekv_core::{EngineConfig, Key, Phase, Tid, Value, ValueKind};
use phasekv_engine::{Coordinator, Reply, Request, TxnCode, TxnRegistry, Worker, MAX_WORKERS};
use phasekv_storage::ShardedStore;
use std::sync::Arc;
use std::time::Duration;

/// A running engine
///
/// # Example
///
/// ```
/// use phasekv::prelude::*;
///
/// const INCR: TxnCode = 0;
///
/// let db = PhaseKv::builder()
///     .workers(2)
///     .config(EngineConfig::default().with_epoch_period_ms(3_600_000))
///     .register(INCR, |req, txn| {
///         txn.write_int32(req.args.keys[0], req.args.amount, ValueKind::Sum)?;
///         txn.commit()?;
///         Ok(None)
///     })
///     .open()?;
///
/// let key = Key::from_parts(7, 0);
/// db.create_int(key, 0, ValueKind::Sum);
/// db.submit(0, Request::new(INCR, Args::key(key).with_amount(5)))?;
/// assert_eq!(db.get(&key)?, Value::Int(5));
/// db.finish();
/// # Ok::<(), phasekv::Error>(())
/// ```
pub struct PhaseKv {
    coordinator: Coordinator,
    config: EngineConfig,
}

impl PhaseKv {
    /// Create a builder with default settings
    pub fn builder() -> PhaseKvBuilder {
        PhaseKvBuilder::new()
    }

    /// Run `req` on worker `worker`
    ///
    /// A deferred request reports [`Error::Deferred`]; its final reply is
    /// delivered on the request's completion channel, if any.
    pub fn submit(&self, worker: usize, req: Request) -> Result<Option<Value>> {
        self.submit_raw(worker, req)?.map_err(Error::from)
    }

    /// Run `req` on worker `worker`, keeping the engine-level outcome
    pub fn submit_raw(&self, worker: usize, req: Request) -> Result<Reply> {
        let worker = self.worker_handle(worker)?;
        if self.coordinator.is_finished() {
            return Err(Error::Closed);
        }
        Ok(worker.submit(req))
    }

    /// Run `req`, retrying aborts up to `attempts` times in total
    ///
    /// Sleeps `backoff` multiplied by the attempt number between tries.
    pub fn submit_with_retry(
        &self,
        worker: usize,
        req: Request,
        attempts: usize,
        backoff: Duration,
    ) -> Result<Option<Value>> {
        let mut attempt = 1;
        loop {
            match self.submit(worker, req.clone()) {
                Err(e) if e.is_retryable() && attempt < attempts => {
                    tracing::trace!(worker, attempt, "retrying aborted request");
                    std::thread::sleep(backoff * attempt as u32);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Create `key` with `initial` if it does not exist yet
    pub fn create(&self, key: Key, initial: Value, kind: ValueKind) {
        self.coordinator.store().create(key, initial, kind);
    }

    /// Create an integer key if it does not exist yet
    pub fn create_int(&self, key: Key, value: i32, kind: ValueKind) {
        self.coordinator.store().create_int(key, value, kind);
    }

    /// Committed global value of `key`
    ///
    /// Deltas of split keys still held by workers are not included.
    pub fn get(&self, key: &Key) -> Result<Value> {
        let record = self.coordinator.store().get(key)?;
        Ok(record.value())
    }

    /// Whether `key` is currently in split mode
    pub fn is_split(&self, key: &Key) -> Result<bool> {
        Ok(self.coordinator.store().get(key)?.is_split())
    }

    /// Run one epoch attempt; see [`Coordinator::increment_epoch`]
    pub fn increment_epoch(&self, force: bool) -> bool {
        self.coordinator.increment_epoch(force)
    }

    /// Put `key` in split mode at the next epoch boundary
    pub fn request_split(&self, key: Key) {
        self.coordinator.request_split(key);
    }

    /// Take `key` out of split mode at the next epoch boundary
    pub fn request_unsplit(&self, key: Key) {
        self.coordinator.request_unsplit(key);
    }

    /// Current global epoch
    pub fn epoch(&self) -> Tid {
        self.coordinator.epoch()
    }

    /// Phase of worker `worker`
    pub fn phase(&self, worker: usize) -> Result<Phase> {
        Ok(self.worker_handle(worker)?.phase())
    }

    /// Counters summed over all workers
    pub fn stats(&self) -> WorkerStats {
        self.coordinator.stats()
    }

    /// Number of workers
    pub fn worker_count(&self) -> usize {
        self.coordinator.workers().len()
    }

    /// Active configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The coordinator, for direct access to workers and the store
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// The shared store
    pub fn store(&self) -> &Arc<ShardedStore> {
        self.coordinator.store()
    }

    /// Stop the engine, merging and replaying all outstanding work
    ///
    /// Afterwards every committed delta is in the global store. Later calls
    /// are no-ops.
    pub fn finish(&self) {
        self.coordinator.finish();
    }

    fn worker_handle(&self, worker: usize) -> Result<&Arc<Worker>> {
        self.coordinator.workers().get(worker).ok_or_else(|| {
            Error::Config(format!(
                "worker {} out of range (have {})",
                worker,
                self.worker_count()
            ))
        })
    }
}

impl std::fmt::Debug for PhaseKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseKv")
            .field("system", &self.config.system)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

/// Builder for a [`PhaseKv`]
///
/// # Example
///
/// ```
/// use phasekv::prelude::*;
///
/// let db = PhaseKv::builder()
///     .workers(4)
///     .config(EngineConfig::default().with_system(SystemType::Occ))
///     .open()?;
/// assert_eq!(db.worker_count(), 4);
/// # Ok::<(), phasekv::Error>(())
/// ```
pub struct PhaseKvBuilder {
    workers: usize,
    config: EngineConfig,
    registry: TxnRegistry,
}

impl PhaseKvBuilder {
    /// Create a builder with one worker and default configuration
    pub fn new() -> Self {
        Self {
            workers: 1,
            config: EngineConfig::default(),
            registry: TxnRegistry::new(),
        }
    }

    /// Builder with configuration parsed from TOML
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(Self::new().config(EngineConfig::from_toml_str(s)?))
    }

    /// Number of workers (1 to 256)
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Replace the configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a transaction body under `code`
    pub fn register<F>(mut self, code: TxnCode, body: F) -> Self
    where
        F: Fn(&Request, &mut dyn Transaction) -> Reply + Send + Sync + 'static,
    {
        self.registry.register(code, body);
        self
    }

    /// Use a prepared registry, replacing anything registered so far
    pub fn registry(mut self, registry: TxnRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Validate the configuration and start the engine
    pub fn open(self) -> Result<PhaseKv> {
        self.config.validate()?;
        if !(1..=MAX_WORKERS).contains(&self.workers) {
            return Err(Error::Config(format!(
                "worker count must be between 1 and {}, got {}",
                MAX_WORKERS, self.workers
            )));
        }
        tracing::info!(
            system = ?self.config.system,
            workers = self.workers,
            transactions = self.registry.len(),
            "opening engine"
        );
        let store = Arc::new(ShardedStore::new(&self.config));
        let coordinator = Coordinator::new(
            self.workers,
            store,
            self.config.clone(),
            Arc::new(self.registry),
        );
        Ok(PhaseKv {
            coordinator,
            config: self.config,
        })
    }
}

impl Default for PhaseKvBuilder {
    fn default() -> Self {
        Self::new()
    }
}
