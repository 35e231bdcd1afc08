//! Epoch coordinator
//!
//! The coordinator owns the global epoch and runs a control thread that
//! advances it. Each advance is a four-point full barrier across all
//! workers:
//!
//! ```text
//! coordinator                         every worker
//! ───────────                         ────────────
//! analyze statistics
//! epoch += 1 ───────────────────────► notices new epoch, merges
//! recv merged(e) from all  ◄───────── send merged(e)            (1)
//! flip split flags
//! send safe(e) to all      ─────────► recv safe(e), replay stash (2)
//! recv done(e) from all    ◄───────── send done(e)              (3)
//! send go(e) to all        ─────────► recv go(e), resume split   (4)
//! ```
//!
//! Split flags only change between points 1 and 2, while every worker is
//! parked, so no transaction ever observes a key mid-flip.
//!
//! # Control loop
//!
//! The control thread reacts to the epoch timer, the early-epoch vote check,
//! and messages from [`Coordinator`] handles (accelerate, advance, mode
//! requests, finish). Only systems that split keys advance epochs.

use crossbeam::channel::{bounded, select, tick, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use phasekv_concurrency::{CandidateTracker, Stat, WorkerStats};
use phasekv_core::{EngineConfig, Key, Tid};
use phasekv_storage::ShardedStore;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::promotion::PromotionPlan;
use crate::request::TxnRegistry;
use crate::worker::{links, CoordinatorLinks, EpochClock, Stop, Worker};

/// Maximum number of workers (the worker id is 8 bits in a commit id)
pub const MAX_WORKERS: usize = 256;

enum Control {
    Accelerate,
    Advance { force: bool, ack: Sender<bool> },
    SetSplit { key: Key, split: bool },
    Finish(Sender<()>),
}

/// Handle to the coordinator and its workers
pub struct Coordinator {
    workers: Vec<Arc<Worker>>,
    store: Arc<ShardedStore>,
    clock: Arc<EpochClock>,
    global: Arc<Mutex<CandidateTracker>>,
    control: Sender<Control>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Create `workers` workers over `store` and start the control thread
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero or larger than [`MAX_WORKERS`].
    pub fn new(
        workers: usize,
        store: Arc<ShardedStore>,
        config: EngineConfig,
        registry: Arc<TxnRegistry>,
    ) -> Self {
        assert!(
            (1..=MAX_WORKERS).contains(&workers),
            "worker count must be between 1 and {}, got {}",
            MAX_WORKERS,
            workers
        );
        let clock = Arc::new(EpochClock::new());
        let mut handles = Vec::with_capacity(workers);
        let mut coordinator_links = Vec::with_capacity(workers);
        let mut stops = Vec::with_capacity(workers);
        let mut tickers = Vec::with_capacity(workers);

        for id in 0..workers {
            let (worker_end, coordinator_end) = links();
            let worker = Arc::new(Worker::new(
                id as u8,
                Arc::clone(&store),
                Arc::clone(&clock),
                Arc::clone(&registry),
                &config,
                worker_end,
            ));
            let (stop_tx, stop_rx) = unbounded();
            let w = Arc::clone(&worker);
            let tick_every = config.worker_tick();
            tickers.push(
                std::thread::Builder::new()
                    .name(format!("phasekv-worker-{}", id))
                    .spawn(move || w.run(tick_every, stop_rx))
                    .unwrap_or_else(|e| panic!("failed to spawn worker ticker: {}", e)),
            );
            handles.push(worker);
            coordinator_links.push(coordinator_end);
            stops.push(stop_tx);
        }

        let global = Arc::new(Mutex::new(CandidateTracker::new(
            config.ratio_threshold,
            config.conflict_weight,
        )));
        let (control, inbox) = unbounded();
        let mut state = ControlLoop {
            workers: handles.clone(),
            links: coordinator_links,
            stops,
            tickers,
            store: Arc::clone(&store),
            clock: Arc::clone(&clock),
            global: Arc::clone(&global),
            requested: FxHashMap::default(),
            attempts: 0,
            coordinate: false,
            config,
        };
        let thread = std::thread::Builder::new()
            .name("phasekv-coordinator".to_string())
            .spawn(move || state.run(inbox))
            .unwrap_or_else(|e| panic!("failed to spawn coordinator: {}", e));

        tracing::info!(workers, "coordinator started");
        Self {
            workers: handles,
            store,
            clock,
            global,
            control,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// All workers
    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    /// Worker `i`
    pub fn worker(&self, i: usize) -> &Arc<Worker> {
        &self.workers[i]
    }

    /// The shared store
    pub fn store(&self) -> &Arc<ShardedStore> {
        &self.store
    }

    /// Current global epoch
    pub fn epoch(&self) -> Tid {
        self.clock.current()
    }

    /// Ask for an immediate epoch advance
    pub fn accelerate(&self) {
        let _ = self.control.send(Control::Accelerate);
    }

    /// Run one epoch attempt on the control thread and wait for it
    ///
    /// Without `force`, the epoch only advances when some key is split or
    /// about to change mode. Returns whether the epoch advanced.
    pub fn increment_epoch(&self, force: bool) -> bool {
        let (ack, done) = bounded(1);
        if self.control.send(Control::Advance { force, ack }).is_err() {
            return false;
        }
        done.recv().unwrap_or(false)
    }

    /// Put `key` in split mode at the next epoch boundary
    pub fn request_split(&self, key: Key) {
        let _ = self.control.send(Control::SetSplit { key, split: true });
    }

    /// Take `key` out of split mode at the next epoch boundary
    pub fn request_unsplit(&self, key: Key) {
        let _ = self.control.send(Control::SetSplit { key, split: false });
    }

    /// Merged statistics for `key` not yet consumed by an analysis
    ///
    /// Every analysis resets the merged tracker, so between epochs this is
    /// `None` for every key.
    pub fn candidate_stat(&self, key: &Key) -> Option<Stat> {
        self.global.lock().get(key)
    }

    /// Sum of all workers' counters
    pub fn stats(&self) -> WorkerStats {
        let mut total = WorkerStats::default();
        for w in &self.workers {
            total.accumulate(&w.stats());
        }
        total
    }

    /// Stop the coordinator and drain every worker
    ///
    /// Runs a final epoch, then has every worker merge and replay its
    /// stash. Blocks until done; later calls return immediately.
    pub fn finish(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        let (ack, done) = bounded(1);
        if self.control.send(Control::Finish(ack)).is_ok() {
            let _ = done.recv();
        }
        if thread.join().is_err() {
            tracing::error!("coordinator thread panicked");
        }
    }

    /// Whether `finish` has completed
    pub fn is_finished(&self) -> bool {
        self.thread.lock().is_none()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.finish();
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("workers", &self.workers.len())
            .field("epoch", &self.epoch())
            .finish()
    }
}

// ============================================================================
// Control thread
// ============================================================================

struct ControlLoop {
    workers: Vec<Arc<Worker>>,
    links: Vec<CoordinatorLinks>,
    stops: Vec<Sender<Stop>>,
    tickers: Vec<JoinHandle<()>>,
    store: Arc<ShardedStore>,
    clock: Arc<EpochClock>,
    config: EngineConfig,
    global: Arc<Mutex<CandidateTracker>>,
    requested: FxHashMap<Key, bool>,
    attempts: u64,
    /// Some key is split or about to be; epochs must keep running
    coordinate: bool,
}

impl ControlLoop {
    fn run(&mut self, inbox: Receiver<Control>) {
        let splits = self.config.system.splits_keys();
        let timer = tick(self.config.epoch_period());
        let trigger_every = (self.config.epoch_period() / 100).max(Duration::from_millis(1));
        let trigger = tick(trigger_every);

        loop {
            select! {
                recv(inbox) -> msg => match msg {
                    Ok(Control::Accelerate) => {
                        if splits {
                            tracing::debug!("accelerating");
                            self.increment_epoch(true);
                        }
                    }
                    Ok(Control::Advance { force, ack }) => {
                        let advanced = splits && self.increment_epoch(force);
                        let _ = ack.send(advanced);
                    }
                    Ok(Control::SetSplit { key, split }) => {
                        self.requested.insert(key, split);
                    }
                    Ok(Control::Finish(ack)) => {
                        self.shutdown();
                        let _ = ack.send(());
                        return;
                    }
                    Err(_) => {
                        self.shutdown();
                        return;
                    }
                },
                recv(timer) -> _ => {
                    if splits {
                        self.increment_epoch(false);
                    }
                }
                recv(trigger) -> _ => {
                    if splits && self.clock.votes() >= self.workers.len() {
                        self.clock.reset_votes();
                        tracing::debug!("all workers voted for an early epoch");
                        self.increment_epoch(true);
                    }
                }
            }
        }
    }

    /// Merge worker statistics and decide mode changes
    ///
    /// Runs on every `analysis_interval`-th attempt; other attempts return an
    /// empty plan and keep the previous coordinate decision.
    fn analyze(&mut self) -> PromotionPlan {
        self.attempts += 1;
        if self.attempts % self.config.analysis_interval != 0 {
            return PromotionPlan::default();
        }
        let mut global = self.global.lock();
        for w in &self.workers {
            w.drain_candidates_into(&mut global);
        }
        for key in self.store.take_lock_candidates() {
            global.record_conflict(key);
        }
        for key in self.store.take_stash_candidates() {
            global.record_stash(key);
        }
        let plan = PromotionPlan::analyze(&mut global, &self.store, &self.config);
        global.reset();
        drop(global);
        self.coordinate = self.store.has_split_keys() || !plan.promote.is_empty();
        plan
    }

    /// One epoch attempt; returns whether the epoch advanced
    fn increment_epoch(&mut self, force: bool) -> bool {
        let mut plan = self.analyze();
        if !self.requested.is_empty() {
            plan.add_requests(std::mem::take(&mut self.requested));
            self.coordinate = true;
        }
        if !self.coordinate && !force && plan.is_empty() {
            return false;
        }

        let next = self.clock.advance();
        tracing::debug!(
            epoch = %next,
            promote = plan.promote.len(),
            demote = plan.demote.len(),
            "advancing epoch"
        );

        // (1) everyone merged
        for (i, l) in self.links.iter().enumerate() {
            expect(i, "merged", l.merged.recv(), next);
        }
        let flipped = plan.apply(&self.store);
        if flipped > 0 {
            tracing::debug!(epoch = %next, flipped, "split flags updated");
        }
        self.clock.reset_votes();

        // (2) safe to read merged values
        for (i, l) in self.links.iter().enumerate() {
            if l.safe.send(next).is_err() {
                tracing::warn!(worker = i, "worker disconnected at safe barrier");
            }
        }
        // (3) everyone replayed
        for (i, l) in self.links.iter().enumerate() {
            expect(i, "done", l.done.recv(), next);
        }
        // (4) resume
        for (i, l) in self.links.iter().enumerate() {
            if l.go.send(next).is_err() {
                tracing::warn!(worker = i, "worker disconnected at go barrier");
            }
        }
        true
    }

    /// Final epoch, then merge everywhere, then replay everywhere
    fn shutdown(&mut self) {
        if self.config.system.splits_keys() {
            self.increment_epoch(true);
        }
        for step in [Stop::Merge as fn(Sender<()>) -> Stop, Stop::Finish] {
            for (i, stop) in self.stops.iter().enumerate() {
                let (ack, done) = bounded(1);
                if stop.send(step(ack)).is_err() || done.recv().is_err() {
                    tracing::warn!(worker = i, "worker ticker gone during shutdown");
                }
            }
        }
        for t in self.tickers.drain(..) {
            if t.join().is_err() {
                tracing::error!("worker ticker panicked");
            }
        }
        tracing::info!(epoch = %self.clock.current(), "coordinator finished");
    }
}

fn expect(worker: usize, point: &str, got: Result<Tid, crossbeam::channel::RecvError>, epoch: Tid) {
    match got {
        Ok(e) if e == epoch => {}
        Ok(e) => panic!(
            "out of alignment at {} barrier: expected {} from worker {}, got {}",
            point, epoch, worker, e
        ),
        Err(_) => tracing::warn!(worker, point, "worker disconnected at barrier"),
    }
}
