//! Workers
//!
//! A worker executes requests one at a time against the shared store and
//! takes part in the epoch protocol. Its state (transaction context, stash
//! queue) sits behind a mutex taken by whoever drives the worker: a
//! submitting thread, the worker's own ticker thread, or briefly the
//! coordinator when it collects contention statistics.
//!
//! # Phases
//!
//! ```text
//!            coordinator bumps the epoch
//!   SPLIT ───────────────────────────────► MERGE   fold local store
//!     ▲                                      │     send merged(e)
//!     │                                      ▼     wait safe(e)
//!     └──────── wait go(e) ◄──── send done(e) ◄── JOIN  replay stash
//! ```
//!
//! A worker notices a new epoch at the start of `submit` or on its ticker,
//! whichever comes first.

use crossbeam::channel::{Receiver, Sender};
use parking_lot::Mutex;
use phasekv_concurrency::{AnyTxn, CandidateTracker, Stat, Transaction, TxnContext, WorkerStats};
use phasekv_core::{EngineConfig, Key, Phase, Tid, TxnError};
use phasekv_storage::ShardedStore;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::request::{Reply, Request, TxnRegistry};

// ============================================================================
// Epoch clock
// ============================================================================

/// The global epoch and the early-epoch vote counter
#[derive(Debug)]
pub struct EpochClock {
    epoch: AtomicU64,
    trigger: AtomicUsize,
}

impl EpochClock {
    /// Start at the first epoch
    pub fn new() -> Self {
        Self {
            epoch: AtomicU64::new(Tid::first_epoch().as_u64()),
            trigger: AtomicUsize::new(0),
        }
    }

    /// Current epoch
    #[inline]
    pub fn current(&self) -> Tid {
        Tid::from_raw(self.epoch.load(Ordering::Acquire))
    }

    /// Move to the next epoch and return it
    pub(crate) fn advance(&self) -> Tid {
        let prev = self.epoch.fetch_add(Tid::EPOCH_INCR, Ordering::AcqRel);
        Tid::from_raw(prev + Tid::EPOCH_INCR)
    }

    /// Vote for an early epoch
    pub(crate) fn vote(&self) -> usize {
        self.trigger.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Votes cast since the last epoch
    pub fn votes(&self) -> usize {
        self.trigger.load(Ordering::Acquire)
    }

    pub(crate) fn reset_votes(&self) {
        self.trigger.store(0, Ordering::Release);
    }
}

impl Default for EpochClock {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Barrier links
// ============================================================================

/// Worker end of the four per-epoch rendezvous
#[derive(Debug)]
pub(crate) struct WorkerLinks {
    pub(crate) merged: Sender<Tid>,
    pub(crate) safe: Receiver<Tid>,
    pub(crate) done: Sender<Tid>,
    pub(crate) go: Receiver<Tid>,
}

/// Coordinator end of the four per-epoch rendezvous
#[derive(Debug)]
pub(crate) struct CoordinatorLinks {
    pub(crate) merged: Receiver<Tid>,
    pub(crate) safe: Sender<Tid>,
    pub(crate) done: Receiver<Tid>,
    pub(crate) go: Sender<Tid>,
}

/// Rendezvous channels for one worker
pub(crate) fn links() -> (WorkerLinks, CoordinatorLinks) {
    use crossbeam::channel::bounded;
    let (merged_tx, merged_rx) = bounded(0);
    let (safe_tx, safe_rx) = bounded(0);
    let (done_tx, done_rx) = bounded(0);
    let (go_tx, go_rx) = bounded(0);
    (
        WorkerLinks {
            merged: merged_tx,
            safe: safe_rx,
            done: done_tx,
            go: go_rx,
        },
        CoordinatorLinks {
            merged: merged_rx,
            safe: safe_tx,
            done: done_rx,
            go: go_tx,
        },
    )
}

/// Shutdown steps sent to a worker's ticker thread
#[derive(Debug)]
pub(crate) enum Stop {
    /// Fold the local store and stop stashing
    Merge(Sender<()>),
    /// Replay the stash and exit
    Finish(Sender<()>),
}

// ============================================================================
// Worker
// ============================================================================

#[derive(Debug)]
struct WorkerState {
    ctx: TxnContext,
    stash: Vec<Request>,
    voted: bool,
}

/// A sequential transaction executor
pub struct Worker {
    id: u8,
    store: Arc<ShardedStore>,
    clock: Arc<EpochClock>,
    registry: Arc<TxnRegistry>,
    stash_trigger: usize,
    splits: bool,
    state: Mutex<WorkerState>,
    links: WorkerLinks,
    stopped: AtomicBool,
}

impl Worker {
    pub(crate) fn new(
        id: u8,
        store: Arc<ShardedStore>,
        clock: Arc<EpochClock>,
        registry: Arc<TxnRegistry>,
        config: &EngineConfig,
        links: WorkerLinks,
    ) -> Self {
        let mut ctx = TxnContext::new(id, config);
        ctx.set_epoch(clock.current());
        Self {
            id,
            store,
            clock,
            registry,
            stash_trigger: config.stash_trigger,
            splits: config.system.splits_keys(),
            state: Mutex::new(WorkerState {
                ctx,
                stash: Vec::new(),
                voted: false,
            }),
            links,
            stopped: AtomicBool::new(false),
        }
    }

    /// Worker id
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Execute one request
    ///
    /// Catches up with the coordinator's epoch first. A request that touches
    /// a split key returns [`TxnError::Stash`]; it is replayed in the join
    /// phase and its reply delivered on the request's completion channel.
    /// Aborts are returned as-is: retrying is the caller's decision.
    pub fn submit(&self, req: Request) -> Reply {
        let mut state = self.state.lock();
        self.catch_up(&mut state);
        self.execute(&mut state, req)
    }

    /// Run the transition protocol if the epoch moved
    fn catch_up(&self, state: &mut WorkerState) {
        if !self.splits || self.stopped.load(Ordering::Acquire) {
            return;
        }
        let epoch = self.clock.current();
        if state.ctx.epoch() != epoch {
            self.transition(state, epoch);
        }
    }

    fn execute(&self, state: &mut WorkerState, req: Request) -> Reply {
        let body = self.registry.get(req.txn);
        let reply = {
            let mut txn = AnyTxn::begin(&self.store, &mut state.ctx);
            let reply = body(&req, &mut txn);
            if reply.is_err() {
                txn.abort();
            }
            reply
        };
        match reply {
            Err(TxnError::Stash) => {
                let phase = state.ctx.phase();
                if phase != Phase::Split {
                    panic!(
                        "worker {} stashed request {} during {} phase",
                        self.id, req.txn, phase
                    );
                }
                state.ctx.stats_mut().stashed += 1;
                state.stash.push(req);
                if !state.voted && state.stash.len() > self.stash_trigger {
                    state.voted = true;
                    let votes = self.clock.vote();
                    tracing::debug!(worker = self.id, votes, "voted for early epoch");
                }
                Err(TxnError::Stash)
            }
            other => other,
        }
    }

    /// Epoch transition: merge, rendezvous, replay, rendezvous
    fn transition(&self, state: &mut WorkerState, epoch: Tid) {
        state.ctx.set_epoch(epoch);
        state.ctx.set_phase(Phase::Merge);
        let merged = state.ctx.merge_local(&self.store);
        tracing::trace!(worker = self.id, %epoch, merged, "merged");

        let start = Instant::now();
        if self.links.merged.send(epoch).is_err() || !self.expect(self.links.safe.recv(), epoch) {
            state.ctx.set_phase(Phase::Split);
            return;
        }
        state.ctx.stats_mut().barrier_wait += start.elapsed();

        state.ctx.set_phase(Phase::Join);
        self.replay(state);

        let start = Instant::now();
        if self.links.done.send(epoch).is_err() || !self.expect(self.links.go.recv(), epoch) {
            state.ctx.set_phase(Phase::Split);
            return;
        }
        state.ctx.stats_mut().barrier_wait += start.elapsed();

        state.ctx.set_phase(Phase::Split);
        state.voted = false;
        state.ctx.stats_mut().epochs += 1;
    }

    /// Check a barrier message; `false` if the coordinator is gone
    fn expect(&self, got: Result<Tid, crossbeam::channel::RecvError>, epoch: Tid) -> bool {
        match got {
            Ok(e) if e == epoch => true,
            Ok(e) => panic!(
                "worker {}: epoch barrier out of alignment, expected {}, got {}",
                self.id, epoch, e
            ),
            Err(_) => {
                tracing::warn!(worker = self.id, %epoch, "coordinator disconnected during epoch barrier");
                false
            }
        }
    }

    /// Re-execute every stashed request and deliver the replies
    fn replay(&self, state: &mut WorkerState) {
        let mut stashed = std::mem::take(&mut state.stash);
        let n = stashed.len();
        for mut req in stashed.drain(..) {
            let completion = req.completion.take();
            let reply = self.execute(state, req);
            if let Some(tx) = completion {
                if tx.send(reply).is_err() {
                    tracing::warn!(worker = self.id, "completion receiver dropped before replay finished");
                }
            }
        }
        state.ctx.stats_mut().replayed += n as u64;
        // keep the allocation
        state.stash = stashed;
    }

    /// Handle one shutdown step
    pub(crate) fn stop(&self, step: &Stop) {
        let mut state = self.state.lock();
        match step {
            Stop::Merge(_) => {
                state.ctx.set_phase(Phase::Merge);
                state.ctx.merge_local(&self.store);
                state.ctx.set_phase(Phase::Join);
            }
            Stop::Finish(_) => {
                state.ctx.set_phase(Phase::Join);
                let pending = state.stash.len();
                self.replay(&mut state);
                self.stopped.store(true, Ordering::Release);
                tracing::debug!(worker = self.id, replayed = pending, "worker finished");
            }
        }
    }

    /// Ticker loop: catch up when idle, handle shutdown
    pub(crate) fn run(self: Arc<Self>, tick_every: std::time::Duration, stop: Receiver<Stop>) {
        let ticker = crossbeam::channel::tick(tick_every);
        loop {
            crossbeam::channel::select! {
                recv(stop) -> msg => {
                    let Ok(step) = msg else { return };
                    self.stop(&step);
                    let (Stop::Merge(ack) | Stop::Finish(ack)) = &step;
                    let _ = ack.send(());
                    if matches!(step, Stop::Finish(_)) {
                        return;
                    }
                }
                recv(ticker) -> _ => {
                    let mut state = self.state.lock();
                    self.catch_up(&mut state);
                }
            }
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Epoch this worker last caught up with
    pub fn epoch(&self) -> Tid {
        self.state.lock().ctx.epoch()
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.state.lock().ctx.phase()
    }

    /// Requests waiting for the next join phase
    pub fn stash_len(&self) -> usize {
        self.state.lock().stash.len()
    }

    /// Counters
    pub fn stats(&self) -> WorkerStats {
        self.state.lock().ctx.stats().clone()
    }

    /// Keys with contention statistics on this worker
    pub fn candidate_count(&self) -> usize {
        self.state.lock().ctx.candidates().len()
    }

    /// Contention statistics for `key` on this worker
    pub fn candidate_stat(&self, key: &Key) -> Option<Stat> {
        self.state.lock().ctx.candidates().get(key)
    }

    /// Keys with pending split-key deltas
    pub fn pending_deltas(&self) -> usize {
        self.state.lock().ctx.local().len()
    }

    /// Move this worker's statistics into `global`
    pub(crate) fn drain_candidates_into(&self, global: &mut CandidateTracker) {
        let mut state = self.state.lock();
        global.merge(state.ctx.candidates());
        state.ctx.candidates_mut().reset();
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Args;
    use phasekv_core::{Value, ValueKind};
    use std::thread;
    use std::time::Duration;

    const INCR: usize = 0;
    const READ: usize = 1;

    fn registry() -> Arc<TxnRegistry> {
        let mut r = TxnRegistry::new();
        r.register(INCR, |req, txn| {
            txn.write_int32(req.args.keys[0], req.args.amount, ValueKind::Sum)?;
            txn.commit()?;
            Ok(None)
        });
        r.register(READ, |req, txn| {
            let v = txn.read(&req.args.keys[0])?;
            txn.commit()?;
            Ok(Some(v))
        });
        Arc::new(r)
    }

    fn key(id: u64) -> Key {
        Key::from_parts(id, 0)
    }

    /// A single worker with the coordinator end of its links
    fn single(config: &EngineConfig) -> (Arc<Worker>, CoordinatorLinks, Arc<EpochClock>) {
        let store = Arc::new(ShardedStore::new(config));
        let clock = Arc::new(EpochClock::new());
        let (wl, cl) = links();
        let worker = Arc::new(Worker::new(0, store, Arc::clone(&clock), registry(), config, wl));
        (worker, cl, clock)
    }

    #[test]
    fn test_clock_advance() {
        let clock = EpochClock::new();
        assert_eq!(clock.current(), Tid::first_epoch());
        let next = clock.advance();
        assert_eq!(next.epoch_number(), 2);
        assert_eq!(clock.current(), next);
        assert_eq!(clock.vote(), 1);
        clock.reset_votes();
        assert_eq!(clock.votes(), 0);
    }

    #[test]
    fn test_submit_executes_in_order() {
        let config = EngineConfig::default();
        let (worker, _cl, _clock) = single(&config);
        worker.store.create_int(key(1), 0, ValueKind::Sum);
        for _ in 0..5 {
            worker.submit(Request::new(INCR, Args::key(key(1)).with_amount(2))).unwrap();
        }
        let v = worker.submit(Request::new(READ, Args::key(key(1)))).unwrap();
        assert_eq!(v, Some(Value::Int(10)));
        assert_eq!(worker.stats().committed, 6);
    }

    #[test]
    fn test_nokey_is_returned() {
        let (worker, _cl, _clock) = single(&EngineConfig::default());
        assert_eq!(
            worker.submit(Request::new(READ, Args::key(key(9)))),
            Err(TxnError::NoKey)
        );
        assert_eq!(worker.stats().aborted, 1);
    }

    #[test]
    fn test_stash_then_replay_through_barrier() {
        let config = EngineConfig::default();
        let (worker, cl, clock) = single(&config);
        let record = worker.store.create_int(key(1), 5, ValueKind::Sum);
        worker.store.set_split(&record, true);

        worker.submit(Request::new(INCR, Args::key(key(1)).with_amount(3))).unwrap();
        let (req, rx) = Request::deferred(READ, Args::key(key(1)));
        assert_eq!(worker.submit(req), Err(TxnError::Stash));
        assert_eq!(worker.stash_len(), 1);

        // drive the coordinator side by hand
        let epoch = clock.advance();
        let w = Arc::clone(&worker);
        let h = thread::spawn(move || {
            w.submit(Request::new(INCR, Args::key(key(2)).with_amount(1)))
        });
        assert_eq!(cl.merged.recv().unwrap(), epoch);
        // merged before the join phase starts
        assert_eq!(record.int_value(), Some(8));
        worker.store.set_split(&record, false);
        cl.safe.send(epoch).unwrap();
        assert_eq!(cl.done.recv().unwrap(), epoch);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(Some(Value::Int(8))));
        cl.go.send(epoch).unwrap();

        // key(2) does not exist
        assert_eq!(h.join().unwrap(), Err(TxnError::NoKey));
        assert_eq!(worker.epoch(), epoch);
        assert_eq!(worker.phase(), Phase::Split);
        assert_eq!(worker.stash_len(), 0);
        let stats = worker.stats();
        assert_eq!(stats.replayed, 1);
        assert_eq!(stats.epochs, 1);
    }

    #[test]
    fn test_stash_vote_once_per_epoch() {
        let config = EngineConfig::default().with_stash_trigger(1);
        let (worker, _cl, clock) = single(&config);
        let record = worker.store.create_int(key(1), 0, ValueKind::Sum);
        worker.store.set_split(&record, true);
        for _ in 0..4 {
            let _ = worker.submit(Request::new(READ, Args::key(key(1))));
        }
        assert_eq!(worker.stash_len(), 4);
        assert_eq!(clock.votes(), 1);
    }

    #[test]
    fn test_two_step_stop_replays_stash() {
        let config = EngineConfig::default();
        let (worker, _cl, _clock) = single(&config);
        let record = worker.store.create_int(key(1), 1, ValueKind::Sum);
        worker.store.set_split(&record, true);
        worker.submit(Request::new(INCR, Args::key(key(1)).with_amount(1))).unwrap();
        let (req, rx) = Request::deferred(READ, Args::key(key(1)));
        assert_eq!(worker.submit(req), Err(TxnError::Stash));

        let (ack, _) = crossbeam::channel::bounded(1);
        worker.stop(&Stop::Merge(ack.clone()));
        assert_eq!(record.int_value(), Some(2));
        worker.stop(&Stop::Finish(ack));
        assert_eq!(rx.recv().unwrap(), Ok(Some(Value::Int(2))));

        // no more stashing once stopped
        let v = worker.submit(Request::new(READ, Args::key(key(1)))).unwrap();
        assert_eq!(v, Some(Value::Int(2)));
    }

    #[test]
    #[should_panic(expected = "unknown transaction code")]
    fn test_unknown_code_panics() {
        let (worker, _cl, _clock) = single(&EngineConfig::default());
        let _ = worker.submit(Request::new(99, Args::default()));
    }
}
