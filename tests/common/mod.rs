//! Shared helpers for integration tests

#![allow(dead_code)]

use phasekv::prelude::*;
use std::sync::Once;

pub const INCR: TxnCode = 0;
pub const READ: TxnCode = 1;
pub const TRANSFER: TxnCode = 2;
pub const UPSERT: TxnCode = 3;
pub const WRITE_THEN_READ: TxnCode = 4;
pub const BID: TxnCode = 5;
pub const COPY: TxnCode = 6;

/// Configuration with the epoch timer effectively off
///
/// Epochs only advance when a test asks for one. Every transaction is
/// sampled; no key is promoted or demoted automatically.
pub fn quiet(system: SystemType) -> EngineConfig {
    EngineConfig::default()
        .with_system(system)
        .with_epoch_period_ms(3_600_000)
        .with_worker_tick_ms(2)
        .with_analysis_interval(1)
        .with_sample_rate(1)
        .with_ratio_threshold(1e-9)
        .with_min_promotion_writes(1e12)
}

pub fn key(id: u64) -> Key {
    Key::from_parts(id, 0)
}

/// Builder with every test transaction registered
pub fn builder(workers: usize, config: EngineConfig) -> PhaseKvBuilder {
    PhaseKv::builder()
        .workers(workers)
        .config(config)
        .register(INCR, |req, txn| {
            txn.write_int32(req.args.keys[0], req.args.amount, ValueKind::Sum)?;
            txn.commit()?;
            Ok(None)
        })
        .register(READ, |req, txn| {
            let v = txn.read(&req.args.keys[0])?;
            txn.commit()?;
            Ok(Some(v))
        })
        .register(TRANSFER, |req, txn| {
            let (from, to) = (req.args.keys[0], req.args.keys[1]);
            txn.maybe_write(&from);
            txn.maybe_write(&to);
            let a = txn.read(&from)?.as_int().unwrap_or(0);
            let b = txn.read(&to)?.as_int().unwrap_or(0);
            if a < req.args.amount {
                return Err(TxnError::NoRetry);
            }
            txn.write(from, Value::Int(a - req.args.amount), ValueKind::Write);
            txn.write(to, Value::Int(b + req.args.amount), ValueKind::Write);
            txn.commit()?;
            Ok(None)
        })
        .register(UPSERT, |req, txn| {
            let k = req.args.keys[0];
            let payload = req.args.payload.clone().unwrap_or(Value::Null);
            match txn.read(&k) {
                Ok(_) | Err(TxnError::NoKey) => {}
                Err(e) => return Err(e),
            }
            txn.write(k, payload.clone(), ValueKind::Write);
            txn.commit()?;
            Ok(Some(payload))
        })
        .register(WRITE_THEN_READ, |req, txn| {
            let k = req.args.keys[0];
            txn.write(k, Value::Int(req.args.amount), ValueKind::Write);
            let seen = txn.read(&k)?;
            txn.commit()?;
            Ok(Some(seen))
        })
        .register(BID, |req, txn| {
            let item = req.args.keys[0];
            txn.write_int32(item, req.args.amount, ValueKind::Max)?;
            let top = Entry::new(req.args.amount as i64, key(req.args.ids[0]), 0);
            txn.write_list(req.args.keys[1], top);
            txn.commit()?;
            Ok(None)
        })
        .register(COPY, |req, txn| {
            let v = txn.read(&req.args.keys[0])?;
            txn.write(req.args.keys[1], v.clone(), ValueKind::Write);
            txn.commit()?;
            Ok(Some(v))
        })
}

/// Route engine warnings to the test harness
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::WARN)
            .try_init();
    });
}

pub fn open(workers: usize, config: EngineConfig) -> PhaseKv {
    init_tracing();
    builder(workers, config).open().expect("engine opens")
}

/// Submit until the request does not abort
pub fn run(db: &PhaseKv, worker: usize, req: Request) -> Result<Option<Value>> {
    for _ in 0..100_000 {
        match db.submit(worker, req.clone()) {
            Err(e) if e.is_retryable() => std::thread::yield_now(),
            other => return other,
        }
    }
    panic!("request kept aborting on worker {}", worker);
}

pub fn incr(k: Key, amount: i32) -> Request {
    Request::new(INCR, Args::key(k).with_amount(amount))
}

pub fn read(k: Key) -> Request {
    Request::new(READ, Args::key(k))
}

pub fn int(db: &PhaseKv, k: Key) -> i32 {
    db.get(&k).expect("key exists").as_int().expect("integer value")
}

/// `per_worker` increments of `k` from one thread per worker
pub fn hammer(db: &PhaseKv, k: Key, per_worker: usize) {
    std::thread::scope(|s| {
        for w in 0..db.worker_count() {
            s.spawn(move || {
                for _ in 0..per_worker {
                    let reply = run(db, w, incr(k, 1));
                    assert!(reply.is_ok(), "increment failed: {:?}", reply);
                }
            });
        }
    });
}
