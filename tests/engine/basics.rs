//! Transaction semantics shared by all strategies

use crate::common::*;
use phasekv::prelude::*;
use rand::Rng;

const SYSTEMS: [SystemType; 3] = [SystemType::Doppel, SystemType::Occ, SystemType::Locking];

// ============================================================================
// Missing keys
// ============================================================================

#[test]
fn read_missing_key_then_create() {
    for system in SYSTEMS {
        let db = open(1, quiet(system));
        let k = key(1);

        let err = db.submit(0, read(k)).unwrap_err();
        assert!(err.is_not_found(), "{:?}: {:?}", system, err);

        let payload = Value::Opaque(b"hello".to_vec());
        let reply = db
            .submit(0, Request::new(UPSERT, Args::key(k).with_payload(payload.clone())))
            .unwrap();
        assert_eq!(reply, Some(payload.clone()));
        assert_eq!(db.submit(0, read(k)).unwrap(), Some(payload));
        db.finish();
    }
}

#[test]
fn increment_of_missing_key_is_not_found() {
    for system in SYSTEMS {
        let db = open(1, quiet(system));
        let err = db.submit(0, incr(key(9), 1)).unwrap_err();
        assert!(err.is_not_found(), "{:?}: {:?}", system, err);
        assert!(db.get(&key(9)).unwrap_err().is_not_found());
        assert_eq!(db.stats().committed, 0);
    }
}

// ============================================================================
// Single-transaction semantics
// ============================================================================

#[test]
fn transaction_reads_its_own_write() {
    for system in SYSTEMS {
        let db = open(1, quiet(system));
        let k = key(2);
        db.create(k, Value::Int(1), ValueKind::Write);

        let seen = db
            .submit(0, Request::new(WRITE_THEN_READ, Args::key(k).with_amount(42)))
            .unwrap();
        assert_eq!(seen, Some(Value::Int(42)), "{:?}", system);
        assert_eq!(db.get(&k).unwrap(), Value::Int(42));

        // same on a key that did not exist before the write
        let fresh = key(3);
        let seen = db
            .submit(0, Request::new(WRITE_THEN_READ, Args::key(fresh).with_amount(7)))
            .unwrap();
        assert_eq!(seen, Some(Value::Int(7)), "{:?}", system);
        assert_eq!(db.get(&fresh).unwrap(), Value::Int(7));
    }
}

#[test]
fn rejected_transaction_leaves_no_trace() {
    for system in SYSTEMS {
        let db = open(1, quiet(system));
        let (a, b) = (key(10), key(11));
        db.create(a, Value::Int(5), ValueKind::Write);
        db.create(b, Value::Int(0), ValueKind::Write);

        let req = Request::new(TRANSFER, Args::keys([a, b]).with_amount(50));
        let err = db.submit(0, req).unwrap_err();
        assert!(matches!(err, Error::Rejected(_)), "{:?}: {:?}", system, err);
        assert_eq!(db.get(&a).unwrap(), Value::Int(5));
        assert_eq!(db.get(&b).unwrap(), Value::Int(0));
        assert_eq!(db.stats().aborted, 1);
    }
}

#[test]
fn commit_versions_carry_the_epoch() {
    let db = open(2, quiet(SystemType::Occ));
    let k = key(4);
    db.create_int(k, 0, ValueKind::Sum);
    db.submit(1, incr(k, 1)).unwrap();

    let version = db.store().get(&k).unwrap().version();
    assert_eq!(version.epoch(), db.epoch());
    assert_eq!(version.worker(), 1);
    assert!(!db.store().get(&k).unwrap().is_locked());
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn concurrent_sums_are_atomic() {
    for system in SYSTEMS {
        let db = open(4, quiet(system));
        let k = key(5);
        db.create_int(k, 0, ValueKind::Sum);

        hammer(&db, k, 500);
        db.finish();

        assert_eq!(int(&db, k), 4 * 500, "{:?}", system);
        let stats = db.stats();
        assert_eq!(stats.committed, 4 * 500);
    }
}

#[test]
fn transfers_preserve_the_total() {
    for system in SYSTEMS {
        let db = open(4, quiet(system));
        let accounts: Vec<Key> = (0..4).map(|i| key(100 + i)).collect();
        for k in &accounts {
            db.create(*k, Value::Int(1_000), ValueKind::Write);
        }

        std::thread::scope(|s| {
            for w in 0..4 {
                let accounts = &accounts;
                let db = &db;
                s.spawn(move || {
                    let mut rng = rand::thread_rng();
                    for _ in 0..300 {
                        let from = rng.gen_range(0..4);
                        let to = (from + rng.gen_range(1..4)) % 4;
                        let amount = rng.gen_range(1..=5);
                        let args = Args::keys([accounts[from], accounts[to]]).with_amount(amount);
                        let req = Request::new(TRANSFER, args);
                        match run(db, w, req) {
                            Ok(_) | Err(Error::Rejected(_)) => {}
                            Err(e) => panic!("{:?}: transfer failed: {}", system, e),
                        }
                    }
                });
            }
        });

        let total: i32 = accounts.iter().map(|k| int(&db, *k)).sum();
        assert_eq!(total, 4_000, "{:?}", system);
        for k in &accounts {
            assert!(!db.store().get(k).unwrap().is_locked());
        }
    }
}

#[test]
fn bids_keep_max_and_ordered_list() {
    for system in SYSTEMS {
        let db = open(2, quiet(system));
        let (item, bids) = (key(20), key(21));
        db.create_int(item, 0, ValueKind::Max);
        db.create(bids, Value::List(Vec::new()), ValueKind::List);

        std::thread::scope(|s| {
            for w in 0..2 {
                let db = &db;
                s.spawn(move || {
                    for amount in (w as i32 * 50)..(w as i32 * 50 + 50) {
                        let args = Args::keys([item, bids]).with_amount(amount).with_id(amount as u64);
                        run(db, w, Request::new(BID, args)).unwrap();
                    }
                });
            }
        });

        assert_eq!(int(&db, item), 99, "{:?}", system);
        let list = db.get(&bids).unwrap();
        let orders: Vec<i64> = list.as_list().unwrap().iter().map(|e| e.order).collect();
        assert_eq!(orders.len(), 100);
        assert!(orders.windows(2).all(|p| p[0] >= p[1]), "{:?}", system);
        assert_eq!(orders[0], 99);
    }
}

#[test]
fn locking_never_advances_epochs() {
    let db = open(2, quiet(SystemType::Locking));
    let k = key(30);
    db.create_int(k, 0, ValueKind::Sum);
    db.request_split(k);
    let before = db.epoch();

    assert!(!db.increment_epoch(true));
    assert_eq!(db.epoch(), before);
    assert!(!db.is_split(&k).unwrap());
    db.submit(0, incr(k, 3)).unwrap();
    assert_eq!(int(&db, k), 3);
}
