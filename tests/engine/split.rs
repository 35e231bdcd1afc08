//! Split keys: local deltas, stashing, replay and mode changes

use crate::common::*;
use phasekv::prelude::*;
use std::time::Duration;

fn doppel(workers: usize) -> PhaseKv {
    open(workers, quiet(SystemType::Doppel))
}

fn split(db: &PhaseKv, k: Key) {
    db.request_split(k);
    assert!(db.increment_epoch(true));
    assert!(db.is_split(&k).unwrap());
}

fn pending(db: &PhaseKv) -> usize {
    db.coordinator().workers().iter().map(|w| w.pending_deltas()).sum()
}

// ============================================================================
// Isolation
// ============================================================================

#[test]
fn split_writes_stay_local_until_the_epoch_ends() {
    let db = doppel(2);
    let k = key(1);
    db.create_int(k, 10, ValueKind::Sum);
    split(&db, k);

    for _ in 0..5 {
        db.submit(0, incr(k, 2)).unwrap();
    }
    db.submit(1, incr(k, 1)).unwrap();

    assert_eq!(int(&db, k), 10);
    assert_eq!(pending(&db), 2);

    assert!(db.increment_epoch(true));
    assert_eq!(int(&db, k), 21);
    assert_eq!(pending(&db), 0);
    assert!(db.is_split(&k).unwrap());
}

#[test]
fn read_of_split_key_is_replayed_against_the_merged_value() {
    let db = doppel(2);
    let k = key(2);
    db.create_int(k, 0, ValueKind::Sum);
    split(&db, k);

    for _ in 0..5 {
        db.submit(0, incr(k, 1)).unwrap();
    }

    let (req, reply) = Request::deferred(READ, Args::key(k));
    let err = db.submit(1, req).unwrap_err();
    assert!(err.is_deferred());
    assert_eq!(db.coordinator().worker(1).stash_len(), 1);
    assert!(reply.try_recv().is_err());

    assert!(db.increment_epoch(true));
    assert_eq!(reply.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(Some(Value::Int(5))));
    assert_eq!(db.coordinator().worker(1).stash_len(), 0);

    let stats = db.stats();
    assert_eq!(stats.stashed, 1);
    assert_eq!(stats.replayed, 1);
}

#[test]
fn stash_without_completion_is_still_replayed() {
    let db = doppel(1);
    let (k, copy) = (key(3), key(4));
    db.create_int(k, 1, ValueKind::Sum);
    db.create(copy, Value::Int(0), ValueKind::Write);
    split(&db, k);
    db.submit(0, incr(k, 4)).unwrap();

    let req = Request::new(COPY, Args::keys([k, copy]));
    assert!(db.submit(0, req).unwrap_err().is_deferred());
    assert_eq!(db.get(&copy).unwrap(), Value::Int(0));

    assert!(db.increment_epoch(true));
    assert_eq!(db.get(&copy).unwrap(), Value::Int(5));
}

#[test]
fn finish_merges_and_replays_everything() {
    let db = doppel(3);
    let k = key(5);
    db.create_int(k, 0, ValueKind::Sum);
    split(&db, k);

    hammer(&db, k, 100);
    let (req, reply) = Request::deferred(READ, Args::key(k));
    assert!(db.submit(2, req).unwrap_err().is_deferred());

    db.finish();
    assert_eq!(int(&db, k), 300);
    // the final epoch replays with every delta merged
    assert_eq!(reply.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(Some(Value::Int(300))));
    assert_eq!(pending(&db), 0);
}

#[test]
fn max_and_list_merge_across_workers() {
    let db = doppel(2);
    let (item, bids) = (key(6), key(7));
    db.create_int(item, 0, ValueKind::Max);
    db.create(bids, Value::List(Vec::new()), ValueKind::List);
    db.request_split(item);
    db.request_split(bids);
    assert!(db.increment_epoch(true));

    for (w, amount) in [(0, 30), (1, 70), (0, 50), (1, 10)] {
        let args = Args::keys([item, bids]).with_amount(amount).with_id(amount as u64);
        db.submit(w, Request::new(BID, args)).unwrap();
    }
    assert_eq!(int(&db, item), 0);

    assert!(db.increment_epoch(true));
    assert_eq!(int(&db, item), 70);
    let orders: Vec<i64> = db.get(&bids).unwrap().as_list().unwrap().iter().map(|e| e.order).collect();
    assert_eq!(orders, vec![70, 50, 30, 10]);
}

// ============================================================================
// Mode changes
// ============================================================================

#[test]
fn split_and_unsplit_are_reversible() {
    let db = doppel(2);
    let k = key(8);
    db.create_int(k, 0, ValueKind::Sum);

    for round in 1..=3 {
        split(&db, k);
        db.submit(0, incr(k, 1)).unwrap();

        db.request_unsplit(k);
        assert!(db.increment_epoch(true));
        assert!(!db.is_split(&k).unwrap());
        assert_eq!(int(&db, k), round * 2 - 1);

        db.submit(1, incr(k, 1)).unwrap();
        assert_eq!(int(&db, k), round * 2);
    }
    assert!(!db.store().has_split_keys());
}

#[test]
fn hot_key_is_promoted_and_cold_key_demoted() {
    let config = quiet(SystemType::Doppel)
        .with_ratio_threshold(2.0)
        .with_conflict_weight(100.0)
        .with_min_promotion_writes(20.0);
    let db = open(1, config);
    let k = key(9);
    db.create_int(k, 0, ValueKind::Sum);

    // (51 + 100 * 1) / 51 after the biased first observation
    for _ in 0..50 {
        db.submit(0, incr(k, 1)).unwrap();
    }
    assert!(db.increment_epoch(false));
    assert!(db.is_split(&k).unwrap());

    // readers only: every read is stashed
    let mut replies = Vec::new();
    for _ in 0..200 {
        let (req, reply) = Request::deferred(READ, Args::key(k));
        assert!(db.submit(0, req).unwrap_err().is_deferred());
        replies.push(reply);
    }
    assert!(db.increment_epoch(false));
    assert!(!db.is_split(&k).unwrap());
    for reply in replies {
        assert_eq!(reply.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(Some(Value::Int(50))));
    }
}

#[test]
fn quiet_engine_does_not_advance_without_force() {
    let db = doppel(2);
    let k = key(10);
    db.create_int(k, 0, ValueKind::Sum);
    db.submit(0, incr(k, 1)).unwrap();

    let before = db.epoch();
    assert!(!db.increment_epoch(false));
    assert_eq!(db.epoch(), before);
    assert!(db.increment_epoch(true));
    assert_eq!(db.epoch(), before.next_epoch());
}

// ============================================================================
// End to end
// ============================================================================

#[test]
fn hot_counter_through_split_and_unsplit() {
    let db = doppel(4);
    let k = key(11);
    db.create_int(k, 0, ValueKind::Sum);

    hammer(&db, k, 250);
    assert_eq!(int(&db, k), 1_000);

    split(&db, k);
    for w in db.coordinator().workers() {
        assert!(w.candidate_stat(&k).is_none());
    }

    hammer(&db, k, 250);
    assert_eq!(int(&db, k), 1_000);
    assert_eq!(pending(&db), 4);

    db.request_unsplit(k);
    assert!(db.increment_epoch(true));
    assert!(!db.is_split(&k).unwrap());
    assert_eq!(int(&db, k), 2_000);
    for w in db.coordinator().workers() {
        assert!(w.candidate_stat(&k).is_none());
    }

    hammer(&db, k, 250);
    assert!(db.increment_epoch(true));
    assert_eq!(int(&db, k), 3_000);

    hammer(&db, k, 250);
    db.finish();
    assert_eq!(int(&db, k), 4_000);
    assert_eq!(db.stats().committed, 4_000);
    assert_eq!(db.epoch().epoch_number(), 5);
}

#[test]
fn hot_counter_with_epochs_racing_the_writers() {
    let db = doppel(4);
    let k = key(12);
    db.create_int(k, 0, ValueKind::Sum);

    std::thread::scope(|s| {
        for w in 0..4 {
            let db = &db;
            s.spawn(move || {
                for _ in 0..1_000 {
                    run(db, w, incr(k, 1)).unwrap();
                }
            });
        }
        let db = &db;
        s.spawn(move || {
            db.request_split(k);
            db.increment_epoch(true);
            std::thread::sleep(Duration::from_millis(5));
            db.request_unsplit(k);
            db.increment_epoch(true);
            std::thread::sleep(Duration::from_millis(5));
            db.increment_epoch(true);
        });
    });

    db.finish();
    assert_eq!(int(&db, k), 4_000);
    assert!(!db.is_split(&k).unwrap());
}

#[test]
fn hot_counter_promoted_and_demoted_by_statistics() {
    let config = quiet(SystemType::Doppel)
        .with_ratio_threshold(0.5)
        .with_min_promotion_writes(20.0);
    let db = open(4, config);
    let k = key(13);
    db.create_int(k, 0, ValueKind::Sum);
    let untracked = |db: &PhaseKv| {
        db.coordinator().candidate_stat(&k).is_none()
            && db.coordinator().workers().iter().all(|w| w.candidate_stat(&k).is_none())
    };

    // epoch 1: every increment reads and writes, ratio stays near 1
    hammer(&db, k, 250);
    assert_eq!(int(&db, k), 1_000);
    assert!(db.increment_epoch(true));
    assert!(db.is_split(&k).unwrap());
    assert!(untracked(&db));

    // epoch 2: 1000 local writes against 5000 stashed reads, ratio near 0.2
    hammer(&db, k, 250);
    assert_eq!(int(&db, k), 1_000);
    let mut replies = Vec::new();
    for w in 0..4 {
        for _ in 0..1_250 {
            let (req, reply) = Request::deferred(READ, Args::key(k));
            assert!(db.submit(w, req).unwrap_err().is_deferred());
            replies.push(reply);
        }
    }
    assert!(db.increment_epoch(true));
    assert!(!db.is_split(&k).unwrap());
    assert_eq!(int(&db, k), 2_000);
    assert!(db.coordinator().candidate_stat(&k).is_none());
    for reply in replies {
        assert_eq!(reply.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(Some(Value::Int(2_000))));
    }

    // epoch 3
    hammer(&db, k, 250);
    assert!(db.increment_epoch(true));
    assert_eq!(int(&db, k), 3_000);
    assert!(db.coordinator().candidate_stat(&k).is_none());

    hammer(&db, k, 250);
    db.finish();
    assert_eq!(int(&db, k), 4_000);
    assert_eq!(db.epoch().epoch_number(), 5);
}

proptest::proptest! {
    #![proptest_config(proptest::prelude::ProptestConfig::with_cases(16))]

    #[test]
    fn prop_split_deltas_sum_to_sequential_total(
        ops in proptest::collection::vec((0usize..3, -50i32..50, proptest::bool::weighted(0.1)), 1..60),
    ) {
        let db = doppel(3);
        let k = key(13);
        db.create_int(k, 0, ValueKind::Sum);
        split(&db, k);

        let mut expected = 0;
        for (w, amount, advance) in ops {
            db.submit(w, incr(k, amount)).unwrap();
            expected += amount;
            if advance {
                db.increment_epoch(true);
            }
        }
        db.finish();
        proptest::prop_assert_eq!(int(&db, k), expected);
    }
}
