//! The epoch protocol under the coordinator's own timers

use crate::common::*;
use phasekv::prelude::*;
use std::time::{Duration, Instant};

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn timer_advances_epochs_while_some_workers_idle() {
    let config = quiet(SystemType::Doppel)
        .with_epoch_period_ms(5)
        .with_worker_tick_ms(1);
    let db = open(4, config);
    let k = key(1);
    db.create_int(k, 0, ValueKind::Sum);
    db.request_split(k);

    let start = db.epoch().epoch_number();
    std::thread::scope(|s| {
        // workers 2 and 3 never submit; their tickers keep the barrier moving
        for w in 0..2 {
            let db = &db;
            s.spawn(move || {
                for _ in 0..2_000 {
                    run(db, w, incr(k, 1)).unwrap();
                }
            });
        }
        wait_for("five epochs", || db.epoch().epoch_number() >= start + 5);
    });

    db.finish();
    assert_eq!(int(&db, k), 4_000);
    for w in db.coordinator().workers() {
        assert_eq!(w.epoch(), db.epoch());
        assert!(w.stats().epochs >= 5);
    }
}

#[test]
fn idle_engine_without_split_keys_stays_in_its_epoch() {
    let config = quiet(SystemType::Doppel).with_epoch_period_ms(2);
    let db = open(2, config);
    let before = db.epoch();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(db.epoch(), before);
}

#[test]
fn stashed_requests_vote_for_an_early_epoch() {
    // timer far away; the vote check runs every second
    let config = quiet(SystemType::Doppel)
        .with_epoch_period_ms(100_000)
        .with_stash_trigger(2);
    let db = open(1, config);
    let k = key(2);
    db.create_int(k, 7, ValueKind::Sum);
    db.request_split(k);
    assert!(db.increment_epoch(true));
    let epoch = db.epoch();

    let mut replies = Vec::new();
    for _ in 0..3 {
        let (req, reply) = Request::deferred(READ, Args::key(k));
        assert!(db.submit(0, req).unwrap_err().is_deferred());
        replies.push(reply);
    }

    for reply in replies {
        assert_eq!(reply.recv_timeout(Duration::from_secs(10)).unwrap(), Ok(Some(Value::Int(7))));
    }
    assert!(db.epoch().epoch_number() > epoch.epoch_number());
}

#[test]
fn accelerate_forces_an_epoch() {
    let db = open(2, quiet(SystemType::Doppel));
    let before = db.epoch().epoch_number();
    db.coordinator().accelerate();
    wait_for("accelerated epoch", || db.epoch().epoch_number() > before);
    wait_for("workers caught up", || {
        db.coordinator().workers().iter().all(|w| w.epoch() == db.epoch() && w.phase() == Phase::Split)
    });
}

#[test]
fn phases_return_to_split_after_each_epoch() {
    let db = open(3, quiet(SystemType::Doppel));
    for _ in 0..10 {
        assert!(db.increment_epoch(true));
        for w in 0..3 {
            assert_eq!(db.phase(w).unwrap(), Phase::Split);
        }
    }
    assert_eq!(db.epoch().epoch_number(), 11);
    assert_eq!(db.stats().epochs, 30);
}

#[test]
fn finished_workers_stay_out_of_split() {
    let db = open(2, quiet(SystemType::Doppel));
    let k = key(3);
    db.create_int(k, 0, ValueKind::Sum);
    db.request_split(k);
    assert!(db.increment_epoch(true));
    db.submit(0, incr(k, 2)).unwrap();
    db.finish();

    assert_eq!(int(&db, k), 2);
    for w in 0..2 {
        assert_eq!(db.phase(w).unwrap(), Phase::Join);
    }
    assert!(matches!(db.submit(0, incr(k, 1)), Err(Error::Closed)));
    assert!(!db.increment_epoch(true));
}
