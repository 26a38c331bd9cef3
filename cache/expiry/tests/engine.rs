//! End-to-end tests against a running timer thread.
//!
//! These drive the engine through its public surface only: objects are
//! inserted with real (short) lifetimes and the tests observe reference
//! counts, flags, and counters as the thread does its work.

use expiry::{Clock, Expiry, ExpiryError, ManualClock, NOIDX, ObjCore, Timers};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Poll until `cond` holds, failing the test after a generous timeout.
fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn expire_round_trip() {
    let engine = Expiry::new();
    let domain = engine.new_domain(false);
    let _thread = engine.spawn();

    let oc = ObjCore::new(1, domain);
    *oc.timers() = Timers::new(engine.wall(), 0.05, 0.0, 0.0);
    engine.insert(&oc);

    wait_for("the object to expire", || engine.counters().n_expired == 1);

    assert!(oc.is_dying());
    assert_eq!(oc.timer_idx(), NOIDX);
    assert!(engine.lru(domain).unwrap().is_empty());

    // The engine's reference is released; the creator's is the last one.
    wait_for("the engine reference to drop", || oc.refcnt() == 1);
    assert!(oc.drop_ref());

    engine.stop();
}

#[test]
fn rearm_to_kill_skips_the_expired_count() {
    let engine = Expiry::new();
    let domain = engine.new_domain(false);
    let _thread = engine.spawn();

    let oc = ObjCore::new(2, domain);
    *oc.timers() = Timers::new(engine.wall(), 60.0, 0.0, 0.0);
    engine.insert(&oc);
    wait_for("the object to be scheduled", || {
        engine.lru(domain).unwrap().len() == 1
    });

    // The object becomes invalid (purged); signal the kill through a
    // cleared timer set.
    oc.timers().clear();
    engine.rearm(&oc);

    wait_for("the kill to be processed", || oc.refcnt() == 1);
    assert_eq!(oc.timer_idx(), NOIDX);
    assert!(oc.is_dying());
    assert_eq!(engine.counters().n_expired, 0);
    assert!(engine.lru(domain).unwrap().is_empty());
    assert!(oc.drop_ref());

    engine.stop();
}

#[test]
fn nuke_reclaims_until_nothing_is_eligible() {
    let engine = Expiry::new();
    let domain = engine.new_domain(false);
    let _thread = engine.spawn();

    let far = engine.wall() + 3600.0;

    // The pinned object sits at the head; the scan must pass it over.
    let pinned = ObjCore::new(10, domain);
    pinned.add_ref();
    engine.inject(Arc::clone(&pinned), far);

    let mut victims = Vec::new();
    for xid in 11..=13 {
        let oc = ObjCore::new(xid, domain);
        engine.inject(Arc::clone(&oc), far);
        victims.push(oc);
    }
    wait_for("all objects to reach the LRU", || {
        engine.lru(domain).unwrap().len() == 4
    });

    for expected in &victims {
        engine.nuke_one(domain).unwrap();
        assert!(expected.is_dying());
    }
    assert_eq!(engine.nuke_one(domain), Err(ExpiryError::CannotReclaim));
    assert!(!pinned.is_dying());
    assert_eq!(engine.counters().n_lru_nuked, 3);

    wait_for("the victims to be torn down", || {
        victims.iter().all(|oc| oc.refcnt() == 0)
    });
    assert!(victims.iter().all(|oc| oc.timer_idx() == NOIDX));
    assert_eq!(engine.lru(domain).unwrap().len(), 1);
    assert_eq!(engine.counters().n_expired, 0);

    engine.stop();
}

#[test]
fn touch_reorders_and_counts() {
    let engine = Expiry::new();
    let domain = engine.new_domain(false);
    let _thread = engine.spawn();

    let far = engine.wall() + 3600.0;
    let a = ObjCore::new(20, domain);
    let b = ObjCore::new(21, domain);
    engine.inject(Arc::clone(&a), far);
    engine.inject(Arc::clone(&b), far);
    wait_for("both objects to reach the LRU", || {
        engine.lru(domain).unwrap().len() == 2
    });

    assert!(engine.touch(&a));
    assert_eq!(engine.counters().n_lru_moved, 1);

    // A touched head is now the freshest entry, so pressure takes b first.
    engine.nuke_one(domain).unwrap();
    assert!(b.is_dying());
    assert!(!a.is_dying());

    engine.stop();
}

#[test]
fn manual_clock_drives_the_thread() {
    let clock = Arc::new(ManualClock::new(100.0));
    let engine = Expiry::builder()
        .clock(Arc::clone(&clock) as Arc<dyn Clock>)
        .build();
    let domain = engine.new_domain(false);
    let _thread = engine.spawn();

    let oc = ObjCore::new(30, domain);
    engine.inject(Arc::clone(&oc), 110.0);
    wait_for("the object to be scheduled", || {
        engine.lru(domain).unwrap().len() == 1
    });

    // Nothing fires while the clock stands still.
    thread::sleep(Duration::from_millis(20));
    assert_eq!(engine.counters().n_expired, 0);

    clock.set(110.001);
    engine.kick();
    wait_for("the deadline to fire", || engine.counters().n_expired == 1);
    assert_eq!(oc.refcnt(), 0);

    engine.stop();
}

#[test]
fn concurrent_touch_and_rearm_stay_consistent() {
    let engine = Expiry::new();
    let domain = engine.new_domain(false);
    let _thread = engine.spawn();

    let now = engine.wall();
    let mut cores = Vec::new();
    for xid in 100..108 {
        let oc = ObjCore::new(xid, domain);
        *oc.timers() = Timers::new(now, 60.0, 0.0, 0.0);
        engine.insert(&oc);
        cores.push(oc);
    }
    let cores = Arc::new(cores);

    let mut handles = Vec::new();
    for worker in 0..3u64 {
        let engine = engine.clone();
        let cores = Arc::clone(&cores);
        handles.push(thread::spawn(move || {
            for i in 0..200u64 {
                let oc = &cores[((worker * 7 + i) % 8) as usize];
                if i % 3 == 0 {
                    // Nudge the deadline around; the engine reconciles
                    // concurrent moves through the mailbox.
                    oc.timers().ttl = 60.0 + ((i % 7) as f64) * 0.013;
                    engine.rearm(oc);
                } else {
                    engine.touch(oc);
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // Quiesce, then kill everything and verify the books balance.
    wait_for("the mailbox to drain", || engine.backlog() == 0);
    for oc in cores.iter() {
        oc.timers().clear();
        engine.rearm(oc);
    }
    wait_for("all objects to be torn down", || {
        cores.iter().all(|oc| oc.refcnt() == 1)
    });
    wait_for("the LRU to empty", || engine.lru(domain).unwrap().is_empty());

    for oc in cores.iter() {
        assert!(oc.is_off_lru());
        assert_eq!(oc.timer_idx(), NOIDX);
        assert!(oc.drop_ref());
    }
    assert_eq!(engine.counters().n_expired, 0);

    engine.stop();
}
