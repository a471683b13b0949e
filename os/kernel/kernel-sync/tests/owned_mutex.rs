use kernel_sync::OwnedMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn guard_reports_owner_and_unlocks() {
    let m = OwnedMutex::new(5u32);
    {
        let mut g = m.lock(3);
        assert_eq!(g.owner(), 3);
        assert!(m.locked_by(3));
        assert!(!m.locked_by(4));
        *g += 1;
    }
    assert!(!m.is_locked());
    assert_eq!(*m.lock(4), 6);
}

#[test]
fn try_lock_fails_for_other_owner() {
    let m = OwnedMutex::new(());
    let g = m.try_lock(1);
    assert!(g.is_some());
    assert!(m.try_lock(2).is_none());
    drop(g);
    assert!(m.try_lock(2).is_some());
}

#[test]
fn recursive_lock_panics_instead_of_deadlocking() {
    let m = OwnedMutex::new(0u8);
    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        let _outer = m.lock(7);
        let _inner = m.lock(7);
    }));
    assert!(res.is_err(), "expected recursive acquisition to panic");

    // the outer guard was dropped during unwinding
    assert!(!m.is_locked());
}

#[test]
fn recursive_try_lock_panics() {
    let m = OwnedMutex::new(0u8);
    let _g = m.lock(1);
    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| m.try_lock(1).is_some()));
    assert!(res.is_err());
}

#[test]
fn contended_owners_are_mutually_exclusive() {
    let threads = 6;
    let iters = 2_000;

    let m = Arc::new(OwnedMutex::new(0usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|cpu| {
            let m = Arc::clone(&m);
            let in_cs = Arc::clone(&in_cs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                let cpu = u32::try_from(cpu).unwrap();
                start.wait();
                for _ in 0..iters {
                    let mut g = m.lock(cpu);
                    assert_eq!(in_cs.fetch_add(1, Ordering::SeqCst), 0);
                    *g += 1;
                    in_cs.fetch_sub(1, Ordering::SeqCst);
                    drop(g);
                    thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*m.lock(0), threads * iters);
}
