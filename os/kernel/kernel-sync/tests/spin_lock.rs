use kernel_sync::SpinLock;
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn guard_releases_on_drop() {
    let l = SpinLock::new(vec![0u64; 4]);
    {
        let mut used = l.lock();
        used[1] |= 1 << 7;
        assert!(l.is_locked());
        assert!(l.try_lock().is_none());
    }
    assert!(!l.is_locked());
    assert_eq!(l.try_lock().map(|used| used[1]), Some(1 << 7));
}

#[test]
fn get_mut_needs_no_locking() {
    let mut l = SpinLock::new(3u32);
    *l.get_mut() += 1;
    assert!(!l.is_locked());
    assert_eq!(*l.lock(), 4);
}

#[test]
fn concurrent_bit_claims_are_exclusive() {
    const THREADS: usize = 8;
    const CLAIMS: usize = 64;

    let words = Arc::new(SpinLock::new(vec![0u64; THREADS * CLAIMS / 64]));
    let start = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let words = Arc::clone(&words);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                let mut claimed = Vec::with_capacity(CLAIMS);
                for _ in 0..CLAIMS {
                    let mut w = words.lock();
                    let (i, word) = w
                        .iter_mut()
                        .enumerate()
                        .find(|(_, word)| **word != u64::MAX)
                        .unwrap();
                    let bit = word.trailing_ones();
                    *word |= 1 << bit;
                    claimed.push(i * 64 + bit as usize);
                    drop(w);
                    thread::yield_now();
                }
                claimed
            })
        })
        .collect();

    let mut all: Vec<usize> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), THREADS * CLAIMS);
    assert!(words.lock().iter().all(|w| *w == u64::MAX));
}

#[test]
fn unwinding_releases_the_lock() {
    let l = SpinLock::new(0u32);
    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        let mut g = l.lock();
        *g = 9;
        panic!("node allocation failed");
    }));
    assert!(res.is_err());
    assert!(!l.is_locked());
    assert_eq!(*l.lock(), 9);
}
