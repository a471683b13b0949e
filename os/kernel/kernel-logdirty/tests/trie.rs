use kernel_alloc::FramePool;
use kernel_info::logdirty::MAX_READ_FRAMES;
use kernel_logdirty::{LogDirty, LogDirtyError};
use kernel_memory_addresses::{Gfn, Mfn};
use std::sync::{Arc, Barrier};
use std::thread;

fn pool(frames: usize) -> FramePool {
    FramePool::new(Mfn::new(0x20_0000), frames).unwrap()
}

#[test]
fn mark_twice_then_harvest() {
    let pool = pool(16);
    let ld = LogDirty::new(3, &pool, &pool);
    ld.enable().unwrap();
    ld.mark_dirty(Gfn::new(5));
    ld.mark_dirty(Gfn::new(5));
    assert_eq!(ld.stats().dirty_count, 1);

    let bm = ld.read_range(Gfn::new(0), 64, true).unwrap();
    assert!(bm.is_set(5));
    assert_eq!(bm.count_dirty(), 1);
    assert_eq!(ld.stats().dirty_count, 0);
    assert!(!ld.is_dirty(Gfn::new(5)));
}

#[test]
fn read_without_clear_is_idempotent() {
    let pool = pool(16);
    let ld = LogDirty::new(0, &pool, &pool);
    ld.enable().unwrap();
    for pfn in [0, 63, 64, 32_767, 32_768, 40_000] {
        ld.mark_dirty(Gfn::new(pfn));
    }
    let a = ld.read_range(Gfn::new(0), 50_000, false).unwrap();
    let b = ld.read_range(Gfn::new(0), 50_000, false).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.count_dirty(), 6);
    assert_eq!(ld.stats().dirty_count, 6);
}

#[test]
fn unaligned_range_across_leaves() {
    let pool = pool(16);
    let ld = LogDirty::new(0, &pool, &pool);
    ld.enable().unwrap();
    let dirty = [32_760u64, 32_767, 32_768, 32_800, 65_600];
    for pfn in dirty {
        ld.mark_dirty(Gfn::new(pfn));
    }

    let begin = 32_755;
    let nr = 65_700 - begin;
    let bm = ld.read_range(Gfn::new(begin), nr, false).unwrap();
    for i in 0..nr {
        let expect = dirty.contains(&(begin + i));
        assert_eq!(bm.is_set(i), expect, "bit {i} (pfn {})", begin + i);
    }
    let got: Vec<u64> = bm.iter_dirty().map(Gfn::as_u64).collect();
    assert_eq!(got, dirty);
}

#[test]
fn clearing_a_subrange_decrements_exactly() {
    let pool = pool(16);
    let ld = LogDirty::new(0, &pool, &pool);
    ld.enable().unwrap();
    for pfn in 100..110 {
        ld.mark_dirty(Gfn::new(pfn));
    }

    let bm = ld.read_range(Gfn::new(103), 3, true).unwrap();
    assert_eq!(bm.count_dirty(), 3);
    assert_eq!(ld.stats().dirty_count, 7);
    assert!(ld.is_dirty(Gfn::new(102)));
    assert!(!ld.is_dirty(Gfn::new(104)));
    assert!(ld.is_dirty(Gfn::new(106)));
}

#[test]
fn clean_fast_path_returns_zeros() {
    let pool = pool(16);
    let ld = LogDirty::new(0, &pool, &pool);
    ld.enable().unwrap();
    let bm = ld.read_range(Gfn::new(7), 1000, false).unwrap();
    assert_eq!(bm.len(), 1000);
    assert_eq!(bm.count_dirty(), 0);
    assert_eq!(pool.allocated(), 0);
}

#[test]
fn allocation_failure_is_sticky_until_teardown() {
    let pool = pool(16);
    let ld = LogDirty::new(0, &pool, &pool);
    ld.enable().unwrap();
    pool.fail_after(2);
    ld.mark_dirty(Gfn::new(1));
    pool.clear_failures();
    ld.mark_dirty(Gfn::new(2));

    assert_eq!(ld.stats().failed_allocs, 1);
    assert_eq!(
        ld.read_range(Gfn::new(0), 8, false),
        Err(LogDirtyError::OutOfMemory { failed: 1 })
    );
    assert!(matches!(ld.peek(8), Err(LogDirtyError::OutOfMemory { .. })));

    ld.teardown();
    assert_eq!(ld.stats().failed_allocs, 0);
    assert_eq!(pool.allocated(), 0);
    ld.mark_dirty(Gfn::new(2));
    assert!(ld.read_range(Gfn::new(0), 8, false).unwrap().is_set(2));
}

#[test]
fn peek_and_clean_report_statistics() {
    let pool = pool(16);
    let ld = LogDirty::new(0, &pool, &pool);
    ld.enable().unwrap();
    ld.note_fault();
    ld.note_fault();
    ld.mark_dirty(Gfn::new(10));
    ld.mark_dirty(Gfn::new(100_000));

    let (bm, stats) = ld.peek(64).unwrap();
    assert!(bm.is_set(10));
    assert_eq!(stats.fault_count, 2);
    assert_eq!(stats.dirty_count, 2);

    // clean covers only the first 64 frames but resets the whole bitmap
    let (bm, stats) = ld.clean(64).unwrap();
    assert!(bm.is_set(10));
    assert_eq!(stats.dirty_count, 2);
    assert_eq!(ld.stats().dirty_count, 0);
    assert_eq!(ld.stats().fault_count, 0);
    assert!(!ld.is_dirty(Gfn::new(100_000)));
}

#[test]
fn teardown_is_idempotent_and_frees_everything() {
    let pool = pool(32);
    let ld = LogDirty::new(0, &pool, &pool);
    ld.enable().unwrap();
    for pfn in [0u64, 1 << 15, 1 << 24, 1 << 33, (1 << 42) - 1] {
        ld.mark_dirty(Gfn::new(pfn));
    }
    assert_eq!(ld.stats().dirty_count, 5);
    assert_eq!(pool.allocated() as u64, ld.stats().allocs);

    ld.teardown();
    ld.teardown();
    assert_eq!(pool.allocated(), 0);
    assert_eq!(pool.live_mappings(), 0);
    assert!(ld.is_enabled());

    ld.disable();
    assert!(!ld.is_enabled());
    assert_eq!(pool.allocated(), 0);
}

#[test]
fn out_of_range_read_is_rejected() {
    let pool = pool(4);
    let ld = LogDirty::new(0, &pool, &pool);
    ld.enable().unwrap();
    assert!(matches!(
        ld.read_range(Gfn::new(1 << 42), 1, false),
        Err(LogDirtyError::RangeOutOfBounds { .. })
    ));
    assert!(matches!(
        ld.read_range(Gfn::INVALID, 2, false),
        Err(LogDirtyError::RangeOutOfBounds { .. })
    ));
}

#[test]
fn oversized_read_is_rejected_before_allocating() {
    let pool = pool(4);
    let ld = LogDirty::new(0, &pool, &pool);
    ld.enable().unwrap();
    ld.mark_dirty(Gfn::new(3));
    assert_eq!(
        ld.read_range(Gfn::new(0), 1 << 42, false),
        Err(LogDirtyError::RangeOutOfBounds { begin: Gfn::new(0), nr: 1 << 42 })
    );
    assert!(matches!(
        ld.read_range(Gfn::new(0), MAX_READ_FRAMES + 1, true),
        Err(LogDirtyError::RangeOutOfBounds { .. })
    ));
    // nothing was cleared by the refused reads
    assert!(ld.is_dirty(Gfn::new(3)));
    assert_eq!(ld.stats().dirty_count, 1);
}

#[test]
fn clearing_read_resets_the_fault_count() {
    let pool = pool(8);
    let ld = LogDirty::new(0, &pool, &pool);
    ld.enable().unwrap();
    ld.note_fault();
    ld.mark_dirty(Gfn::new(0x10));

    let bm = ld.read_range(Gfn::new(0), 0x100, false).unwrap();
    assert!(bm.is_set(0x10));
    assert_eq!(ld.stats().fault_count, 1);

    ld.read_range(Gfn::new(0), 0x100, true).unwrap();
    let stats = ld.stats();
    assert_eq!((stats.fault_count, stats.dirty_count), (0, 0));

    // a second harvest with nothing written finds an idle trie
    let bm = ld.read_range(Gfn::new(0), 0x100, true).unwrap();
    assert_eq!(bm.count_dirty(), 0);
    assert_eq!(ld.stats(), stats);
}

#[test]
fn concurrent_marks_count_each_frame_once() {
    const THREADS: usize = 4;
    let pool = Arc::new(pool(16));
    let ld = LogDirty::new(0, &*pool, &*pool);
    ld.enable().unwrap();
    let barrier = Barrier::new(THREADS);

    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                barrier.wait();
                for pfn in 0..1000 {
                    ld.mark_dirty(Gfn::new(pfn * 3));
                }
            });
        }
    });

    assert_eq!(ld.stats().dirty_count, 1000);
    let bm = ld.read_range(Gfn::new(0), 3000, true).unwrap();
    assert_eq!(bm.count_dirty(), 1000);
    assert_eq!(ld.stats().dirty_count, 0);
}
