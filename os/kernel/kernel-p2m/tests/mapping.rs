mod common;

use common::{Event, Recorder, pool};
use kernel_memory_addresses::{Gfn, Mfn, PageOrder};
use kernel_p2m::{
    CpuContext, LookupMode, MemoryType, NoHooks, P2m, P2mAccess, P2mConfig, P2mError, P2mType, Rwx, Translation,
};

const Q: LookupMode = LookupMode::Query;

fn g(v: u64) -> Gfn {
    Gfn::new(v)
}

fn m(v: u64) -> Mfn {
    Mfn::new(v)
}

#[test]
fn map_and_look_up_a_frame() {
    let pool = pool(256);
    let p2m = P2m::new(P2mConfig::new(1), &pool, &pool, NoHooks).unwrap();
    let mut cpu = CpuContext::new(0);

    p2m.set_entry(&mut cpu, g(0x1000), m(0x2000), 0, P2mType::RamRw, P2mAccess::RWX)
        .unwrap();

    let t = p2m.get_entry(&mut cpu, g(0x1000), Q).unwrap();
    assert_eq!(
        t,
        Translation {
            mfn: m(0x2000),
            p2m_type: P2mType::RamRw,
            access: P2mAccess::RWX,
            order: PageOrder::Size4K,
            mapped: true,
        }
    );

    let (e, order) = p2m.entry_content(g(0x1000)).unwrap();
    assert_eq!(order, PageOrder::Size4K);
    assert_eq!(e.rwx(), Rwx::ALL);
    assert_eq!(e.memory_type(), MemoryType::RAM);
    assert!(!e.sp());
    assert_eq!(p2m.max_mapped_pfn(), Some(g(0x1000)));
}

#[test]
fn small_page_inside_a_superpage() {
    let pool = pool(256);
    let p2m = P2m::new(P2mConfig::new(1), &pool, &pool, NoHooks).unwrap();
    let mut cpu = CpuContext::new(0);

    p2m.set_entry(&mut cpu, g(0), m(0x10000), 9, P2mType::RamRw, P2mAccess::RW)
        .unwrap();
    p2m.set_entry(&mut cpu, g(0x10), m(0x10010), 0, P2mType::RamRo, P2mAccess::R)
        .unwrap();

    let t0 = p2m.get_entry(&mut cpu, g(0), Q).unwrap();
    assert_eq!((t0.mfn, t0.p2m_type, t0.access), (m(0x10000), P2mType::RamRw, P2mAccess::RW));
    let t10 = p2m.get_entry(&mut cpu, g(0x10), Q).unwrap();
    assert_eq!((t10.mfn, t10.p2m_type, t10.access), (m(0x10010), P2mType::RamRo, P2mAccess::R));
    let last = p2m.get_entry(&mut cpu, g(0x1ff), Q).unwrap();
    assert_eq!((last.mfn, last.order), (m(0x101ff), PageOrder::Size4K));

    let (e, _) = p2m.entry_content(g(0x10)).unwrap();
    assert_eq!(e.rwx(), Rwx::R);
    assert_eq!(p2m.stats().splits, 1);
}

#[test]
fn bad_parameters_change_nothing() {
    let pool = pool(256);
    let p2m = P2m::new(P2mConfig::new(1).with_hap_1gb(false), &pool, &pool, NoHooks).unwrap();
    let mut cpu = CpuContext::new(0);
    let baseline = pool.allocated();
    let rw = P2mType::RamRw;

    assert_eq!(
        p2m.set_entry(&mut cpu, g(0x201), m(0x400), 9, rw, P2mAccess::RWX),
        Err(P2mError::Misaligned {
            gfn: g(0x201),
            mfn: m(0x400),
            order: PageOrder::Size2M
        })
    );
    assert!(matches!(
        p2m.set_entry(&mut cpu, g(0x200), m(0x401), 9, rw, P2mAccess::RWX),
        Err(P2mError::Misaligned { .. })
    ));
    assert_eq!(
        p2m.set_entry(&mut cpu, g(0), m(0), 5, rw, P2mAccess::RWX),
        Err(P2mError::UnsupportedOrder { order: 5 })
    );
    assert_eq!(
        p2m.set_entry(&mut cpu, g(0), m(0), 18, rw, P2mAccess::RWX),
        Err(P2mError::UnsupportedOrder { order: 18 })
    );
    assert_eq!(
        p2m.set_entry(&mut cpu, g(1 << 36), m(0), 0, rw, P2mAccess::RWX),
        Err(P2mError::GfnOutOfRange { gfn: g(1 << 36) })
    );
    assert_eq!(
        p2m.set_entry(&mut cpu, g(0x200), m(0x5000), 9, P2mType::PopulateOnDemand, P2mAccess::RWX),
        Err(P2mError::InvalidPodHint {
            mfn: m(0x5000),
            order: PageOrder::Size2M
        })
    );

    assert_eq!(pool.allocated(), baseline);
    assert_eq!(p2m.max_mapped_pfn(), None);
    assert_eq!(p2m.stats().top_down_fills, 0);
    assert!(p2m.entry_content(g(0x200)).is_none());
    assert_eq!(
        p2m.get_entry(&mut cpu, g(1 << 36), Q),
        Err(P2mError::GfnOutOfRange { gfn: g(1 << 36) })
    );
}

#[test]
fn split_keeps_every_frame_in_place() {
    let pool = pool(256);
    let p2m = P2m::new(P2mConfig::new(1), &pool, &pool, NoHooks).unwrap();
    let mut cpu = CpuContext::new(0);

    let base = 0x4_0000;
    p2m.set_entry(&mut cpu, g(base), m(0x8_0000), 18, P2mType::RamRw, P2mAccess::RX)
        .unwrap();
    assert!(p2m.split_one(&mut cpu, g(base + 5), 18).unwrap());

    for off in (0..(1 << 18)).step_by(4099) {
        let t = p2m.get_entry(&mut cpu, g(base + off), Q).unwrap();
        assert_eq!(t.mfn, m(0x8_0000 + off));
        assert_eq!(t.order, PageOrder::Size2M);
        assert_eq!(t.access, P2mAccess::RX);
    }

    assert!(p2m.split_one(&mut cpu, g(base + 0x1234), 9).unwrap());
    let t = p2m.get_entry(&mut cpu, g(base + 0x1234), Q).unwrap();
    assert_eq!((t.mfn, t.order), (m(0x8_1234), PageOrder::Size4K));
    let neighbour = p2m.get_entry(&mut cpu, g(base + 0x1400), Q).unwrap();
    assert_eq!(neighbour.order, PageOrder::Size2M);

    assert!(!p2m.split_one(&mut cpu, g(base + 0x1234), 9).unwrap());
    assert!(!p2m.split_one(&mut cpu, g(0x10), 9).unwrap());
    assert_eq!(
        p2m.split_one(&mut cpu, g(base), 0),
        Err(P2mError::UnsupportedOrder { order: 0 })
    );
    assert_eq!(p2m.stats().splits, 2);
}

#[test]
fn split_to_small_pages_preserves_all_512_frames() {
    let pool = pool(256);
    let p2m = P2m::new(P2mConfig::new(1), &pool, &pool, NoHooks).unwrap();
    let mut cpu = CpuContext::new(0);

    p2m.set_entry(&mut cpu, g(0x200), m(0x4_0000), 9, P2mType::RamRw, P2mAccess::RX)
        .unwrap();
    assert!(p2m.split_one(&mut cpu, g(0x2a0), 9).unwrap());

    for i in 0..512 {
        let t = p2m.get_entry(&mut cpu, g(0x200 + i), Q).unwrap();
        assert_eq!(
            (t.mfn, t.p2m_type, t.access, t.order),
            (m(0x4_0000 + i), P2mType::RamRw, P2mAccess::RX, PageOrder::Size4K),
            "frame {i}"
        );
        let (e, order) = p2m.entry_content(g(0x200 + i)).unwrap();
        assert_eq!(order, PageOrder::Size4K);
        assert!(!e.sp());
        assert_eq!(e.rwx(), Rwx::R.union(Rwx::X));
    }
    assert_eq!(p2m.stats().splits, 1);
}

#[test]
fn split_pod_superpage_keeps_the_hint() {
    let pool = pool(256);
    let zero = m(0x7e00);
    let p2m = P2m::new(P2mConfig::new(1).with_zero_page(zero), &pool, &pool, NoHooks).unwrap();
    let mut cpu = CpuContext::new(0);
    let pod = P2mType::PopulateOnDemand;

    p2m.set_entry(&mut cpu, g(0x400), zero, 9, pod, P2mAccess::RWX).unwrap();
    p2m.set_entry(&mut cpu, g(0x600), Mfn::INVALID, 9, pod, P2mAccess::RW)
        .unwrap();
    assert!(p2m.split_one(&mut cpu, g(0x400), 9).unwrap());
    assert!(p2m.split_one(&mut cpu, g(0x7ff), 9).unwrap());

    for i in 0..512 {
        let (e, order) = p2m.entry_content(g(0x400 + i)).unwrap();
        assert_eq!((e.p2m_type(), e.mfn(), e.access(), order), (pod, zero, P2mAccess::RWX, PageOrder::Size4K));
        // zero-page reads stay mapped, writes fault
        assert!(e.r() && !e.w());

        let (e, order) = p2m.entry_content(g(0x600 + i)).unwrap();
        assert_eq!((e.p2m_type(), e.mfn(), e.access(), order), (pod, Mfn::INVALID, P2mAccess::RW, PageOrder::Size4K));
        assert!(!e.is_present());
    }

    let q = p2m.get_entry(&mut cpu, g(0x4ff), Q).unwrap();
    assert_eq!((q.mfn, q.p2m_type, q.order), (zero, pod, PageOrder::Size4K));
    let s = p2m.stats();
    assert_eq!((s.pod_entries, s.pod_superpages, s.splits), (1024, 0, 2));
}

#[test]
fn device_model_entry_without_access_is_still_mapped() {
    let pool = pool(256);
    let p2m = P2m::new(P2mConfig::new(1), &pool, &pool, NoHooks).unwrap();
    let mut cpu = CpuContext::new(0);

    p2m.set_entry(&mut cpu, g(0x100), m(0x900), 0, P2mType::RamRw, P2mAccess::RWX)
        .unwrap();
    p2m.set_entry(&mut cpu, g(0x40), Mfn::INVALID, 0, P2mType::MmioDm, P2mAccess::N)
        .unwrap();
    let (e, _) = p2m.entry_content(g(0x40)).unwrap();
    assert!(!e.is_present());
    let t = p2m.get_entry(&mut cpu, g(0x40), Q).unwrap();
    assert!(t.is_mapped());
    assert_eq!(
        (t.mfn, t.p2m_type, t.access, t.order),
        (Mfn::INVALID, P2mType::MmioDm, P2mAccess::N, PageOrder::Size4K)
    );
    assert_ne!(t, Translation::UNMAPPED);

    // a neighbour below the watermark with no entry
    let hole = p2m.get_entry(&mut cpu, g(0x3f), Q).unwrap();
    assert!(!hole.is_mapped());
}

#[test]
fn unmapping_never_lowers_the_watermark() {
    let pool = pool(256);
    let p2m = P2m::new(P2mConfig::new(1), &pool, &pool, NoHooks).unwrap();
    let mut cpu = CpuContext::new(0);

    p2m.set_entry(&mut cpu, g(0x500), m(0x9000), 0, P2mType::RamRw, P2mAccess::RWX)
        .unwrap();
    p2m.set_entry(&mut cpu, g(0x300), m(0x9001), 0, P2mType::RamRw, P2mAccess::RWX)
        .unwrap();
    assert_eq!(p2m.max_mapped_pfn(), Some(g(0x500)));

    p2m.set_entry(&mut cpu, g(0x500), Mfn::INVALID, 0, P2mType::Invalid, P2mAccess::N)
        .unwrap();
    assert_eq!(p2m.max_mapped_pfn(), Some(g(0x500)));
    assert_eq!(p2m.get_entry(&mut cpu, g(0x500), Q).unwrap(), Translation::UNMAPPED);

    // above the watermark: answered without a walk
    let walks = p2m.stats().get_walks;
    let t = p2m.get_entry(&mut cpu, g(0x501), Q).unwrap();
    assert!(!t.is_mapped());
    assert_eq!(t.p2m_type, P2mType::MmioDm);
    assert_eq!(p2m.stats().get_walks, walks);

    p2m.set_entry(&mut cpu, g(0x800), Mfn::INVALID, 9, P2mType::MmioDm, P2mAccess::N)
        .unwrap();
    assert_eq!(p2m.max_mapped_pfn(), Some(g(0x500)));
}

#[test]
fn structural_change_invalidates_other_caches() {
    let pool = pool(256);
    let p2m = P2m::new(P2mConfig::new(1), &pool, &pool, NoHooks).unwrap();
    let mut a = CpuContext::new(0);
    let mut b = CpuContext::new(1);

    p2m.set_entry(&mut a, g(0x200), m(0x3000), 0, P2mType::RamRw, P2mAccess::RWX)
        .unwrap();
    p2m.set_entry(&mut a, g(0x3ff), m(0x3001), 0, P2mType::RamRw, P2mAccess::RWX)
        .unwrap();

    assert_eq!(p2m.get_entry(&mut a, g(0x200), Q).unwrap().mfn, m(0x3000));
    assert_eq!(p2m.get_entry(&mut a, g(0x200), Q).unwrap().mfn, m(0x3000));
    let s = p2m.stats();
    assert_eq!(s.get_walks, 1);
    assert_eq!(s.get_cached, 1);

    // replaces the level-0 table cached by `a`
    p2m.set_entry(&mut b, g(0x200), m(0x8000), 9, P2mType::RamRo, P2mAccess::RX)
        .unwrap();

    let t = p2m.get_entry(&mut a, g(0x203), Q).unwrap();
    assert_eq!(t.mfn, m(0x8003));
    assert_eq!(t.p2m_type, P2mType::RamRo);
    assert_eq!(t.order, PageOrder::Size2M);
    let s = p2m.stats();
    assert_eq!(s.get_cached, 1);
    assert_eq!(s.get_walks, 2);
    assert!(s.epoch > 0);
}

#[test]
fn set_slot_serves_neighbouring_writes() {
    let pool = pool(256);
    let p2m = P2m::new(P2mConfig::new(1), &pool, &pool, NoHooks).unwrap();
    let mut cpu = CpuContext::new(0);

    for i in 0..8 {
        p2m.set_entry(&mut cpu, g(0x600 + i), m(0x7000 + i), 0, P2mType::RamRw, P2mAccess::RWX)
            .unwrap();
    }
    let s = p2m.stats();
    assert_eq!(s.set_walks, 1);
    assert_eq!(s.set_cached, 7);
    assert_eq!(cpu.cache().occupancy(), 1);

    cpu.flush();
    assert_eq!(cpu.cache().occupancy(), 0);
    assert_eq!(p2m.get_entry(&mut cpu, g(0x607), Q).unwrap().mfn, m(0x7007));
}

#[test]
fn entry_written_carries_the_sync_decision() {
    let pool = pool(256);
    let p2m = P2m::new(P2mConfig::new(1), &pool, &pool, Recorder::default()).unwrap();
    let mut cpu = CpuContext::new(0);
    let w = |needs_sync| Event::Written {
        gfn: g(0x10),
        level: 0,
        needs_sync,
    };

    p2m.set_entry(&mut cpu, g(0x10), m(0x100), 0, P2mType::RamRw, P2mAccess::RWX)
        .unwrap();
    p2m.set_entry(&mut cpu, g(0x10), m(0x101), 0, P2mType::RamRw, P2mAccess::RWX)
        .unwrap();
    p2m.set_entry(&mut cpu, g(0x10), m(0x101), 0, P2mType::RamLogDirty, P2mAccess::RWX)
        .unwrap();

    assert_eq!(p2m.hooks().syncs(), vec![w(false), w(true), Event::Sync, w(false)]);
    assert_eq!(p2m.stats().syncs, 1);
}

#[test]
fn page_references_follow_the_frame() {
    let pool = pool(256);
    let config = P2mConfig::new(1).with_zero_page(m(0x7777));
    let p2m = P2m::new(config, &pool, &pool, Recorder::default()).unwrap();
    let mut cpu = CpuContext::new(0);
    let mut set = |mfn: Mfn, ty: P2mType| {
        p2m.set_entry(&mut cpu, g(0x10), mfn, 0, ty, P2mAccess::RWX).unwrap();
    };

    set(m(0x100), P2mType::RamRw);
    set(m(0x101), P2mType::RamRw);
    set(m(0x101), P2mType::RamRo);
    set(m(0x200), P2mType::MmioDirect);
    set(m(0x7777), P2mType::RamRo);
    set(Mfn::INVALID, P2mType::Invalid);

    assert_eq!(
        p2m.hooks().refs(),
        vec![
            Event::Get(m(0x100)),
            Event::Get(m(0x101)),
            Event::Put(m(0x100)),
            Event::Put(m(0x101)),
        ]
    );
}

#[test]
fn superpage_over_a_table_releases_the_subtree() {
    let pool = pool(256);
    let p2m = P2m::new(P2mConfig::new(1), &pool, &pool, Recorder::default()).unwrap();
    let mut cpu = CpuContext::new(0);

    p2m.set_entry(&mut cpu, g(0x400), m(0x900), 0, P2mType::RamRw, P2mAccess::RWX)
        .unwrap();
    let with_table = pool.allocated();
    let epoch = p2m.stats().epoch;
    p2m.hooks().clear();

    p2m.set_entry(&mut cpu, g(0x400), m(0x10000), 9, P2mType::RamRw, P2mAccess::RWX)
        .unwrap();

    let events = p2m.hooks().events();
    let sync = events.iter().position(|e| *e == Event::Sync).unwrap();
    let put = events.iter().position(|e| *e == Event::Put(m(0x900))).unwrap();
    assert!(sync < put, "{events:?}");
    assert!(!events.iter().any(|e| matches!(e, Event::Get(_))));
    assert!(p2m.stats().epoch > epoch);
    // the level-0 table went back to the arena, not the pool
    assert_eq!(pool.allocated(), with_table);

    let t = p2m.get_entry(&mut cpu, g(0x401), Q).unwrap();
    assert_eq!((t.mfn, t.order), (m(0x10001), PageOrder::Size2M));
}

#[test]
fn failed_split_leaves_the_superpage() {
    let pool = pool(256);
    let p2m = P2m::new(P2mConfig::new(1).with_node_slots(3), &pool, &pool, NoHooks).unwrap();
    let mut cpu = CpuContext::new(0);

    p2m.set_entry(&mut cpu, g(0), m(0x10000), 9, P2mType::RamRw, P2mAccess::RWX)
        .unwrap();
    let allocated = pool.allocated();
    pool.fail_after(0);

    assert_eq!(
        p2m.set_entry(&mut cpu, g(5), m(0x5555), 0, P2mType::RamRo, P2mAccess::R),
        Err(P2mError::OutOfMemory)
    );
    assert_eq!(p2m.split_one(&mut cpu, g(5), 9), Err(P2mError::OutOfMemory));

    let (e, order) = p2m.entry_content(g(5)).unwrap();
    assert_eq!(order, PageOrder::Size2M);
    assert_eq!(e.p2m_type(), P2mType::RamRw);
    assert_eq!(p2m.get_entry(&mut cpu, g(5), Q).unwrap().mfn, m(0x10005));
    assert_eq!(p2m.stats().splits, 0);
    assert_eq!(pool.allocated(), allocated);

    pool.clear_failures();
    p2m.set_entry(&mut cpu, g(5), m(0x5555), 0, P2mType::RamRo, P2mAccess::R)
        .unwrap();
    assert_eq!(p2m.get_entry(&mut cpu, g(5), Q).unwrap().mfn, m(0x5555));
    assert_eq!(p2m.get_entry(&mut cpu, g(6), Q).unwrap().mfn, m(0x10006));
}

#[test]
fn failed_deep_split_frees_the_partial_subtree() {
    let pool = pool(1100);
    let p2m = P2m::new(P2mConfig::new(1).with_node_slots(4), &pool, &pool, NoHooks).unwrap();
    let mut cpu = CpuContext::new(0);

    p2m.set_entry(&mut cpu, g(0), m(0x4_0000), 18, P2mType::RamRw, P2mAccess::RWX)
        .unwrap();
    let allocated = pool.allocated();
    // a 1 GiB split to 4 KiB needs 513 nodes
    pool.fail_after(100);

    assert_eq!(
        p2m.set_entry(&mut cpu, g(0x123), m(0x9999), 0, P2mType::RamRw, P2mAccess::RWX),
        Err(P2mError::OutOfMemory)
    );
    assert_eq!(pool.allocated(), allocated);
    assert_eq!(p2m.entry_content(g(0x123)).unwrap().1, PageOrder::Size1G);

    pool.clear_failures();
    p2m.set_entry(&mut cpu, g(0x123), m(0x9999), 0, P2mType::RamRw, P2mAccess::RWX)
        .unwrap();
    assert_eq!(p2m.get_entry(&mut cpu, g(0x3_ffff), Q).unwrap().mfn, m(0x7_ffff));
    assert_eq!(p2m.get_entry(&mut cpu, g(0x123), Q).unwrap().order, PageOrder::Size4K);
}

#[test]
fn teardown_returns_every_frame() {
    for slots in [0, 2, 64] {
        let pool = pool(1100);
        {
            let p2m = P2m::new(P2mConfig::new(1).with_node_slots(slots), &pool, &pool, NoHooks).unwrap();
            let mut cpu = CpuContext::new(0);
            p2m.set_entry(&mut cpu, g(0x10), m(0x100), 0, P2mType::RamRw, P2mAccess::RWX)
                .unwrap();
            p2m.set_entry(&mut cpu, g(0x4_0000), m(0x4_0000), 18, P2mType::RamRw, P2mAccess::RWX)
                .unwrap();
            p2m.set_entry(&mut cpu, g(0x4_0200), m(0x5000), 0, P2mType::RamRo, P2mAccess::R)
                .unwrap();
            p2m.enable_log_dirty(&mut cpu).unwrap();
            p2m.log_dirty().mark_dirty(g(0x10));
            p2m.log_dirty().mark_dirty(g(1 << 34));
            let _ = p2m.get_entry(&mut cpu, g(0x10), Q).unwrap();

            assert_eq!(pool.live_mappings(), usize::from(slots), "slots {slots}");
            if slots < 64 {
                assert!(p2m.stats().map_fallback > 0);
            }
            assert!(p2m.dump_table() >= 3);
        }
        assert_eq!(pool.allocated(), 0, "slots {slots}");
        assert_eq!(pool.live_mappings(), 0, "slots {slots}");
    }
}

#[test]
fn walk_table_reports_the_path() {
    let pool = pool(256);
    let p2m = P2m::new(P2mConfig::new(1), &pool, &pool, NoHooks).unwrap();
    let mut cpu = CpuContext::new(0);

    p2m.set_entry(&mut cpu, g(0x1234), m(0x77), 0, P2mType::RamRw, P2mAccess::RWX)
        .unwrap();
    let path = p2m.walk_table(g(0x1234));
    let levels: Vec<u8> = path.iter().map(|(l, _)| *l).collect();
    assert_eq!(levels, vec![3, 2, 1, 0]);
    assert!(path[..3].iter().all(|(l, e)| e.is_intermediate(*l)));
    assert_eq!(path[3].1.mfn(), m(0x77));

    let short = p2m.walk_table(g(0x10_0000));
    assert_eq!(short.len(), 2);
    assert!(short[1].1.is_empty());
    assert_eq!(p2m.dump_table(), 1);
}
