#![allow(dead_code)]

use kernel_alloc::FramePool;
use kernel_memory_addresses::{Gfn, Mfn, PageOrder};
use kernel_p2m::{EptEntry, MemoryType, P2mHooks};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

pub fn pool(frames: usize) -> FramePool {
    FramePool::new(Mfn::new(0x100_0000), frames).unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Get(Mfn),
    Put(Mfn),
    PodRelease(Mfn, Gfn),
    Written { gfn: Gfn, level: u8, needs_sync: bool },
    Sync,
}

/// Hooks that record every call and serve POD requests from fixed lists.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<Event>>,
    /// 4 KiB frames handed out by `pod_populate`, last first.
    pub pod_frames: Mutex<Vec<Mfn>>,
    /// 2 MiB frames handed out by `pod_populate`, last first.
    pub pod_superpages: Mutex<Vec<Mfn>>,
    pub populates: AtomicUsize,
    /// Gfns in `[from, to)` are uncacheable.
    pub uncached: Mutex<Option<(u64, u64)>>,
    pub vram_events: AtomicUsize,
}

impl Recorder {
    pub fn with_pod_frames(frames: &[u64]) -> Self {
        let r = Self::default();
        r.pod_frames
            .lock()
            .unwrap()
            .extend(frames.iter().rev().map(|&m| Mfn::new(m)));
        r
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn refs(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, Event::Get(_) | Event::Put(_) | Event::PodRelease(..)))
            .collect()
    }

    pub fn syncs(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, Event::Written { .. } | Event::Sync))
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    fn push(&self, e: Event) {
        self.events.lock().unwrap().push(e);
    }
}

impl P2mHooks for Recorder {
    fn get_page(&self, mfn: Mfn) {
        self.push(Event::Get(mfn));
    }

    fn put_page(&self, mfn: Mfn) {
        self.push(Event::Put(mfn));
    }

    fn pod_populate(&self, _gfn: Gfn, order: PageOrder) -> Option<Mfn> {
        let frame = match order {
            PageOrder::Size4K => self.pod_frames.lock().unwrap().pop(),
            PageOrder::Size2M => self.pod_superpages.lock().unwrap().pop(),
            PageOrder::Size1G => None,
        };
        if frame.is_some() {
            self.populates.fetch_add(1, Ordering::SeqCst);
        }
        frame
    }

    fn pod_release(&self, mfn: Mfn, gfn: Gfn) {
        self.push(Event::PodRelease(mfn, gfn));
    }

    fn entry_written(&self, gfn: Gfn, level: u8, _entry: EptEntry, needs_sync: bool) {
        self.push(Event::Written {
            gfn,
            level,
            needs_sync,
        });
    }

    fn sync_domain(&self) {
        self.push(Event::Sync);
    }

    fn memory_type(&self, gfn: Gfn, _mfn: Mfn, direct_mmio: bool) -> MemoryType {
        let uc = self
            .uncached
            .lock()
            .unwrap()
            .is_some_and(|(from, to)| (from..to).contains(&gfn.as_u64()));
        if direct_mmio || uc {
            MemoryType::DEVICE
        } else {
            MemoryType::RAM
        }
    }

    fn vram_dirtied(&self) {
        self.vram_events.fetch_add(1, Ordering::SeqCst);
    }
}
