//! # Node Storage
//!
//! Translation-tree nodes are 4 KiB machine frames. A fixed number of them
//! are pre-allocated into a *slot arena* and kept mapped for the lifetime of
//! the address space; slot 0 is the root. Intermediate entries pointing at a
//! slot node carry a 7-bit slot hint in `ptp_idx`, so the walker can reach the
//! child without an ephemeral mapping.
//!
//! ### Slot hints
//! Slot `s >= 1` is encoded as `((s - 1) % 127) + 1`. Several slots share a
//! hint; resolving one scans `hint, hint + 127, hint + 254, ...` and accepts
//! the first slot whose frame matches the entry's `mfn`. Hint 0 means the
//! node came from the general frame allocator.
//!
//! ```text
//!  entry.ptp_idx = 3 ──► slot 3 ? slot 130 ? slot 257 ? ... ──► mapped frame
//!                         (mfn must match)
//!  entry.ptp_idx = 0 ──► PhysMapper::map_guarded(entry.mfn)
//! ```

use crate::entry::EptEntry;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ops::Deref;
use kernel_alloc::{FrameAlloc, MappedFrame, PhysMapper, RawFrame};
use kernel_info::p2m::PTP_IDX_STRIDE;
use kernel_memory_addresses::Mfn;

/// Where a cached level-0 table lives.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CachedTable {
    /// Arena slot; directly addressable.
    Slot(u16),
    /// Allocator frame; needs an ephemeral mapping.
    Frame(Mfn),
}

/// Hint stored in `ptp_idx` for arena slot `slot`.
#[inline]
#[allow(clippy::cast_possible_truncation)]
pub(crate) const fn slot_hint(slot: u16) -> u8 {
    debug_assert!(slot > 0);
    (((slot - 1) % PTP_IDX_STRIDE) + 1) as u8
}

struct Slot<'m> {
    mfn: Mfn,
    frame: &'m RawFrame,
}

/// The pre-mapped node frames of one address space.
pub(crate) struct NodeArena<'m, A: FrameAlloc, M: PhysMapper> {
    alloc: &'m A,
    mapper: &'m M,
    slots: Box<[Slot<'m>]>,
    root: Mfn,
}

impl<'m, A: FrameAlloc, M: PhysMapper> NodeArena<'m, A, M> {
    /// Allocate and map `count` slot frames; the first one becomes the root.
    /// With `count == 0` the root is a plain allocator frame.
    ///
    /// Returns `None` (with nothing leaked) if any frame cannot be obtained.
    pub fn new(alloc: &'m A, mapper: &'m M, count: u16) -> Option<Self> {
        if count == 0 {
            let root = alloc.alloc_zeroed()?;
            return Some(Self {
                alloc,
                mapper,
                slots: Box::new([]),
                root,
            });
        }

        let mut slots: Vec<Slot<'m>> = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let frame = alloc.alloc_zeroed().and_then(|mfn| match mapper.map(mfn) {
                Some(frame) => Some(Slot { mfn, frame }),
                None => {
                    alloc.free(mfn);
                    None
                }
            });
            let Some(slot) = frame else {
                log::warn!("p2m: cannot populate {count} node slots");
                for s in slots {
                    mapper.unmap(s.frame);
                    alloc.free(s.mfn);
                }
                return None;
            };
            slots.push(slot);
        }

        let root = slots[0].mfn;
        Some(Self {
            alloc,
            mapper,
            slots: slots.into_boxed_slice(),
            root,
        })
    }

    #[inline]
    pub const fn root(&self) -> Mfn {
        self.root
    }

    /// Number of arena slots, root included.
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn slot_count(&self) -> u16 {
        self.slots.len() as u16
    }

    /// Resolve a slot hint to the slot holding `mfn`.
    pub fn find_slot(&self, mfn: Mfn, hint: u8) -> Option<u16> {
        if hint == 0 {
            return None;
        }
        let mut s = usize::from(hint);
        while s < self.slots.len() {
            if self.slots[s].mfn == mfn {
                #[allow(clippy::cast_possible_truncation)]
                return Some(s as u16);
            }
            s += usize::from(PTP_IDX_STRIDE);
        }
        None
    }

    #[inline]
    pub fn slot(&self, slot: u16) -> (Mfn, &'m RawFrame) {
        let s = &self.slots[usize::from(slot)];
        (s.mfn, s.frame)
    }

    /// A zeroed node: a free slot if one is left, else an allocator frame.
    pub fn alloc_node(&self, free: &mut Vec<u16>) -> Option<(Mfn, u8)> {
        if let Some(s) = free.pop() {
            let (mfn, frame) = self.slot(s);
            frame.zero();
            return Some((mfn, slot_hint(s)));
        }
        self.alloc.alloc_zeroed().map(|mfn| (mfn, 0))
    }

    /// Return a node obtained from [`alloc_node`](Self::alloc_node).
    pub fn free_node(&self, free: &mut Vec<u16>, mfn: Mfn, hint: u8) {
        match self.find_slot(mfn, hint) {
            Some(s) => free.push(s),
            None => self.alloc.free(mfn),
        }
    }
}

impl<A: FrameAlloc, M: PhysMapper> Drop for NodeArena<'_, A, M> {
    fn drop(&mut self) {
        if self.slots.is_empty() {
            self.alloc.free(self.root);
            return;
        }
        for s in &self.slots {
            self.mapper.unmap(s.frame);
            self.alloc.free(s.mfn);
        }
    }
}

/// A node made addressable for the duration of one walk step.
pub(crate) enum TableRef<'m, M: PhysMapper> {
    Slot {
        slot: u16,
        mfn: Mfn,
        frame: &'m RawFrame,
    },
    Mapped {
        mfn: Mfn,
        guard: MappedFrame<'m, M>,
    },
}

impl<M: PhysMapper> TableRef<'_, M> {
    #[inline]
    pub fn mfn(&self) -> Mfn {
        match self {
            Self::Slot { mfn, .. } | Self::Mapped { mfn, .. } => *mfn,
        }
    }

    #[inline]
    pub fn cached(&self) -> CachedTable {
        match self {
            Self::Slot { slot, .. } => CachedTable::Slot(*slot),
            Self::Mapped { mfn, .. } => CachedTable::Frame(*mfn),
        }
    }

    /// Single atomic load of entry `i`.
    #[inline]
    pub fn entry(&self, i: usize) -> EptEntry {
        EptEntry::from_bits(self.load(i))
    }

    /// Single atomic store of entry `i`.
    #[inline]
    pub fn set(&self, i: usize, e: EptEntry) {
        self.store(i, e.into_bits());
    }
}

impl<M: PhysMapper> Deref for TableRef<'_, M> {
    type Target = RawFrame;

    fn deref(&self) -> &RawFrame {
        match self {
            Self::Slot { frame, .. } => frame,
            Self::Mapped { guard, .. } => guard,
        }
    }
}
