//! # Address-Space Hooks
//!
//! Everything the translation tree needs from the rest of the hypervisor that
//! is not memory for its own nodes: page ownership, the populate-on-demand
//! pool, IOMMU/TLB synchronisation, and memory-type policy.
//!
//! Hooks are called with the address-space lock held. A hook that calls back
//! into a locking operation of the same address space on the same CPU context
//! panics on the recursive acquisition.

use crate::entry::{EptEntry, MemoryType};
use kernel_memory_addresses::{Gfn, Mfn, PageOrder};

pub trait P2mHooks {
    /// Take a reference on a RAM frame that a level-0 leaf now maps.
    fn get_page(&self, _mfn: Mfn) {}

    /// Drop the reference taken by [`get_page`](Self::get_page).
    fn put_page(&self, _mfn: Mfn) {}

    /// Supply a frame of `order` to back the POD range starting at `gfn`.
    ///
    /// `None` means the pool cannot provide it; for superpages the range is
    /// then split and populated at 4 KiB granularity.
    fn pod_populate(&self, _gfn: Gfn, _order: PageOrder) -> Option<Mfn> {
        None
    }

    /// Return a frame that backed a POD entry to the pool.
    fn pod_release(&self, _mfn: Mfn, _gfn: Gfn) {}

    /// Called after every leaf store with the final `needs_sync` decision.
    fn entry_written(&self, _gfn: Gfn, _level: u8, _entry: EptEntry, _needs_sync: bool) {}

    /// Flush stale translations on every CPU running the domain.
    fn sync_domain(&self) {}

    /// Memory type for a new leaf.
    fn memory_type(&self, _gfn: Gfn, _mfn: Mfn, direct_mmio: bool) -> MemoryType {
        if direct_mmio {
            MemoryType::DEVICE
        } else {
            MemoryType::RAM
        }
    }

    /// `true` if `mfn` is device memory the guest may only read.
    fn mmio_read_only(&self, _mfn: Mfn) -> bool {
        false
    }

    /// The guest wrote to the dirty-VRAM window for the first time since the
    /// window was last harvested. Called without the address-space lock.
    fn vram_dirtied(&self) {}
}

impl<T: P2mHooks + ?Sized> P2mHooks for &T {
    fn get_page(&self, mfn: Mfn) {
        (**self).get_page(mfn);
    }

    fn put_page(&self, mfn: Mfn) {
        (**self).put_page(mfn);
    }

    fn pod_populate(&self, gfn: Gfn, order: PageOrder) -> Option<Mfn> {
        (**self).pod_populate(gfn, order)
    }

    fn pod_release(&self, mfn: Mfn, gfn: Gfn) {
        (**self).pod_release(mfn, gfn);
    }

    fn entry_written(&self, gfn: Gfn, level: u8, entry: EptEntry, needs_sync: bool) {
        (**self).entry_written(gfn, level, entry, needs_sync);
    }

    fn sync_domain(&self) {
        (**self).sync_domain();
    }

    fn memory_type(&self, gfn: Gfn, mfn: Mfn, direct_mmio: bool) -> MemoryType {
        (**self).memory_type(gfn, mfn, direct_mmio)
    }

    fn mmio_read_only(&self, mfn: Mfn) -> bool {
        (**self).mmio_read_only(mfn)
    }

    fn vram_dirtied(&self) {
        (**self).vram_dirtied();
    }
}

/// Hooks that do nothing: no refcounting, an empty POD pool, default memory
/// types.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoHooks;

impl P2mHooks for NoHooks {}
