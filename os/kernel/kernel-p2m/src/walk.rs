//! Root-to-leaf traversal and node access.

use crate::entry::EptEntry;
use crate::hooks::P2mHooks;
use crate::node::{CachedTable, TableRef};
use crate::p2m::{P2m, P2mState};
use crate::stats::bump;
use kernel_alloc::{FrameAlloc, PhysMapper};
use kernel_info::p2m::{EPT_ENTRIES, EPT_TABLE_ORDER, WALK_LEVELS};
use kernel_memory_addresses::{Gfn, Mfn, PageOrder};

/// Why a walk stopped where it did.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum WalkStatus {
    /// An empty entry above the target (read-only walk), or node allocation
    /// failed (writing walk).
    MapFailed,
    /// Reached the target level.
    Normal,
    /// A superpage leaf above the target.
    SuperPage,
    /// A populate-on-demand leaf above the target.
    Pod,
}

/// Result of [`P2m::walk`]: the table at the stop level and why it stopped.
pub(crate) struct Walk<'m, M: PhysMapper> {
    pub table: TableRef<'m, M>,
    pub level: u8,
    pub status: WalkStatus,
}

impl<M: PhysMapper> Walk<'_, M> {
    /// The entry covering `gfn` at the stop level.
    #[inline]
    pub fn entry(&self, gfn: Gfn) -> EptEntry {
        self.table.entry(table_index(gfn, self.level))
    }
}

/// Index of `gfn` within a node at `level`.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub(crate) const fn table_index(gfn: Gfn, level: u8) -> usize {
    ((gfn.as_u64() >> (EPT_TABLE_ORDER * level as u32)) as usize) & (EPT_ENTRIES - 1)
}

/// Guest frames covered by one entry at `level`.
#[inline]
#[must_use]
pub(crate) const fn entry_span(level: u8) -> u64 {
    1 << (EPT_TABLE_ORDER * level as u32)
}

/// Mapping size of a leaf at `level`.
#[inline]
#[must_use]
pub(crate) const fn leaf_order(level: u8) -> PageOrder {
    match level {
        0 => PageOrder::Size4K,
        1 => PageOrder::Size2M,
        _ => PageOrder::Size1G,
    }
}

impl<'m, A: FrameAlloc, M: PhysMapper, H: P2mHooks> P2m<'m, A, M, H> {
    /// Make node `mfn` addressable, directly if `hint` resolves to an arena
    /// slot and through an ephemeral mapping otherwise.
    ///
    /// # Panics
    /// If the mapper cannot map an installed node.
    pub(crate) fn open(&self, mfn: Mfn, hint: u8) -> TableRef<'m, M> {
        if let Some(slot) = self.arena.find_slot(mfn, hint) {
            bump(&self.counters.map_direct);
            let (_, frame) = self.arena.slot(slot);
            return TableRef::Slot { slot, mfn, frame };
        }

        bump(&self.counters.map_fallback);
        log::trace!("d{}: ephemeral mapping of node {mfn}", self.domain());
        let mapper: &'m M = self.mapper;
        match mapper.map_guarded(mfn) {
            Some(guard) => TableRef::Mapped { mfn, guard },
            None => panic!("d{}: p2m node {mfn} is not mappable", self.domain()),
        }
    }

    pub(crate) fn open_root(&self) -> TableRef<'m, M> {
        if self.arena.slot_count() == 0 {
            return self.open(self.arena.root(), 0);
        }
        bump(&self.counters.map_direct);
        let (mfn, frame) = self.arena.slot(0);
        TableRef::Slot {
            slot: 0,
            mfn,
            frame,
        }
    }

    pub(crate) fn open_cached(&self, table: CachedTable) -> TableRef<'m, M> {
        match table {
            CachedTable::Slot(slot) => {
                bump(&self.counters.map_direct);
                let (mfn, frame) = self.arena.slot(slot);
                TableRef::Slot { slot, mfn, frame }
            }
            CachedTable::Frame(mfn) => self.open(mfn, 0),
        }
    }

    /// Walk from the root towards `target` for `gfn`.
    ///
    /// Every entry is loaded exactly once and only the loaded value is
    /// inspected. With `alloc` (only obtainable under the address-space lock)
    /// empty entries above the target are filled with fresh intermediate
    /// nodes; without it they stop the walk with [`WalkStatus::MapFailed`].
    pub(crate) fn walk(&self, mut alloc: Option<&mut P2mState>, gfn: Gfn, target: u8) -> Walk<'m, M> {
        debug_assert!(target <= WALK_LEVELS);
        let mut table = self.open_root();
        let mut level = WALK_LEVELS;

        while level > target {
            let i = table_index(gfn, level);
            let e = table.entry(i);

            if e.is_empty() {
                let Some(st) = alloc.as_deref_mut() else {
                    return Walk {
                        table,
                        level,
                        status: WalkStatus::MapFailed,
                    };
                };
                let Some((child, hint)) = self.arena.alloc_node(&mut st.free_slots) else {
                    log::warn!(
                        "d{}: no frame for a level {} node at {gfn}",
                        self.domain(),
                        level - 1
                    );
                    return Walk {
                        table,
                        level,
                        status: WalkStatus::MapFailed,
                    };
                };
                table.set(i, EptEntry::intermediate(child, hint));
                bump(&self.counters.top_down_fills);
                log::debug!(
                    "d{}: filled level {level} entry {i} for {gfn} with node {child}",
                    self.domain()
                );
                table = self.open(child, hint);
                level -= 1;
                continue;
            }

            if e.sp() {
                let status = if e.p2m_type().is_pod() {
                    WalkStatus::Pod
                } else {
                    WalkStatus::SuperPage
                };
                return Walk {
                    table,
                    level,
                    status,
                };
            }

            table = self.open(e.mfn(), e.ptp_idx());
            level -= 1;
        }

        Walk {
            table,
            level,
            status: WalkStatus::Normal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_per_level() {
        let gfn = Gfn::new((5 << 27) | (7 << 18) | (3 << 9) | 0x1ff);
        assert_eq!(table_index(gfn, 3), 5);
        assert_eq!(table_index(gfn, 2), 7);
        assert_eq!(table_index(gfn, 1), 3);
        assert_eq!(table_index(gfn, 0), 0x1ff);
    }

    #[test]
    fn spans_and_orders() {
        assert_eq!(entry_span(0), 1);
        assert_eq!(entry_span(1), 512);
        assert_eq!(entry_span(2), 512 * 512);
        assert_eq!(leaf_order(1), PageOrder::Size2M);
        assert_eq!(leaf_order(2).frames(), entry_span(2));
    }
}
