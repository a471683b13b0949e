//! Superpage splitting.
//!
//! A superpage leaf at level `L` is replaced by an intermediate entry pointing
//! at a new node of 512 leaves one level down, recursively until the target
//! level. The new subtree is built off to the side and installed with a single
//! store, so concurrent readers see either the superpage or the complete
//! subtree.

use crate::cache::CpuContext;
use crate::entry::EptEntry;
use crate::error::P2mError;
use crate::hooks::P2mHooks;
use crate::node::TableRef;
use crate::p2m::{P2m, P2mState};
use crate::stats::bump;
use crate::walk::{WalkStatus, entry_span, leaf_order, table_index};
use core::sync::atomic::Ordering;
use kernel_alloc::{FrameAlloc, PhysMapper};
use kernel_info::p2m::{EPT_ENTRIES, MAX_GFN};
use kernel_memory_addresses::{Gfn, PageOrder};

impl<'m, A: FrameAlloc, M: PhysMapper, H: P2mHooks> P2m<'m, A, M, H> {
    /// Build the subtree replacing superpage `parent` at `level`, split down
    /// to `target`. Returns the intermediate entry to install, or `None` with
    /// every node of the partial subtree freed.
    fn split_entry(&self, st: &mut P2mState, parent: EptEntry, level: u8, target: u8) -> Option<EptEntry> {
        debug_assert!(level > target && parent.sp());
        let (node, hint) = self.arena.alloc_node(&mut st.free_slots)?;

        let child_level = level - 1;
        let trunk = entry_span(child_level);
        let ty = parent.p2m_type();
        let table = self.open(node, hint);

        for i in 0..EPT_ENTRIES {
            // POD hints are not frame ranges and are inherited as-is
            let mfn = if ty.is_pod() || !parent.mfn().is_valid() {
                parent.mfn()
            } else {
                parent.mfn().offset(i as u64 * trunk)
            };
            let child = parent
                .with_sp(child_level > 0)
                .with_mfn(mfn)
                .with_type_flags(ty, parent.access(), self.backed(ty, mfn));

            if child_level == target {
                table.set(i, child);
                continue;
            }
            let Some(sub) = self.split_entry(st, child, child_level, target) else {
                drop(table);
                self.free_subtree(st, node, hint, child_level, Gfn::new(0), false);
                return None;
            };
            table.set(i, sub);
        }

        Some(EptEntry::intermediate(node, hint))
    }

    /// Split the superpage covering `gfn` at `level` in `table` down to
    /// `target`.
    ///
    /// # Errors
    /// [`P2mError::OutOfMemory`] with the superpage left in place.
    pub(crate) fn split_at(
        &self,
        st: &mut P2mState,
        table: &TableRef<'m, M>,
        gfn: Gfn,
        level: u8,
        target: u8,
    ) -> Result<(), P2mError> {
        let i = table_index(gfn, level);
        let old = table.entry(i);
        if level <= target || !old.is_leaf(level) {
            return Ok(());
        }

        let Some(new) = self.split_entry(st, old, level, target) else {
            log::warn!(
                "d{}: out of memory splitting level {level} superpage at {gfn}",
                self.domain()
            );
            return Err(P2mError::OutOfMemory);
        };

        let base = gfn.align_down(leaf_order(level));
        table.set(i, new);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        bump(&self.counters.splits);
        self.hooks.entry_written(base, level, new, false);

        if old.p2m_type().is_pod() {
            let pieces = i64::from(1u32 << (9 * u32::from(level - target)));
            if target == 0 {
                self.counters.pod_delta(pieces, -1);
            } else {
                self.counters.pod_delta(0, pieces - 1);
            }
        }

        log::debug!(
            "d{}: split {} {:?} at {base} down to level {target}",
            self.domain(),
            leaf_order(level),
            old.p2m_type()
        );
        Ok(())
    }

    /// Split the superpage of `order` covering `gfn` one level down.
    ///
    /// Returns `false` if `gfn` is not mapped by a superpage of that size.
    ///
    /// # Errors
    /// [`P2mError::UnsupportedOrder`] for 4 KiB or unknown orders,
    /// [`P2mError::OutOfMemory`] if the new node cannot be allocated.
    pub fn split_one(&self, ctx: &mut CpuContext, gfn: Gfn, order: u32) -> Result<bool, P2mError> {
        if gfn.as_u64() > MAX_GFN {
            return Err(P2mError::GfnOutOfRange { gfn });
        }
        let level = match PageOrder::from_order(order) {
            Some(o @ (PageOrder::Size2M | PageOrder::Size1G)) => o.level(),
            _ => return Err(P2mError::UnsupportedOrder { order }),
        };

        let mut st = self.state.lock(ctx.cpu());
        let w = self.walk(None, gfn, level);
        if w.status != WalkStatus::Normal || !w.entry(gfn).is_leaf(level) {
            return Ok(false);
        }
        self.split_at(&mut st, &w.table, gfn, level, level - 1)?;
        Ok(true)
    }
}

