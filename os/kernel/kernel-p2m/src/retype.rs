//! Type and permission rewrites that keep the frame of every entry.

use crate::cache::CpuContext;
use crate::entry::{EptEntry, P2mType};
use crate::error::P2mError;
use crate::hooks::P2mHooks;
use crate::node::TableRef;
use crate::p2m::{P2m, P2mState};
use crate::walk::{WalkStatus, entry_span, table_index};
use kernel_alloc::{FrameAlloc, PhysMapper};
use kernel_info::p2m::{EPT_ENTRIES, MAX_GFN, WALK_LEVELS};
use kernel_memory_addresses::{Gfn, Mfn, PageOrder};

fn check_retype(old: P2mType, new: P2mType) -> Result<(), P2mError> {
    let direct = old == P2mType::MmioDirect || new == P2mType::MmioDirect;
    if direct && old != new {
        return Err(P2mError::MmioRetype { from: old, to: new });
    }
    Ok(())
}

impl<'m, A: FrameAlloc, M: PhysMapper, H: P2mHooks> P2m<'m, A, M, H> {
    /// `e` with type `new` and its permissions re-derived.
    fn retyped(&self, e: EptEntry, new: P2mType) -> EptEntry {
        e.with_type_flags(new, e.access(), self.backed(new, e.mfn()))
    }

    /// Rewrite leaf `i` of `table` in place and keep the POD counters right.
    fn store_retyped(&self, table: &TableRef<'m, M>, i: usize, level: u8, gfn: Gfn, e: EptEntry, new: P2mType) {
        let updated = self.retyped(e, new);
        table.set(i, updated);
        self.hooks.entry_written(gfn, level, updated, false);

        let delta = i64::from(new.is_pod()) - i64::from(e.p2m_type().is_pod());
        if delta != 0 {
            if level == 0 {
                self.counters.pod_delta(delta, 0);
            } else {
                self.counters.pod_delta(0, delta);
            }
        }
    }

    /// Change the 4 KiB frame at `gfn` from `old` to `new`, splitting a
    /// covering superpage. Returns the type found, which differs from `old`
    /// if nothing was changed.
    ///
    /// # Errors
    /// [`P2mError::MmioRetype`] for retypes from or to
    /// [`MmioDirect`](P2mType::MmioDirect), [`P2mError::OutOfMemory`] if a
    /// split fails.
    pub fn change_type(&self, ctx: &mut CpuContext, gfn: Gfn, old: P2mType, new: P2mType) -> Result<P2mType, P2mError> {
        check_retype(old, new)?;
        if gfn.as_u64() > MAX_GFN {
            return Err(P2mError::GfnOutOfRange { gfn });
        }

        let mut st = self.state.lock(ctx.cpu());
        self.change_type_locked(ctx, &mut st, gfn, old, new)
    }

    fn change_type_locked(
        &self,
        ctx: &mut CpuContext,
        st: &mut P2mState,
        gfn: Gfn,
        old: P2mType,
        new: P2mType,
    ) -> Result<P2mType, P2mError> {
        let w = self.walk(None, gfn, 0);
        if w.status == WalkStatus::MapFailed {
            return Ok(P2mType::Invalid);
        }
        let (e, level) = (w.entry(gfn), w.level);
        drop(w);
        let found = if e.is_empty() { P2mType::Invalid } else { e.p2m_type() };
        if found != old || old == new {
            return Ok(found);
        }

        let t = self.translate(e, level, gfn);
        self.set_entry_locked(ctx, st, gfn, t.mfn, PageOrder::Size4K, new, e.access())?;
        Ok(found)
    }

    /// Change every frame of type `old` in `[start, end)` to `new`.
    ///
    /// Superpages entirely inside the range keep their size; partially
    /// covered ones are split.
    ///
    /// # Errors
    /// As [`change_type`](Self::change_type).
    pub fn change_type_range(
        &self,
        ctx: &mut CpuContext,
        start: Gfn,
        end: Gfn,
        old: P2mType,
        new: P2mType,
    ) -> Result<(), P2mError> {
        check_retype(old, new)?;
        if end.as_u64() > MAX_GFN + 1 {
            return Err(P2mError::GfnOutOfRange { gfn: end });
        }
        if old == new {
            return Ok(());
        }

        let mut st = self.state.lock(ctx.cpu());
        let mut gfn = start.as_u64();
        let mut sync = false;
        while gfn < end.as_u64() {
            let g = Gfn::new(gfn);
            let w = self.walk(None, g, 0);
            let level = w.level;
            let base = gfn & !(entry_span(level) - 1);
            let next = base + entry_span(level);

            if w.status == WalkStatus::MapFailed {
                gfn = next;
                continue;
            }
            let e = w.entry(g);
            if e.is_empty() || e.p2m_type() != old {
                gfn = next;
                continue;
            }

            if level == 0 || (base >= start.as_u64() && next <= end.as_u64()) {
                sync |= e.is_present();
                self.store_retyped(&w.table, table_index(g, level), level, Gfn::new(base), e, new);
                gfn = next;
            } else {
                drop(w);
                self.change_type_locked(ctx, &mut st, g, old, new)?;
                gfn += 1;
            }
        }
        drop(st);

        if sync {
            self.sync();
        }
        log::debug!(
            "d{}: retyped {old:?} -> {new:?} in [{start}, {end})",
            self.domain()
        );
        Ok(())
    }

    /// Change every leaf of type `old` to `new`, keeping frames and access.
    /// Returns the number of entries rewritten.
    ///
    /// # Errors
    /// [`P2mError::MmioRetype`] for retypes from or to
    /// [`MmioDirect`](P2mType::MmioDirect).
    pub fn change_entry_type_global(&self, ctx: &mut CpuContext, old: P2mType, new: P2mType) -> Result<u64, P2mError> {
        check_retype(old, new)?;
        if old == new {
            return Ok(0);
        }

        let st = self.state.lock(ctx.cpu());
        let root = self.open_root();
        let (changed, sync) = self.retype_node(&root, WALK_LEVELS, Gfn::new(0), old, new);
        drop(root);
        drop(st);

        if sync {
            self.sync();
        }
        log::debug!(
            "d{}: global retype {old:?} -> {new:?}: {changed} entries",
            self.domain()
        );
        Ok(changed)
    }

    fn retype_node(&self, table: &TableRef<'m, M>, level: u8, base: Gfn, old: P2mType, new: P2mType) -> (u64, bool) {
        let mut changed = 0;
        let mut sync = false;
        for i in 0..EPT_ENTRIES {
            let e = table.entry(i);
            if e.is_empty() {
                continue;
            }
            let gfn = base.offset(i as u64 * entry_span(level));
            if e.is_intermediate(level) {
                let child = self.open(e.mfn(), e.ptp_idx());
                let (c, s) = self.retype_node(&child, level - 1, gfn, old, new);
                changed += c;
                sync |= s;
            } else if e.p2m_type() == old {
                sync |= e.is_present();
                self.store_retyped(table, i, level, gfn, e, new);
                changed += 1;
            }
        }
        (changed, sync)
    }

    /// Write-protect (or unprotect) the 2 MiB range at `gfn` through its
    /// level-1 intermediate entry.
    ///
    /// The path is only allocated when write-protecting. Superpage leaves are
    /// left untouched. Returns `need_sync && read_only && changed`.
    ///
    /// # Errors
    /// [`P2mError::Misaligned`] if `gfn` is not 2 MiB aligned,
    /// [`P2mError::OutOfMemory`] if the path cannot be allocated.
    pub fn ro_update_l2_entry(
        &self,
        ctx: &mut CpuContext,
        gfn: Gfn,
        read_only: bool,
        need_sync: bool,
    ) -> Result<bool, P2mError> {
        if gfn.as_u64() > MAX_GFN {
            return Err(P2mError::GfnOutOfRange { gfn });
        }
        if !gfn.is_aligned(PageOrder::Size2M) {
            return Err(P2mError::Misaligned {
                gfn,
                mfn: Mfn::INVALID,
                order: PageOrder::Size2M,
            });
        }

        let mut st = self.state.lock(ctx.cpu());
        if read_only && self.walk(Some(&mut *st), gfn, 0).status == WalkStatus::MapFailed {
            return Err(P2mError::OutOfMemory);
        }

        let w = self.walk(None, gfn, 1);
        if w.status != WalkStatus::Normal {
            return Ok(false);
        }
        let i = table_index(gfn, 1);
        let e = w.table.entry(i);
        if !e.is_intermediate(1) {
            return Ok(false);
        }

        let updated = e.with_w(!read_only);
        let changed = updated != e;
        if changed {
            w.table.set(i, updated);
            self.hooks.entry_written(gfn, 1, updated, need_sync && read_only);
            log::debug!(
                "d{}: 2M range at {gfn} {}",
                self.domain(),
                if read_only { "write-protected" } else { "writable" }
            );
        }
        Ok(need_sync && read_only && changed)
    }

    /// Re-resolve memory types over `[start, end]`, rewriting only entries
    /// whose `(emt, ipat)` changed. Returns the number of entries rewritten.
    ///
    /// # Errors
    /// [`P2mError::GfnOutOfRange`] for an empty or out-of-range interval,
    /// [`P2mError::OutOfMemory`] if a partially covered superpage cannot be
    /// split.
    pub fn refresh_memory_types(&self, ctx: &mut CpuContext, start: Gfn, end: Gfn) -> Result<u64, P2mError> {
        if end.as_u64() > MAX_GFN || start.as_u64() > end.as_u64() {
            return Err(P2mError::GfnOutOfRange { gfn: end });
        }

        let mut st = self.state.lock(ctx.cpu());
        let mut rewritten = 0;
        let mut sync = false;
        let mut gfn = start.as_u64();
        while gfn <= end.as_u64() {
            let g = Gfn::new(gfn);
            let w = self.walk(None, g, 0);
            let level = w.level;
            let next = (gfn & !(entry_span(level) - 1)) + entry_span(level);
            let e = w.entry(g);
            if w.status == WalkStatus::MapFailed || e.is_empty() || !e.p2m_type().has_emt() {
                gfn = next;
                continue;
            }

            let ty = e.p2m_type();
            let base = next - entry_span(level);
            let whole = level == 0 || (base >= start.as_u64() && next - 1 <= end.as_u64());
            let target = if whole { base } else { gfn };
            let mfn = if whole {
                e.mfn()
            } else {
                e.mfn().offset(gfn - base)
            };
            let mt = self
                .hooks
                .memory_type(Gfn::new(target), mfn, ty == P2mType::MmioDirect);

            if mt != e.memory_type() {
                sync |= e.is_present();
                rewritten += 1;
                if whole {
                    let updated = e.with_memory_type(mt);
                    w.table.set(table_index(g, level), updated);
                    self.hooks.entry_written(Gfn::new(base), level, updated, e.is_present());
                } else {
                    drop(w);
                    self.set_entry_locked(ctx, &mut st, g, mfn, PageOrder::Size4K, ty, e.access())?;
                }
            }
            gfn = if whole { next } else { gfn + 1 };
        }
        drop(st);

        if sync {
            self.sync();
        }
        log::debug!(
            "d{}: memory types refreshed in [{start}, {end}]: {rewritten} entries",
            self.domain()
        );
        Ok(rewritten)
    }
}
