//! Log-dirty mode: write-protect guest RAM and record the frames the guest
//! writes to.
//!
//! ```text
//!  enable ──► RamRw ⇒ RamLogDirty (global)
//!  write fault on RamLogDirty ──► mark dirty ──► frame back to RamRw
//!  read_dirty_range ──► RamRw ⇒ RamLogDirty (global) ──► harvest + clear
//!  disable ──► RamLogDirty ⇒ RamRw (global) ──► trie freed
//! ```
//!
//! ## Dirty-VRAM window
//!
//! An emulated frame buffer is written in long sequential runs. Inside the
//! window set by [`P2m::set_dirty_vram`] a single write fault unprotects up to
//! [`VRAM_FAULT_FRAMES`] consecutive log-dirty frames, and a fault on a
//! write-protected 2 MiB range marks the whole range and reopens it through
//! its level-1 entry.
//!
//! ```text
//!  track_dirty_vram ──► window RamRw ⇒ RamLogDirty ──► 2 MiB ranges read-only
//!                   ──► harvest + clear window ──► re-arm vram_dirtied
//! ```
//!
//! The trie lock and the window lock are always released before the
//! address-space lock is taken.

use crate::cache::CpuContext;
use crate::entry::P2mType;
use crate::error::P2mError;
use crate::hooks::P2mHooks;
use crate::p2m::{LookupMode, P2m};
use kernel_alloc::{FrameAlloc, PhysMapper};
use kernel_info::p2m::{MAX_GFN, VRAM_FAULT_FRAMES};
use kernel_logdirty::{DirtyBitmap, LogDirtyError};
use kernel_memory_addresses::{Gfn, Mfn, PageOrder};

/// Guest frames `[begin, end)` of an emulated frame buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct VramWindow {
    begin: Gfn,
    end: Gfn,
    /// Report the next write through [`P2mHooks::vram_dirtied`].
    want_events: bool,
}

impl VramWindow {
    const fn contains(&self, gfn: Gfn) -> bool {
        gfn.as_u64() >= self.begin.as_u64() && gfn.as_u64() < self.end.as_u64()
    }

    const fn len(&self) -> u64 {
        self.end.as_u64() - self.begin.as_u64()
    }
}

impl<A: FrameAlloc, M: PhysMapper, H: P2mHooks> P2m<'_, A, M, H> {
    /// Start tracking writes.
    ///
    /// # Errors
    /// [`LogDirtyError::AlreadyEnabled`] if tracking is on.
    pub fn enable_log_dirty(&self, ctx: &mut CpuContext) -> Result<(), P2mError> {
        self.log_dirty.enable()?;
        let n = self.change_entry_type_global(ctx, P2mType::RamRw, P2mType::RamLogDirty)?;
        log::debug!("d{}: log-dirty enabled, {n} entries protected", self.domain());
        Ok(())
    }

    /// Stop tracking writes and free the trie.
    ///
    /// # Errors
    /// Only if the global retype fails.
    pub fn disable_log_dirty(&self, ctx: &mut CpuContext) -> Result<(), P2mError> {
        let n = self.change_entry_type_global(ctx, P2mType::RamLogDirty, P2mType::RamRw)?;
        self.log_dirty.disable();
        log::debug!("d{}: log-dirty disabled, {n} entries unprotected", self.domain());
        Ok(())
    }

    /// Handle a guest write fault on `gfn`.
    ///
    /// Returns `true` if the fault was a log-dirty fault; the frame is then
    /// marked dirty and writable again.
    ///
    /// # Errors
    /// [`P2mError::OutOfMemory`] if unprotecting the frame needs a split that
    /// fails.
    pub fn handle_write_fault(&self, ctx: &mut CpuContext, gfn: Gfn) -> Result<bool, P2mError> {
        let hit = self.unprotect_dirty(ctx, gfn)?;
        if hit {
            self.log_dirty.note_fault();
        }
        Ok(hit)
    }

    /// Mark a log-dirty frame dirty and make it writable again.
    fn unprotect_dirty(&self, ctx: &mut CpuContext, gfn: Gfn) -> Result<bool, P2mError> {
        let t = self.get_entry(ctx, gfn, LookupMode::Query)?;
        if t.p2m_type != P2mType::RamLogDirty {
            return Ok(false);
        }
        self.log_dirty.mark_dirty(gfn);
        self.change_type(ctx, gfn, P2mType::RamLogDirty, P2mType::RamRw)?;
        Ok(true)
    }

    /// Re-protect guest RAM, then harvest and clear the dirty bits of
    /// `[begin, begin + nr)`. The guest must be paused.
    ///
    /// # Errors
    /// The [`LogDirtyError`] of the read, or a retype failure.
    pub fn read_dirty_range(&self, ctx: &mut CpuContext, begin: Gfn, nr: u64) -> Result<DirtyBitmap, P2mError> {
        if !self.log_dirty.is_enabled() {
            return Err(LogDirtyError::Disabled.into());
        }
        let stats = self.log_dirty.stats();
        if stats.dirty_count > 0 || stats.fault_count > 0 {
            self.change_entry_type_global(ctx, P2mType::RamRw, P2mType::RamLogDirty)?;
        }
        Ok(self.log_dirty.read_range(begin, nr, true)?)
    }

    /// Track `[begin, begin + nr)` as the guest's frame buffer.
    ///
    /// Replaces any previous window; the first write into the new window is
    /// reported through [`P2mHooks::vram_dirtied`].
    ///
    /// # Errors
    /// [`P2mError::Misaligned`] unless `begin` is 2 MiB aligned,
    /// [`P2mError::GfnOutOfRange`] for an empty window or one leaving the
    /// guest frame space.
    pub fn set_dirty_vram(&self, begin: Gfn, nr: u64) -> Result<(), P2mError> {
        let end = begin
            .as_u64()
            .checked_add(nr)
            .filter(|&e| nr > 0 && e <= MAX_GFN + 1)
            .ok_or(P2mError::GfnOutOfRange { gfn: begin })?;
        if !begin.is_aligned(PageOrder::Size2M) {
            return Err(P2mError::Misaligned {
                gfn: begin,
                mfn: Mfn::INVALID,
                order: PageOrder::Size2M,
            });
        }
        *self.vram.lock() = Some(VramWindow {
            begin,
            end: Gfn::new(end),
            want_events: true,
        });
        log::debug!("d{}: dirty-VRAM window {begin} + {nr:#x}", self.domain());
        Ok(())
    }

    /// Stop treating any range as a frame buffer.
    pub fn clear_dirty_vram(&self) {
        if self.vram.lock().take().is_some() {
            log::debug!("d{}: dirty-VRAM window cleared", self.domain());
        }
    }

    /// The dirty-VRAM window as `(begin, frames)`.
    #[must_use]
    pub fn dirty_vram(&self) -> Option<(Gfn, u64)> {
        self.vram.lock().map(|w| (w.begin, w.len()))
    }

    /// Handle a write fault on `gfn`, unprotecting the following log-dirty
    /// frames as well when `gfn` lies in the dirty-VRAM window.
    ///
    /// Returns the number of frames made writable: 0 if this was not a
    /// log-dirty fault, at most [`VRAM_FAULT_FRAMES`]. The run stops at the
    /// window end and at the first frame that is not log-dirty.
    ///
    /// # Errors
    /// As [`handle_write_fault`](Self::handle_write_fault).
    pub fn handle_vram_write_fault(&self, ctx: &mut CpuContext, gfn: Gfn) -> Result<u32, P2mError> {
        if !self.handle_write_fault(ctx, gfn)? {
            return Ok(0);
        }
        let Some(window) = self.vram_window().filter(|w| w.contains(gfn)) else {
            return Ok(1);
        };

        let mut unprotected = 1;
        let mut next = gfn.offset(1);
        while unprotected < VRAM_FAULT_FRAMES && window.contains(next) {
            if !self.unprotect_dirty(ctx, next)? {
                break;
            }
            unprotected += 1;
            next = next.offset(1);
        }
        log::trace!("d{}: VRAM fault at {gfn} unprotected {unprotected} frames", self.domain());
        self.notify_vram();
        Ok(unprotected)
    }

    /// Handle a write fault taken on a write-protected 2 MiB range of the
    /// dirty-VRAM window: mark every frame of the range that lies in the
    /// window dirty and make the range writable through its level-1 entry.
    ///
    /// Returns `false`, doing nothing, outside the window or while log-dirty
    /// mode is off.
    ///
    /// # Errors
    /// As [`ro_update_l2_entry`](Self::ro_update_l2_entry).
    pub fn handle_vram_write_fault_l2(&self, ctx: &mut CpuContext, gfn: Gfn) -> Result<bool, P2mError> {
        let Some(window) = self.vram_window().filter(|w| w.contains(gfn)) else {
            return Ok(false);
        };
        if !self.log_dirty.is_enabled() {
            return Ok(false);
        }

        let base = gfn.align_down(PageOrder::Size2M);
        let end = base
            .last_in(PageOrder::Size2M)
            .as_u64()
            .min(window.end.as_u64() - 1);
        for pfn in base.as_u64()..=end {
            self.log_dirty.mark_dirty(Gfn::new(pfn));
        }
        // read-only to writable needs no flush
        self.ro_update_l2_entry(ctx, base, false, false)?;
        self.notify_vram();
        Ok(true)
    }

    /// Re-protect the dirty-VRAM window, then harvest and clear its dirty
    /// bits. Re-arms [`P2mHooks::vram_dirtied`]. The guest must be paused.
    ///
    /// # Errors
    /// [`P2mError::NoVramWindow`] without a window, the [`LogDirtyError`] of
    /// the read, or a retype failure.
    pub fn track_dirty_vram(&self, ctx: &mut CpuContext) -> Result<DirtyBitmap, P2mError> {
        let window = self.vram_window().ok_or(P2mError::NoVramWindow)?;
        if !self.log_dirty.is_enabled() {
            return Err(LogDirtyError::Disabled.into());
        }

        self.change_type_range(ctx, window.begin, window.end, P2mType::RamRw, P2mType::RamLogDirty)?;
        let mut need_sync = false;
        let mut base = window.begin;
        while base.as_u64() < window.end.as_u64() {
            need_sync |= self.ro_update_l2_entry(ctx, base, true, true)?;
            base = base.offset(1 << PageOrder::Size2M.order());
        }
        if need_sync {
            self.sync();
        }

        let bitmap = self.log_dirty.read_range(window.begin, window.len(), true)?;
        if let Some(w) = self.vram.lock().as_mut() {
            w.want_events = true;
        }
        Ok(bitmap)
    }

    fn vram_window(&self) -> Option<VramWindow> {
        *self.vram.lock()
    }

    fn notify_vram(&self) {
        let notify = self
            .vram
            .lock()
            .as_mut()
            .is_some_and(|w| core::mem::replace(&mut w.want_events, false));
        if notify {
            self.hooks.vram_dirtied();
        }
    }
}
