//! # Guest Address Space
//!
//! [`P2m`] owns the translation tree of one guest: its root and node arena, the
//! lock serialising every mutation, the high-water mark of mapped frames, the
//! cache epoch, counters, the guest's log-dirty trie and its dirty-VRAM window.
//!
//! ### Locking
//! * Every walk that may allocate and every store to the tree happens under
//!   the owner-tracking lock, taken with the caller's CPU id.
//! * [`LookupMode::Query`] lookups are lock-free; each entry is observed
//!   through a single atomic load.
//! * The log-dirty trie has its own lock and is never held while the tree
//!   lock is acquired. The dirty-VRAM window lock is a leaf lock as well.

use crate::cache::CpuContext;
use crate::config::P2mConfig;
use crate::entry::{EptEntry, P2mAccess, P2mType};
use crate::error::P2mError;
use crate::hooks::{NoHooks, P2mHooks};
use crate::node::{NodeArena, TableRef};
use crate::paging::VramWindow;
use crate::stats::{Counters, P2mStats, bump};
use crate::walk::{WalkStatus, entry_span, leaf_order, table_index};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_alloc::{FrameAlloc, PhysMapper};
use kernel_info::p2m::{EPT_ENTRIES, MAX_GFN, WALK_LEVELS};
use kernel_logdirty::LogDirty;
use kernel_memory_addresses::{Gfn, Mfn, PageOrder};
use kernel_sync::{OwnedMutex, SpinLock};

static NEXT_P2M_ID: AtomicU64 = AtomicU64::new(1);

/// How a lookup treats populate-on-demand entries.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LookupMode {
    /// Report the entry as it is; never populate.
    Query,
    /// Back a POD entry with a frame before returning it.
    Alloc,
    /// Like [`Alloc`](Self::Alloc), but a POD entry backed by the shared
    /// zero page is reported as POD with that frame instead of populated.
    AllocRead,
}

/// Backing recorded in the frame field of a populate-on-demand entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PodHint {
    /// No backing yet.
    None,
    /// The shared zero page; reads may be served from it.
    ZeroPage,
    /// A frame reserved for this 4 KiB entry.
    Reserved(Mfn),
}

impl PodHint {
    #[must_use]
    pub fn classify(hint: Mfn, zero_page: Mfn) -> Self {
        if !hint.is_valid() {
            Self::None
        } else if hint == zero_page {
            Self::ZeroPage
        } else {
            Self::Reserved(hint)
        }
    }
}

/// Result of a lookup.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Translation {
    /// Machine frame backing the looked-up gfn; for POD entries, the hint.
    pub mfn: Mfn,
    pub p2m_type: P2mType,
    pub access: P2mAccess,
    /// Size of the leaf that maps the gfn.
    pub order: PageOrder,
    /// `false` only when no leaf entry covers the gfn.
    pub mapped: bool,
}

impl Translation {
    /// What a lookup of an unmapped gfn reports.
    pub const UNMAPPED: Self = Self {
        mfn: Mfn::INVALID,
        p2m_type: P2mType::MmioDm,
        access: P2mAccess::N,
        order: PageOrder::Size4K,
        mapped: false,
    };

    #[inline]
    #[must_use]
    pub const fn is_mapped(&self) -> bool {
        self.mapped
    }
}

/// State guarded by the address-space lock.
#[derive(Default)]
pub(crate) struct P2mState {
    /// Arena slots not holding a live node.
    pub free_slots: Vec<u16>,
}

/// Frame whose reference a level-0 leaf holds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Held {
    Page(Mfn),
    Pod(Mfn),
}

/// The translation tree of one guest.
///
/// ### Example
/// ```rust
/// use kernel_alloc::FramePool;
/// use kernel_memory_addresses::{Gfn, Mfn};
/// use kernel_p2m::{CpuContext, LookupMode, NoHooks, P2m, P2mAccess, P2mConfig, P2mType};
///
/// let pool = FramePool::new(Mfn::new(0x10_0000), 64).unwrap();
/// let p2m = P2m::new(P2mConfig::new(1).with_node_slots(8), &pool, &pool, NoHooks).unwrap();
/// let mut cpu = CpuContext::new(0);
///
/// p2m.set_entry(&mut cpu, Gfn::new(0x1000), Mfn::new(0x2000), 0, P2mType::RamRw, P2mAccess::RWX)
///     .unwrap();
/// let t = p2m.get_entry(&mut cpu, Gfn::new(0x1000), LookupMode::Query).unwrap();
/// assert_eq!(t.mfn, Mfn::new(0x2000));
/// assert_eq!(t.p2m_type, P2mType::RamRw);
/// ```
pub struct P2m<'m, A: FrameAlloc, M: PhysMapper, H: P2mHooks = NoHooks> {
    pub(crate) id: u64,
    pub(crate) config: P2mConfig,
    pub(crate) mapper: &'m M,
    pub(crate) hooks: H,
    pub(crate) arena: NodeArena<'m, A, M>,
    pub(crate) state: OwnedMutex<P2mState>,
    /// Highest mapped gfn plus one; 0 while nothing was ever mapped.
    watermark: AtomicU64,
    pub(crate) epoch: AtomicU64,
    pub(crate) counters: Counters,
    pub(crate) log_dirty: LogDirty<'m, A, M>,
    pub(crate) vram: SpinLock<Option<VramWindow>>,
}

impl<'m, A: FrameAlloc, M: PhysMapper, H: P2mHooks> P2m<'m, A, M, H> {
    /// Create an empty address space.
    ///
    /// # Errors
    /// [`P2mError::OutOfMemory`] if the root or the node slots cannot be
    /// allocated and mapped.
    pub fn new(config: P2mConfig, alloc: &'m A, mapper: &'m M, hooks: H) -> Result<Self, P2mError> {
        let slots = config.node_slots();
        let arena = NodeArena::new(alloc, mapper, slots).ok_or(P2mError::OutOfMemory)?;
        let free_slots = (1..slots).rev().collect();
        let id = NEXT_P2M_ID.fetch_add(1, Ordering::Relaxed);

        log::debug!(
            "d{}: p2m {id} created, root {}, {slots} node slots",
            config.domain_id(),
            arena.root()
        );

        Ok(Self {
            id,
            config,
            mapper,
            hooks,
            arena,
            state: OwnedMutex::new(P2mState { free_slots }),
            watermark: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            counters: Counters::default(),
            log_dirty: LogDirty::new(config.domain_id(), alloc, mapper),
            vram: SpinLock::new(None),
        })
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &P2mConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub const fn hooks(&self) -> &H {
        &self.hooks
    }

    #[inline]
    pub(crate) const fn domain(&self) -> u16 {
        self.config.domain_id()
    }

    /// Machine frame of the root node.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> Mfn {
        self.arena.root()
    }

    /// Highest gfn ever mapped; never lowered by unmapping.
    #[must_use]
    pub fn max_mapped_pfn(&self) -> Option<Gfn> {
        self.watermark.load(Ordering::Acquire).checked_sub(1).map(Gfn::new)
    }

    #[must_use]
    pub fn stats(&self) -> P2mStats {
        self.counters.snapshot(self.epoch.load(Ordering::Acquire))
    }

    /// The guest's dirty-page trie.
    #[inline]
    #[must_use]
    pub const fn log_dirty(&self) -> &LogDirty<'m, A, M> {
        &self.log_dirty
    }

    /// Map `2^order` frames at `gfn` to `mfn` with the given type and access.
    ///
    /// For [`PopulateOnDemand`](P2mType::PopulateOnDemand) entries `mfn` is
    /// the backing hint: [`Mfn::INVALID`], the configured zero page, or (for
    /// 4 KiB entries) a reserved frame. An [`Invalid`](P2mType::Invalid) type
    /// unmaps.
    ///
    /// # Errors
    /// Parameter errors are reported before anything is modified;
    /// [`P2mError::OutOfMemory`] if a node cannot be allocated, with the
    /// existing mappings unchanged.
    pub fn set_entry(
        &self,
        ctx: &mut CpuContext,
        gfn: Gfn,
        mfn: Mfn,
        order: u32,
        ty: P2mType,
        access: P2mAccess,
    ) -> Result<(), P2mError> {
        let order = self.check_mapping(gfn, mfn, order, ty)?;
        let mut st = self.state.lock(ctx.cpu());
        self.set_entry_locked(ctx, &mut st, gfn, mfn, order, ty, access)
    }

    fn check_mapping(&self, gfn: Gfn, mfn: Mfn, order: u32, ty: P2mType) -> Result<PageOrder, P2mError> {
        if gfn.as_u64() > MAX_GFN {
            return Err(P2mError::GfnOutOfRange { gfn });
        }
        let order = match PageOrder::from_order(order) {
            Some(PageOrder::Size2M) if !self.config.hap_2mb() => None,
            Some(PageOrder::Size1G) if !self.config.hap_1gb() => None,
            o => o,
        }
        .ok_or(P2mError::UnsupportedOrder { order })?;

        let backing = ty.is_ram() || ty.is_pod() || ty == P2mType::MmioDirect;
        if !gfn.is_aligned(order) || (backing && mfn.is_valid() && !mfn.is_aligned(order)) {
            return Err(P2mError::Misaligned { gfn, mfn, order });
        }
        if ty.is_pod()
            && order != PageOrder::Size4K
            && matches!(PodHint::classify(mfn, self.config.zero_page()), PodHint::Reserved(_))
        {
            return Err(P2mError::InvalidPodHint { mfn, order });
        }
        Ok(order)
    }

    /// The table holding the `level` entry for `gfn`, splitting a superpage
    /// above it if needed.
    fn locate_for_write(
        &self,
        ctx: &mut CpuContext,
        st: &mut P2mState,
        gfn: Gfn,
        level: u8,
    ) -> Result<TableRef<'m, M>, P2mError> {
        if level == 0 {
            let epoch = self.epoch.load(Ordering::Acquire);
            if let Some(table) = ctx.cache_mut().lookup_set(self.id, epoch, gfn) {
                bump(&self.counters.set_cached);
                return Ok(self.open_cached(table));
            }
        }

        bump(&self.counters.set_walks);
        let mut w = self.walk(Some(&mut *st), gfn, level);
        if matches!(w.status, WalkStatus::SuperPage | WalkStatus::Pod) {
            self.split_at(st, &w.table, gfn, w.level, level)?;
            w = self.walk(Some(&mut *st), gfn, level);
        }
        match w.status {
            WalkStatus::Normal => {}
            WalkStatus::MapFailed => return Err(P2mError::OutOfMemory),
            WalkStatus::SuperPage | WalkStatus::Pod => panic!(
                "d{}: {gfn} still maps a level {} superpage after a split",
                self.domain(),
                w.level
            ),
        }

        if level == 0 {
            let epoch = self.epoch.load(Ordering::Acquire);
            ctx.cache_mut().fill_set(self.id, epoch, gfn, w.table.cached());
        }
        Ok(w.table)
    }

    /// Leaf for `(mfn, ty, access)` at `level`, with derived permissions and
    /// memory type.
    pub(crate) fn make_leaf(&self, gfn: Gfn, mfn: Mfn, level: u8, ty: P2mType, access: P2mAccess) -> EptEntry {
        if ty == P2mType::Invalid || (!mfn.is_valid() && !ty.is_mmio() && !ty.is_pod()) {
            return EptEntry::EMPTY;
        }
        let e = EptEntry::new()
            .with_sp(level > 0)
            .with_mfn(mfn)
            .with_type_flags(ty, access, self.backed(ty, mfn));
        if ty.has_emt() {
            e.with_memory_type(self.hooks.memory_type(gfn, mfn, ty == P2mType::MmioDirect))
        } else {
            e
        }
    }

    /// The frame predicate the type table consults for `ty`.
    pub(crate) fn backed(&self, ty: P2mType, mfn: Mfn) -> bool {
        match ty {
            P2mType::PopulateOnDemand => mfn.is_valid(),
            P2mType::MmioDirect => !self.hooks.mmio_read_only(mfn),
            _ => false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn set_entry_locked(
        &self,
        ctx: &mut CpuContext,
        st: &mut P2mState,
        gfn: Gfn,
        mfn: Mfn,
        order: PageOrder,
        ty: P2mType,
        access: P2mAccess,
    ) -> Result<(), P2mError> {
        let level = order.level();
        let table = self.locate_for_write(ctx, st, gfn, level)?;
        let i = table_index(gfn, level);
        let old = table.entry(i);
        let new = self.make_leaf(gfn, mfn, level, ty, access);

        let needs_sync =
            old.is_present() && !(level == 0 && !new.is_empty() && new.p2m_type() == P2mType::RamLogDirty);

        if !new.is_empty() && (new.mfn().is_valid() || new.p2m_type().is_pod()) {
            self.watermark
                .fetch_max(gfn.last_in(order).as_u64() + 1, Ordering::AcqRel);
        }

        table.set(i, new);
        if level > 0 && !old.is_empty() {
            self.epoch.fetch_add(1, Ordering::AcqRel);
        }
        self.hooks.entry_written(gfn, level, new, needs_sync);
        drop(table);

        if level == 0 {
            self.transfer_refs(gfn, old, new);
        }
        self.account_pod(level, old, new);
        if needs_sync {
            self.sync();
        }
        if old.is_intermediate(level) {
            self.free_subtree(st, old.mfn(), old.ptp_idx(), level - 1, gfn, true);
        }

        log::trace!(
            "d{}: {gfn} {order} -> {:#018x} (was {:#018x})",
            self.domain(),
            new.into_bits(),
            old.into_bits()
        );
        Ok(())
    }

    pub(crate) fn sync(&self) {
        self.hooks.sync_domain();
        bump(&self.counters.syncs);
    }

    fn held(&self, e: EptEntry) -> Option<Held> {
        let mfn = e.mfn();
        if e.is_empty() || !mfn.is_valid() || mfn == self.config.zero_page() {
            return None;
        }
        match e.p2m_type() {
            t if t.is_ram() => Some(Held::Page(mfn)),
            P2mType::PopulateOnDemand => Some(Held::Pod(mfn)),
            _ => None,
        }
    }

    /// Move page references from the frame `old` held to the one `new` holds.
    fn transfer_refs(&self, gfn: Gfn, old: EptEntry, new: EptEntry) {
        let was = self.held(old);
        let now = self.held(new);
        if was == now {
            return;
        }
        if let Some(Held::Page(mfn)) = now {
            self.hooks.get_page(mfn);
        }
        match was {
            Some(Held::Page(mfn)) => self.hooks.put_page(mfn),
            // a reserved frame promoted in place stays with the guest
            Some(Held::Pod(mfn)) if now != Some(Held::Page(mfn)) => self.hooks.pod_release(mfn, gfn),
            _ => {}
        }
    }

    fn account_pod(&self, level: u8, old: EptEntry, new: EptEntry) {
        let pod = |e: EptEntry| e.is_leaf(level) && e.p2m_type().is_pod();
        let delta = i64::from(pod(new)) - i64::from(pod(old));
        if delta == 0 {
            return;
        }
        if level == 0 {
            self.counters.pod_delta(delta, 0);
        } else {
            self.counters.pod_delta(0, delta);
        }
    }

    /// Drop the references held by a leaf that is going away.
    fn release_leaf(&self, gfn: Gfn, level: u8, e: EptEntry) {
        if e.p2m_type().is_pod() {
            if level == 0 {
                self.counters.pod_delta(-1, 0);
            } else {
                self.counters.pod_delta(0, -1);
            }
        }
        if level == 0 {
            match self.held(e) {
                Some(Held::Page(mfn)) => self.hooks.put_page(mfn),
                Some(Held::Pod(mfn)) => self.hooks.pod_release(mfn, gfn),
                None => {}
            }
        }
    }

    /// Free node `mfn` at `level` and everything below it. `gfn` is any frame
    /// the node covers. With `release`, leaves give up their references.
    pub(crate) fn free_subtree(&self, st: &mut P2mState, mfn: Mfn, hint: u8, level: u8, gfn: Gfn, release: bool) {
        {
            let table = self.open(mfn, hint);
            let base = Gfn::new(gfn.as_u64() & !(entry_span(level + 1) - 1));
            self.release_children(st, &table, level, base, release);
        }
        self.arena.free_node(&mut st.free_slots, mfn, hint);
    }

    fn release_children(&self, st: &mut P2mState, table: &TableRef<'m, M>, level: u8, base: Gfn, release: bool) {
        let span = entry_span(level);
        for i in 0..EPT_ENTRIES {
            let e = table.entry(i);
            if e.is_empty() {
                continue;
            }
            let gfn = base.offset(i as u64 * span);
            if e.is_intermediate(level) {
                self.free_subtree(st, e.mfn(), e.ptp_idx(), level - 1, gfn, release);
            } else if release {
                self.release_leaf(gfn, level, e);
            }
        }
    }

    /// Look `gfn` up, optionally populating a POD entry.
    ///
    /// Unmapped gfns report [`Translation::UNMAPPED`]. Gfns above
    /// [`max_mapped_pfn`](Self::max_mapped_pfn) are answered without a walk.
    ///
    /// # Errors
    /// [`P2mError::GfnOutOfRange`] for gfns beyond the tree, and
    /// [`P2mError::OutOfMemory`] if population finds no frame.
    pub fn get_entry(&self, ctx: &mut CpuContext, gfn: Gfn, mode: LookupMode) -> Result<Translation, P2mError> {
        if gfn.as_u64() > MAX_GFN {
            return Err(P2mError::GfnOutOfRange { gfn });
        }
        if gfn.as_u64() >= self.watermark.load(Ordering::Acquire) {
            return Ok(Translation::UNMAPPED);
        }

        let Some((e, level)) = self.lookup(ctx, gfn) else {
            return Ok(Translation::UNMAPPED);
        };
        if e.is_empty() || !e.p2m_type().is_pod() {
            return Ok(self.translate(e, level, gfn));
        }

        let zero_read =
            PodHint::classify(e.mfn(), self.config.zero_page()) == PodHint::ZeroPage;
        match mode {
            LookupMode::Query => Ok(self.translate(e, level, gfn)),
            LookupMode::AllocRead if zero_read => Ok(self.translate(e, level, gfn)),
            LookupMode::Alloc | LookupMode::AllocRead => self.populate(ctx, gfn),
        }
    }

    /// Lock-free lookup of the leaf covering `gfn` and its level.
    fn lookup(&self, ctx: &mut CpuContext, gfn: Gfn) -> Option<(EptEntry, u8)> {
        let epoch = self.epoch.load(Ordering::Acquire);
        let i = table_index(gfn, 0);
        if let Some(table) = ctx.cache_mut().lookup_get(self.id, epoch, gfn) {
            bump(&self.counters.get_cached);
            return Some((self.open_cached(table).entry(i), 0));
        }

        bump(&self.counters.get_walks);
        let w = self.walk(None, gfn, 0);
        match w.status {
            WalkStatus::MapFailed => None,
            WalkStatus::Normal => {
                ctx.cache_mut().fill_get(self.id, epoch, gfn, w.table.cached());
                Some((w.table.entry(i), 0))
            }
            WalkStatus::SuperPage | WalkStatus::Pod => Some((w.entry(gfn), w.level)),
        }
    }

    pub(crate) fn translate(&self, e: EptEntry, level: u8, gfn: Gfn) -> Translation {
        if e.is_empty() {
            return Translation::UNMAPPED;
        }
        let order = leaf_order(level);
        let ty = e.p2m_type();
        let mfn = if ty.is_pod() || !e.mfn().is_valid() {
            e.mfn()
        } else {
            e.mfn().offset(gfn.offset_in(order))
        };
        Translation {
            mfn,
            p2m_type: ty,
            access: e.access(),
            order,
            mapped: true,
        }
    }

    /// Back the POD entry covering `gfn` with a frame.
    ///
    /// Re-walks under the lock; a caller that lost the race finds a concrete
    /// entry and uses it.
    fn populate(&self, ctx: &mut CpuContext, gfn: Gfn) -> Result<Translation, P2mError> {
        let mut st = self.state.lock(ctx.cpu());
        loop {
            let w = self.walk(None, gfn, 0);
            if w.status == WalkStatus::MapFailed {
                return Ok(Translation::UNMAPPED);
            }
            let (e, level) = (w.entry(gfn), w.level);
            if e.is_empty() || !e.p2m_type().is_pod() {
                return Ok(self.translate(e, level, gfn));
            }

            let order = leaf_order(level);
            let base = gfn.align_down(order);
            let access = e.access();

            let mfn = if level > 0 {
                let Some(mfn) = self.hooks.pod_populate(base, order) else {
                    log::debug!(
                        "d{}: no {order} frame for POD superpage {base}, splitting",
                        self.domain()
                    );
                    self.split_at(&mut st, &w.table, gfn, level, 0)?;
                    continue;
                };
                mfn
            } else {
                match PodHint::classify(e.mfn(), self.config.zero_page()) {
                    PodHint::Reserved(mfn) => mfn,
                    PodHint::None | PodHint::ZeroPage => self.hooks.pod_populate(gfn, order).ok_or_else(|| {
                        log::warn!("d{}: POD pool empty populating {gfn}", self.domain());
                        P2mError::OutOfMemory
                    })?,
                }
            };
            drop(w);

            self.set_entry_locked(ctx, &mut st, base, mfn, order, P2mType::RamRw, access)?;
            bump(&self.counters.pod_populations);
            log::debug!("d{}: populated {base} {order} with {mfn}", self.domain());
            return Ok(Translation {
                mfn: mfn.offset(gfn.offset_in(order)),
                p2m_type: P2mType::RamRw,
                access,
                order,
                mapped: true,
            });
        }
    }

    /// Raw leaf entry covering `gfn` and its mapping size; never populates.
    #[must_use]
    pub fn entry_content(&self, gfn: Gfn) -> Option<(EptEntry, PageOrder)> {
        if gfn.as_u64() > MAX_GFN {
            return None;
        }
        let w = self.walk(None, gfn, 0);
        if w.status == WalkStatus::MapFailed {
            return None;
        }
        let e = w.entry(gfn);
        (!e.is_empty()).then_some((e, leaf_order(w.level)))
    }
}

impl<A: FrameAlloc, M: PhysMapper, H: P2mHooks> Drop for P2m<'_, A, M, H> {
    fn drop(&mut self) {
        let mut st = core::mem::take(self.state.get_mut());
        let root = self.open_root();
        self.release_children(&mut st, &root, WALK_LEVELS, Gfn::new(0), true);
        drop(root);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        log::debug!("d{}: p2m {} torn down", self.domain(), self.id);
    }
}
