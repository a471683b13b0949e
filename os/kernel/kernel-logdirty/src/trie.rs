//! # Dirty-Frame Trie
//!
//! ```text
//!         top (L4)              L3                 L2               leaf (L1)
//!   ┌──────────────────┐  ┌──────────────┐  ┌──────────────┐  ┌───────────────────┐
//!   │ [pfn>>33 & 511] ─┼─►│ [pfn>>24..] ─┼─►│ [pfn>>15..] ─┼─►│ bit pfn & 0x7fff  │
//!   └──────────────────┘  └──────────────┘  └──────────────┘  └───────────────────┘
//!   interior entries hold a child Mfn or Mfn::INVALID     4 KiB = 32768 frames
//! ```
//!
//! Nodes are allocated on the first write below them and freed all at once by
//! [`LogDirty::teardown`]. Allocation failures are not reported to the writer
//! (a write fault cannot fail); they are counted and surface at the next read.

use crate::bitmap::DirtyBitmap;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_alloc::{FrameAlloc, MappedFrame, PhysMapper, RawFrame};
use kernel_info::logdirty::{
    L2_SHIFT, L3_SHIFT, L4_SHIFT, LEAF_FRAMES, MAX_PFN, MAX_READ_FRAMES, NODE_ENTRIES,
};
use kernel_memory_addresses::{Gfn, Mfn};
use kernel_sync::SpinLock;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogDirtyError {
    #[error("log-dirty tracking is not enabled")]
    Disabled,
    #[error("log-dirty tracking is already enabled")]
    AlreadyEnabled,
    #[error("{failed} log-dirty node allocations failed")]
    OutOfMemory { failed: u32 },
    #[error("range of {nr} frames from {begin} exceeds the trackable space")]
    RangeOutOfBounds { begin: Gfn, nr: u64 },
    #[error("no memory for a bitmap of {nr} frames")]
    BitmapAlloc { nr: u64 },
}

/// Counters reported with every whole-bitmap operation.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct LogDirtyStats {
    /// Write faults recorded since the last clean.
    pub fault_count: u64,
    /// Bits currently set.
    pub dirty_count: u64,
    /// Trie nodes currently allocated.
    pub allocs: u64,
    /// Node allocations that failed since the last teardown (saturating).
    pub failed_allocs: u32,
}

struct TrieState {
    enabled: bool,
    top: Mfn,
    allocs: u64,
    failed_allocs: u32,
    dirty_count: u64,
    fault_count: u64,
}

impl TrieState {
    const fn new() -> Self {
        Self {
            enabled: false,
            top: Mfn::INVALID,
            allocs: 0,
            failed_allocs: 0,
            dirty_count: 0,
            fault_count: 0,
        }
    }

    const fn stats(&self) -> LogDirtyStats {
        LogDirtyStats {
            fault_count: self.fault_count,
            dirty_count: self.dirty_count,
            allocs: self.allocs,
            failed_allocs: self.failed_allocs,
        }
    }
}

/// Interior levels walked from the top: (index shift, child is a leaf).
const PATH: [(u32, bool); 3] = [(L4_SHIFT, false), (L3_SHIFT, false), (L2_SHIFT, true)];

/// Level number of the top node; leaves are level 1.
const TOP_LEVEL: u8 = 4;

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn node_index(pfn: u64, shift: u32) -> usize {
    ((pfn >> shift) as usize) & (NODE_ENTRIES - 1)
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn leaf_bit(pfn: u64) -> usize {
    (pfn & (LEAF_FRAMES - 1)) as usize
}

#[inline]
const fn low_mask(n: u32) -> u64 {
    if n >= 64 { u64::MAX } else { (1 << n) - 1 }
}

/// Per-domain log-dirty trie.
///
/// ### Example
/// ```rust
/// use kernel_alloc::FramePool;
/// use kernel_logdirty::LogDirty;
/// use kernel_memory_addresses::{Gfn, Mfn};
///
/// let pool = FramePool::new(Mfn::new(0x1000), 8).unwrap();
/// let ld = LogDirty::new(1, &pool, &pool);
/// ld.enable().unwrap();
/// ld.mark_dirty(Gfn::new(5));
/// let bm = ld.read_range(Gfn::new(0), 64, true).unwrap();
/// assert!(bm.is_set(5));
/// assert!(!ld.is_dirty(Gfn::new(5)));
/// ```
pub struct LogDirty<'m, A: FrameAlloc, M: PhysMapper> {
    domain: u16,
    alloc: &'m A,
    mapper: &'m M,
    state: SpinLock<TrieState>,
}

impl<'m, A: FrameAlloc, M: PhysMapper> LogDirty<'m, A, M> {
    /// A disabled, empty trie for `domain`.
    #[must_use]
    pub const fn new(domain: u16, alloc: &'m A, mapper: &'m M) -> Self {
        Self {
            domain,
            alloc,
            mapper,
            state: SpinLock::new(TrieState::new()),
        }
    }

    /// Start recording writes with cleared statistics.
    ///
    /// # Errors
    /// [`LogDirtyError::AlreadyEnabled`] if tracking is on.
    pub fn enable(&self) -> Result<(), LogDirtyError> {
        let mut st = self.state.lock();
        if st.enabled {
            return Err(LogDirtyError::AlreadyEnabled);
        }
        st.enabled = true;
        st.dirty_count = 0;
        st.fault_count = 0;
        log::debug!("d{}: log-dirty enabled", self.domain);
        Ok(())
    }

    /// Stop recording and free the trie.
    pub fn disable(&self) {
        let mut st = self.state.lock();
        if st.enabled {
            log::debug!(
                "d{}: log-dirty disabled ({} dirty, {} faults)",
                self.domain,
                st.dirty_count,
                st.fault_count
            );
        }
        st.enabled = false;
        self.free_all(&mut st);
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Record a write to `gfn`.
    ///
    /// No-op while disabled and for frames the trie cannot represent. An
    /// allocation failure is counted and the write is lost.
    pub fn mark_dirty(&self, gfn: Gfn) {
        let pfn = gfn.as_u64();
        if pfn > MAX_PFN {
            return;
        }
        let mut st = self.state.lock();
        if !st.enabled {
            return;
        }
        let Some(leaf) = self.leaf_or_alloc(&mut st, pfn) else {
            return;
        };
        let frame = self.map_node(leaf);
        let bit = leaf_bit(pfn);
        let mask = 1u64 << (bit % 64);
        if frame.word(bit / 64).fetch_or(mask, Ordering::Relaxed) & mask == 0 {
            st.dirty_count += 1;
        }
    }

    /// Count a write fault taken because of log-dirty protection.
    pub fn note_fault(&self) {
        let mut st = self.state.lock();
        if st.enabled {
            st.fault_count += 1;
        }
    }

    /// Current dirty state of `gfn`; never allocates.
    #[must_use]
    pub fn is_dirty(&self, gfn: Gfn) -> bool {
        let pfn = gfn.as_u64();
        if pfn > MAX_PFN {
            return false;
        }
        let st = self.state.lock();
        self.leaf_of(&st, pfn).is_some_and(|leaf| {
            let bit = leaf_bit(pfn);
            self.map_node(leaf).load(bit / 64) & (1 << (bit % 64)) != 0
        })
    }

    /// Dirty bits of `nr` frames from `begin`, optionally clearing them.
    ///
    /// Clearing must only be requested while the guest is paused; bits set
    /// concurrently by a running guest may otherwise be lost between read and
    /// clear of a word.
    ///
    /// A clearing read also resets the fault count.
    ///
    /// # Errors
    /// - [`LogDirtyError::RangeOutOfBounds`] if the range leaves the trie or
    ///   covers more than [`MAX_READ_FRAMES`] frames.
    /// - [`LogDirtyError::Disabled`] while tracking is off.
    /// - [`LogDirtyError::OutOfMemory`] once any node allocation has failed.
    /// - [`LogDirtyError::BitmapAlloc`] if the result cannot be allocated.
    pub fn read_range(
        &self,
        begin: Gfn,
        nr: u64,
        clear: bool,
    ) -> Result<DirtyBitmap, LogDirtyError> {
        let mut st = self.state.lock();
        self.read_locked(&mut st, begin, nr, clear)
    }

    /// Whole-bitmap read of the first `pages` frames without clearing.
    ///
    /// # Errors
    /// As [`read_range`](Self::read_range).
    pub fn peek(&self, pages: u64) -> Result<(DirtyBitmap, LogDirtyStats), LogDirtyError> {
        let mut st = self.state.lock();
        let stats = st.stats();
        let bitmap = self.read_locked(&mut st, Gfn::new(0), pages, false)?;
        Ok((bitmap, stats))
    }

    /// Whole-bitmap read of the first `pages` frames, then clear every bit
    /// and reset the statistics. Returns the statistics from before the reset.
    ///
    /// # Errors
    /// As [`read_range`](Self::read_range); nothing is cleared on error.
    pub fn clean(&self, pages: u64) -> Result<(DirtyBitmap, LogDirtyStats), LogDirtyError> {
        let mut st = self.state.lock();
        let stats = st.stats();
        let bitmap = self.read_locked(&mut st, Gfn::new(0), pages, true)?;
        if st.dirty_count != 0 && st.top.is_valid() {
            self.clear_node(st.top, TOP_LEVEL);
        }
        st.dirty_count = 0;
        st.fault_count = 0;
        log::debug!(
            "d{}: log-dirty clean: {} dirty, {} faults",
            self.domain,
            stats.dirty_count,
            stats.fault_count
        );
        Ok((bitmap, stats))
    }

    #[must_use]
    pub fn stats(&self) -> LogDirtyStats {
        self.state.lock().stats()
    }

    /// Free every node; tracking stays in its current mode. Idempotent.
    pub fn teardown(&self) {
        let mut st = self.state.lock();
        self.free_all(&mut st);
    }

    fn read_locked(
        &self,
        st: &mut TrieState,
        begin: Gfn,
        nr: u64,
        clear: bool,
    ) -> Result<DirtyBitmap, LogDirtyError> {
        let start = begin.as_u64();
        let end = start
            .checked_add(nr)
            .filter(|&e| e <= MAX_PFN + 1 && nr <= MAX_READ_FRAMES)
            .ok_or(LogDirtyError::RangeOutOfBounds { begin, nr })?;
        if !st.enabled {
            return Err(LogDirtyError::Disabled);
        }
        if st.failed_allocs > 0 {
            log::warn!(
                "d{}: {} failed log-dirty node allocations",
                self.domain,
                st.failed_allocs
            );
            return Err(LogDirtyError::OutOfMemory {
                failed: st.failed_allocs,
            });
        }

        let mut out = DirtyBitmap::try_clean(begin, nr).ok_or(LogDirtyError::BitmapAlloc { nr })?;
        if st.dirty_count == 0 && st.fault_count == 0 {
            return Ok(out);
        }
        if clear {
            st.fault_count = 0;
        }

        let mut pfn = start;
        while pfn < end {
            let leaf_end = ((pfn | (LEAF_FRAMES - 1)) + 1).min(end);
            if let Some(leaf) = self.leaf_of(st, pfn) {
                let frame = self.map_node(leaf);
                let mut p = pfn;
                while p < leaf_end {
                    #[allow(clippy::cast_possible_truncation)]
                    let n = (leaf_end - p).min(64) as u32;
                    let bits = take_bits(&frame, leaf_bit(p), n, clear);
                    if clear {
                        st.dirty_count = st.dirty_count.saturating_sub(u64::from(bits.count_ones()));
                    }
                    out.put_bits(p - start, bits, n);
                    p += u64::from(n);
                }
            }
            pfn = leaf_end;
        }
        Ok(out)
    }

    /// Leaf bitmap covering `pfn`, if allocated.
    fn leaf_of(&self, st: &TrieState, pfn: u64) -> Option<Mfn> {
        let mut node = st.top;
        for (shift, _) in PATH {
            if !node.is_valid() {
                return None;
            }
            node = Mfn::new(self.map_node(node).load(node_index(pfn, shift)));
        }
        node.is_valid().then_some(node)
    }

    fn leaf_or_alloc(&self, st: &mut TrieState, pfn: u64) -> Option<Mfn> {
        if !st.top.is_valid() {
            st.top = self.new_node(st, false)?;
        }
        let mut node = st.top;
        for (shift, child_is_leaf) in PATH {
            let frame = self.map_node(node);
            let idx = node_index(pfn, shift);
            let mut child = Mfn::new(frame.load(idx));
            if !child.is_valid() {
                child = self.new_node(st, child_is_leaf)?;
                frame.store(idx, child.as_u64());
            }
            node = child;
        }
        Some(node)
    }

    fn new_node(&self, st: &mut TrieState, leaf: bool) -> Option<Mfn> {
        let Some(mfn) = self.alloc.alloc_zeroed() else {
            st.failed_allocs = st.failed_allocs.saturating_add(1);
            log::warn!(
                "d{}: log-dirty node allocation failed ({} so far)",
                self.domain,
                st.failed_allocs
            );
            return None;
        };
        if !leaf {
            self.map_node(mfn).fill(Mfn::INVALID.as_u64());
        }
        st.allocs += 1;
        Some(mfn)
    }

    fn free_all(&self, st: &mut TrieState) {
        if st.top.is_valid() {
            log::trace!("d{}: freeing {} log-dirty nodes", self.domain, st.allocs);
            self.free_node(st.top, TOP_LEVEL);
        }
        *st = TrieState {
            enabled: st.enabled,
            ..TrieState::new()
        };
    }

    fn free_node(&self, mfn: Mfn, level: u8) {
        if level > 1 {
            let frame = self.map_node(mfn);
            for i in 0..NODE_ENTRIES {
                let child = Mfn::new(frame.load(i));
                if child.is_valid() {
                    self.free_node(child, level - 1);
                }
            }
        }
        self.alloc.free(mfn);
    }

    fn clear_node(&self, mfn: Mfn, level: u8) {
        let frame = self.map_node(mfn);
        if level == 1 {
            frame.zero();
            return;
        }
        for i in 0..NODE_ENTRIES {
            let child = Mfn::new(frame.load(i));
            if child.is_valid() {
                self.clear_node(child, level - 1);
            }
        }
    }

    fn map_node(&self, mfn: Mfn) -> MappedFrame<'m, M> {
        self.mapper
            .map_guarded(mfn)
            .unwrap_or_else(|| panic!("d{}: log-dirty node {mfn} is not mappable", self.domain))
    }
}

impl<A: FrameAlloc, M: PhysMapper> Drop for LogDirty<'_, A, M> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Read (and optionally clear) `n <= 64` bits from bit `bit` of a leaf.
#[allow(clippy::cast_possible_truncation)]
fn take_bits(frame: &RawFrame, bit: usize, n: u32, clear: bool) -> u64 {
    let w = bit / 64;
    let off = (bit % 64) as u32;
    let lo = n.min(64 - off);
    let mut bits = take_word_bits(frame.word(w), off, lo, clear);
    if lo < n {
        bits |= take_word_bits(frame.word(w + 1), 0, n - lo, clear) << lo;
    }
    bits
}

fn take_word_bits(word: &AtomicU64, off: u32, n: u32, clear: bool) -> u64 {
    let mask = low_mask(n) << off;
    let old = if clear {
        word.fetch_and(!mask, Ordering::Relaxed)
    } else {
        word.load(Ordering::Relaxed)
    };
    (old & mask) >> off
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_alloc::FramePool;

    fn pool() -> FramePool {
        FramePool::new(Mfn::new(0x4000), 32).unwrap()
    }

    #[test]
    fn marking_twice_counts_once() {
        let pool = pool();
        let ld = LogDirty::new(0, &pool, &pool);
        ld.enable().unwrap();
        ld.mark_dirty(Gfn::new(5));
        ld.mark_dirty(Gfn::new(5));
        assert_eq!(ld.stats().dirty_count, 1);
        // top, L3, L2 and one leaf
        assert_eq!(ld.stats().allocs, 4);
        assert_eq!(pool.allocated(), 4);
    }

    #[test]
    fn disabled_trie_ignores_writes() {
        let pool = pool();
        let ld = LogDirty::new(0, &pool, &pool);
        ld.mark_dirty(Gfn::new(9));
        assert!(!ld.is_dirty(Gfn::new(9)));
        assert_eq!(pool.allocated(), 0);
        assert_eq!(
            ld.read_range(Gfn::new(0), 16, false),
            Err(LogDirtyError::Disabled)
        );
    }

    #[test]
    fn invalid_gfn_is_ignored() {
        let pool = pool();
        let ld = LogDirty::new(0, &pool, &pool);
        ld.enable().unwrap();
        ld.mark_dirty(Gfn::INVALID);
        assert_eq!(ld.stats().dirty_count, 0);
        assert_eq!(pool.allocated(), 0);
    }

    #[test]
    fn take_bits_across_words() {
        let frame = RawFrame::zeroed();
        frame.store(0, 1 << 63);
        frame.store(1, 0b11);
        assert_eq!(take_bits(&frame, 63, 3, false), 0b111);
        assert_eq!(take_bits(&frame, 62, 64, true), 0b1110);
        assert_eq!(frame.load(0), 0);
        assert_eq!(frame.load(1), 0);
    }

    #[test]
    fn enable_twice_is_rejected() {
        let pool = pool();
        let ld = LogDirty::new(0, &pool, &pool);
        ld.enable().unwrap();
        assert_eq!(ld.enable(), Err(LogDirtyError::AlreadyEnabled));
    }

    #[test]
    fn drop_frees_the_trie() {
        let pool = pool();
        {
            let ld = LogDirty::new(0, &pool, &pool);
            ld.enable().unwrap();
            ld.mark_dirty(Gfn::new(1));
            ld.mark_dirty(Gfn::new(1 << 34));
            assert!(pool.allocated() > 0);
        }
        assert_eq!(pool.allocated(), 0);
        assert_eq!(pool.live_mappings(), 0);
    }
}
