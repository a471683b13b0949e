//! # Frame Allocation
//!
//! [`FrameAlloc`] is the capability the translation engine consumes to obtain
//! and return zeroed 4 KiB frames for its radix nodes and dirty bitmaps.
//!
//! [`FramePool`] is a self-contained implementation backed by host memory: a
//! fixed array of [`RawFrame`]s numbered from a base machine frame, tracked by
//! a free bitmap. It also implements [`PhysMapper`](crate::PhysMapper), so the
//! same pool can hand out frames and make them addressable.
//!
//! The pool supports *failure injection*: after
//! [`fail_after`](FramePool::fail_after)`(n)`, the next `n` allocations succeed
//! and every later one fails, which lets tests drive out-of-memory paths
//! deterministically.

use crate::raw_frame::RawFrame;
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use kernel_memory_addresses::Mfn;
use kernel_sync::SpinLock;

/// Minimal frame allocator used to obtain **machine** 4 KiB frames.
///
/// Returned frames must be zero-filled and remain valid until freed.
/// Returns `None` on out-of-memory.
pub trait FrameAlloc {
    /// Allocate one zeroed 4 KiB frame.
    fn alloc_zeroed(&self) -> Option<Mfn>;

    /// Return a frame obtained from [`alloc_zeroed`](Self::alloc_zeroed).
    fn free(&self, mfn: Mfn);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramePoolError {
    #[error("frame pool must contain at least one frame")]
    Empty,
    #[error("frame range starting at {base} with {count} frames does not fit the frame field")]
    OutOfRange { base: Mfn, count: usize },
}

/// Bookkeeping guarded by the pool lock.
struct PoolState {
    /// One bit per frame; set = allocated.
    used: Vec<u64>,
    /// Search hint: first word that may contain a free bit.
    next_word: usize,
}

/// Host-memory backed pool of machine frames.
///
/// ### Numbering
/// Frame `i` of the backing array has machine frame number `base + i`.
///
/// ### Example
/// ```rust
/// use kernel_alloc::{FrameAlloc, FramePool, PhysMapper};
/// use kernel_memory_addresses::Mfn;
///
/// let pool = FramePool::new(Mfn::new(0x8_0000), 4).unwrap();
/// let mfn = pool.alloc_zeroed().unwrap();
/// {
///     let frame = pool.map_guarded(mfn).unwrap();
///     frame.store(3, 0xdead);
///     assert_eq!(frame.load(3), 0xdead);
/// }
/// pool.free(mfn);
/// assert_eq!(pool.allocated(), 0);
/// assert_eq!(pool.live_mappings(), 0);
/// ```
pub struct FramePool {
    base: Mfn,
    frames: Box<[RawFrame]>,
    state: SpinLock<PoolState>,
    allocated: AtomicUsize,
    pub(crate) mapped: AtomicUsize,
    /// Allocations left before injected failures start; `u64::MAX` = unlimited.
    budget: AtomicU64,
}

impl FramePool {
    /// Create a pool of `count` zeroed frames numbered from `base`.
    ///
    /// # Errors
    /// [`FramePoolError::Empty`] for `count == 0`, and
    /// [`FramePoolError::OutOfRange`] if the last frame number would not be
    /// a valid [`Mfn`].
    pub fn new(base: Mfn, count: usize) -> Result<Self, FramePoolError> {
        if count == 0 {
            return Err(FramePoolError::Empty);
        }
        let last = base.as_u64().checked_add(count as u64 - 1);
        if !last.is_some_and(|l| Mfn::new(l).is_valid()) {
            return Err(FramePoolError::OutOfRange { base, count });
        }

        let frames: Vec<RawFrame> = (0..count).map(|_| RawFrame::zeroed()).collect();
        let mut used = vec![0u64; count.div_ceil(64)];
        // bits past the end are permanently "allocated"
        let tail = count % 64;
        if tail != 0
            && let Some(last) = used.last_mut()
        {
            *last = !0u64 << tail;
        }

        log::debug!("frame pool: {count} frames at {base}");
        Ok(Self {
            base,
            frames: frames.into_boxed_slice(),
            state: SpinLock::new(PoolState { used, next_word: 0 }),
            allocated: AtomicUsize::new(0),
            mapped: AtomicUsize::new(0),
            budget: AtomicU64::new(u64::MAX),
        })
    }

    /// First machine frame number of the pool.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> Mfn {
        self.base
    }

    /// Total number of frames.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Frames currently handed out.
    #[inline]
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Mappings taken via [`PhysMapper::map`](crate::PhysMapper::map) and not
    /// yet released.
    #[inline]
    #[must_use]
    pub fn live_mappings(&self) -> usize {
        self.mapped.load(Ordering::Relaxed)
    }

    /// Let the next `n` allocations succeed, then fail all later ones.
    pub fn fail_after(&self, n: u64) {
        self.budget.store(n, Ordering::Relaxed);
    }

    /// Undo [`fail_after`](Self::fail_after).
    pub fn clear_failures(&self) {
        self.budget.store(u64::MAX, Ordering::Relaxed);
    }

    /// `true` if `mfn` belongs to this pool and is currently allocated.
    #[must_use]
    pub fn is_allocated(&self, mfn: Mfn) -> bool {
        let Some(i) = self.index_of(mfn) else {
            return false;
        };
        let state = self.state.lock();
        state.used[i / 64] & (1 << (i % 64)) != 0
    }

    pub(crate) fn index_of(&self, mfn: Mfn) -> Option<usize> {
        let i = mfn.as_u64().checked_sub(self.base.as_u64())?;
        let i = usize::try_from(i).ok()?;
        (i < self.frames.len()).then_some(i)
    }

    pub(crate) fn frame(&self, i: usize) -> &RawFrame {
        &self.frames[i]
    }

    /// Consume one unit of the failure-injection budget.
    fn take_budget(&self) -> bool {
        self.budget
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |b| match b {
                u64::MAX => Some(u64::MAX),
                0 => None,
                b => Some(b - 1),
            })
            .is_ok()
    }
}

impl FrameAlloc for FramePool {
    fn alloc_zeroed(&self) -> Option<Mfn> {
        if !self.take_budget() {
            log::trace!("frame pool: injected allocation failure");
            return None;
        }

        let index = {
            let mut state = self.state.lock();
            let words = state.used.len();
            let start = state.next_word;
            let found = (0..words)
                .map(|k| (start + k) % words)
                .find(|&w| state.used[w] != !0u64);
            let Some(w) = found else {
                log::warn!("frame pool exhausted ({} frames)", self.frames.len());
                return None;
            };
            let bit = state.used[w].trailing_ones() as usize;
            state.used[w] |= 1 << bit;
            state.next_word = w;
            w * 64 + bit
        };

        self.frames[index].zero();
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Some(self.base + index as u64)
    }

    fn free(&self, mfn: Mfn) {
        let Some(i) = self.index_of(mfn) else {
            log::warn!("frame pool: free of foreign frame {mfn}");
            return;
        };
        let mut state = self.state.lock();
        let mask = 1u64 << (i % 64);
        if state.used[i / 64] & mask == 0 {
            log::warn!("frame pool: double free of {mfn}");
            debug_assert!(false, "double free of {mfn}");
            return;
        }
        state.used[i / 64] &= !mask;
        state.next_word = state.next_word.min(i / 64);
        drop(state);
        self.allocated.fetch_sub(1, Ordering::Relaxed);
    }
}
