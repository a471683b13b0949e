//! # Frame Mapping
//!
//! Code can only touch memory it can address. [`PhysMapper`] abstracts how a
//! machine frame number becomes an addressable [`RawFrame`]: a direct map, a
//! temporary mapping slot, or (for [`FramePool`]) plain host memory.
//!
//! Mappings are *ephemeral*: every successful [`map`](PhysMapper::map) must be
//! paired with an [`unmap`](PhysMapper::unmap). [`MappedFrame`] is the RAII
//! guard that does this on every exit path, including early returns and
//! unwinding.

use crate::frame_alloc::FramePool;
use crate::raw_frame::RawFrame;
use core::ops::Deref;
use core::sync::atomic::Ordering;
use kernel_memory_addresses::Mfn;

/// Makes machine frames addressable for a bounded time.
pub trait PhysMapper {
    /// Map `mfn`; `None` if the frame cannot be addressed by this mapper.
    fn map(&self, mfn: Mfn) -> Option<&RawFrame>;

    /// Release a mapping obtained from [`map`](Self::map).
    fn unmap(&self, frame: &RawFrame);

    /// [`map`](Self::map) wrapped in a guard that unmaps on drop.
    fn map_guarded(&self, mfn: Mfn) -> Option<MappedFrame<'_, Self>> {
        self.map(mfn).map(|frame| MappedFrame {
            frame,
            mapper: self,
        })
    }
}

/// A mapped frame; unmapped when dropped.
pub struct MappedFrame<'m, M: PhysMapper + ?Sized> {
    frame: &'m RawFrame,
    mapper: &'m M,
}

impl<'m, M: PhysMapper + ?Sized> MappedFrame<'m, M> {
    /// The mapped frame with the guard's full lifetime.
    ///
    /// The reference must not be used after the guard is dropped; callers
    /// that need that use [`core::mem::forget`] and call
    /// [`PhysMapper::unmap`] themselves.
    #[inline]
    #[must_use]
    pub const fn frame(&self) -> &'m RawFrame {
        self.frame
    }
}

impl<M: PhysMapper + ?Sized> Deref for MappedFrame<'_, M> {
    type Target = RawFrame;

    fn deref(&self) -> &RawFrame {
        self.frame
    }
}

impl<M: PhysMapper + ?Sized> Drop for MappedFrame<'_, M> {
    fn drop(&mut self) {
        self.mapper.unmap(self.frame);
    }
}

impl PhysMapper for FramePool {
    fn map(&self, mfn: Mfn) -> Option<&RawFrame> {
        let i = self.index_of(mfn)?;
        self.mapped.fetch_add(1, Ordering::Relaxed);
        Some(self.frame(i))
    }

    fn unmap(&self, _frame: &RawFrame) {
        let prev = self.mapped.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "unbalanced unmap");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameAlloc;

    #[test]
    fn guard_releases_mapping() {
        let pool = FramePool::new(Mfn::new(0x40), 2).unwrap();
        let mfn = pool.alloc_zeroed().unwrap();
        {
            let a = pool.map_guarded(mfn).unwrap();
            let b = pool.map_guarded(mfn).unwrap();
            assert_eq!(pool.live_mappings(), 2);
            a.store(0, 1);
            assert_eq!(b.load(0), 1);
        }
        assert_eq!(pool.live_mappings(), 0);
    }

    #[test]
    fn foreign_frames_do_not_map() {
        let pool = FramePool::new(Mfn::new(0x40), 2).unwrap();
        assert!(pool.map(Mfn::new(0x3f)).is_none());
        assert!(pool.map(Mfn::new(0x42)).is_none());
        assert!(pool.map(Mfn::INVALID).is_none());
        assert_eq!(pool.live_mappings(), 0);
    }

    #[test]
    fn guard_releases_on_unwind() {
        let pool = FramePool::new(Mfn::new(0x40), 1).unwrap();
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _g = pool.map_guarded(Mfn::new(0x40)).unwrap();
            panic!("boom");
        }));
        assert!(res.is_err());
        assert_eq!(pool.live_mappings(), 0);
    }
}
