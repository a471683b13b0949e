//! # Raw 4 KiB Frames
//!
//! A [`RawFrame`] is the in-memory image of one machine frame, viewed as 512
//! 64-bit words. Every word is an [`AtomicU64`], so a frame can be shared
//! between a writer holding a lock and lock-free readers without any `&mut`
//! aliasing: each load or store of a word is indivisible.

use core::sync::atomic::{AtomicU64, Ordering};

/// Number of 64-bit words in a frame.
pub const FRAME_WORDS: usize = 512;

/// One 4 KiB, 4 KiB-aligned frame of atomic words.
#[repr(C, align(4096))]
pub struct RawFrame {
    words: [AtomicU64; FRAME_WORDS],
}

impl RawFrame {
    /// A zero-filled frame.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            words: [const { AtomicU64::new(0) }; FRAME_WORDS],
        }
    }

    /// Borrow word `i` for atomic access.
    ///
    /// # Panics
    /// If `i >= 512`.
    #[inline]
    #[must_use]
    pub fn word(&self, i: usize) -> &AtomicU64 {
        &self.words[i]
    }

    /// Single atomic load of word `i` (acquire).
    #[inline]
    #[must_use]
    pub fn load(&self, i: usize) -> u64 {
        self.words[i].load(Ordering::Acquire)
    }

    /// Single atomic store of word `i` (release).
    #[inline]
    pub fn store(&self, i: usize, value: u64) {
        self.words[i].store(value, Ordering::Release);
    }

    /// Overwrite every word with `value`.
    pub fn fill(&self, value: u64) {
        for w in &self.words {
            w.store(value, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn zero(&self) {
        self.fill(0);
    }

    #[inline]
    #[must_use]
    pub const fn words(&self) -> &[AtomicU64; FRAME_WORDS] {
        &self.words
    }
}

impl Default for RawFrame {
    fn default() -> Self {
        Self::zeroed()
    }
}

const _: () = {
    assert!(size_of::<RawFrame>() == 4096);
    assert!(align_of::<RawFrame>() == 4096);
};
