use crate::PageOrder;
use core::fmt;
use core::ops::{Add, AddAssign};

/// Principal raw frame number ([guest](super::Gfn) or [machine](super::Mfn)).
///
/// A frame number counts 4 KiB frames, i.e. it is an address shifted right by
/// [`FRAME_SHIFT`](crate::FRAME_SHIFT).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FrameNumber(u64);

impl FrameNumber {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// `true` if this frame number is a multiple of `2^order`.
    #[inline]
    #[must_use]
    pub const fn is_aligned(self, order: PageOrder) -> bool {
        self.0 & order.mask() == 0
    }

    /// Align down to the start of the `order` block containing this frame.
    #[inline]
    #[must_use]
    pub const fn align_down(self, order: PageOrder) -> Self {
        Self(self.0 & !order.mask())
    }

    /// The offset of this frame within its `order` block.
    #[inline]
    #[must_use]
    pub const fn offset_in(self, order: PageOrder) -> u64 {
        self.0 & order.mask()
    }

    /// Byte address of the first byte in this frame.
    #[inline]
    #[must_use]
    pub const fn to_address(self) -> u64 {
        self.0 << crate::FRAME_SHIFT
    }
}

impl fmt::Debug for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameNumber({:#x})", self.0)
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for FrameNumber {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<FrameNumber> for u64 {
    #[inline]
    fn from(f: FrameNumber) -> Self {
        f.as_u64()
    }
}

impl Add<u64> for FrameNumber {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for FrameNumber {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}
