use crate::{FrameNumber, PageOrder};
use core::fmt;
use core::ops::Add;

/// Guest frame number: the page-granular "physical" address the guest sees.
///
/// A `Gfn` is a thin wrapper over [`FrameNumber`] with guest intent, so guest
/// and machine frames cannot be mixed up at compile time.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let gfn = Gfn::new(0x1234);
/// assert_eq!(gfn.align_down(PageOrder::Size2M).as_u64(), 0x1200);
/// assert_eq!(gfn.offset_in(PageOrder::Size2M), 0x34);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Gfn(pub(crate) FrameNumber);

impl Gfn {
    /// "No guest frame"; dirty marking ignores it.
    pub const INVALID: Self = Self(FrameNumber::new(u64::MAX));

    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(FrameNumber::new(v))
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, order: PageOrder) -> bool {
        self.0.is_aligned(order)
    }

    #[inline]
    #[must_use]
    pub const fn align_down(self, order: PageOrder) -> Self {
        Self(self.0.align_down(order))
    }

    #[inline]
    #[must_use]
    pub const fn offset_in(self, order: PageOrder) -> u64 {
        self.0.offset_in(order)
    }

    #[inline]
    #[must_use]
    pub const fn offset(self, frames: u64) -> Self {
        Self(FrameNumber::new(self.0.as_u64() + frames))
    }

    /// Last frame of the `order` block starting at this frame.
    #[inline]
    #[must_use]
    pub const fn last_in(self, order: PageOrder) -> Self {
        self.offset(order.frames() - 1)
    }
}

impl fmt::Debug for Gfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gfn({:#x})", self.as_u64())
    }
}

impl fmt::Display for Gfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<u64> for Gfn {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<Gfn> for u64 {
    #[inline]
    fn from(g: Gfn) -> Self {
        g.as_u64()
    }
}

impl Add<u64> for Gfn {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        self.offset(rhs)
    }
}
