use crate::{FrameNumber, Gfn, PageOrder};
use core::fmt;
use core::ops::Add;

/// Machine frame number: the page-granular address of real backing memory.
///
/// ### Sentinels
/// - [`Mfn::INVALID`]: "no frame". It is the largest value the 40-bit frame
///   field of a translation entry can hold, so it survives an encode/decode
///   round trip unchanged.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let mfn = Mfn::new(0x10000);
/// assert!(mfn.is_valid());
/// assert!(mfn.is_aligned(PageOrder::Size2M));
/// assert_eq!((mfn + 0x10).as_u64(), 0x10010);
/// assert!(!Mfn::INVALID.is_valid());
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Mfn(pub(crate) FrameNumber);

impl Mfn {
    /// Number of bits a machine frame number occupies inside an entry.
    pub const BITS: u32 = 40;

    /// The "no frame" sentinel.
    pub const INVALID: Self = Self(FrameNumber::new((1 << Self::BITS) - 1));

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

    /// `true` unless this is [`Mfn::INVALID`] or does not fit an entry.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.as_u64() < Self::INVALID.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, order: PageOrder) -> bool {
        self.0.is_aligned(order)
    }

    #[inline]
    #[must_use]
    pub const fn offset(self, frames: u64) -> Self {
        Self(FrameNumber::new(self.0.as_u64() + frames))
    }

    /// Reinterpret as a guest frame number (identity-mapped test setups).
    #[inline]
    #[must_use]
    pub const fn as_gfn(self) -> Gfn {
        Gfn(self.0)
    }
}

impl fmt::Debug for Mfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            f.write_str("Mfn(INVALID)")
        } else {
            write!(f, "Mfn({:#x})", self.as_u64())
        }
    }
}

impl fmt::Display for Mfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<u64> for Mfn {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<Mfn> for u64 {
    #[inline]
    fn from(m: Mfn) -> Self {
        m.as_u64()
    }
}

impl Add<u64> for Mfn {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        self.offset(rhs)
    }
}
