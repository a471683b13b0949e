use core::fmt;

/// Mapping granularity, expressed as a power-of-two number of 4 KiB frames.
///
/// Each step is one radix level (9 bits) of the translation tree:
///
/// | Variant | Order | Frames | Tree level |
/// |---------|-------|--------|------------|
/// | [`Size4K`](Self::Size4K) | 0  | 1       | 0 |
/// | [`Size2M`](Self::Size2M) | 9  | 512     | 1 |
/// | [`Size1G`](Self::Size1G) | 18 | 262 144 | 2 |
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u32)]
pub enum PageOrder {
    /// 4 KiB base page.
    Size4K = 0,
    /// 2 MiB superpage.
    Size2M = 9,
    /// 1 GiB superpage.
    Size1G = 18,
}

impl PageOrder {
    /// Bits of frame number consumed per tree level.
    pub const LEVEL_STRIDE: u32 = 9;

    /// Parse a raw order; only the three supported granularities are accepted.
    #[inline]
    #[must_use]
    pub const fn from_order(order: u32) -> Option<Self> {
        match order {
            0 => Some(Self::Size4K),
            9 => Some(Self::Size2M),
            18 => Some(Self::Size1G),
            _ => None,
        }
    }

    /// The order whose leaf lives at tree `level`.
    #[inline]
    #[must_use]
    pub const fn from_level(level: u8) -> Option<Self> {
        Self::from_order(level as u32 * Self::LEVEL_STRIDE)
    }

    #[inline]
    #[must_use]
    pub const fn order(self) -> u32 {
        self as u32
    }

    /// Tree level at which a leaf of this order is stored.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn level(self) -> u8 {
        (self.order() / Self::LEVEL_STRIDE) as u8
    }

    /// Number of 4 KiB frames covered.
    #[inline]
    #[must_use]
    pub const fn frames(self) -> u64 {
        1 << self.order()
    }

    /// `frames() - 1`; the low bits that must be zero for alignment.
    #[inline]
    #[must_use]
    pub const fn mask(self) -> u64 {
        self.frames() - 1
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Size4K => "4K",
            Self::Size2M => "2M",
            Self::Size1G => "1G",
        }
    }
}

impl fmt::Display for PageOrder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for PageOrder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self, f)
    }
}
