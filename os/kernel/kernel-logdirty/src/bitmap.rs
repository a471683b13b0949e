use alloc::vec::Vec;
use kernel_memory_addresses::Gfn;

/// Dirty bits for a contiguous guest frame range.
///
/// Bit `i` describes frame `begin + i`; bits are packed LSB-first into
/// 64-bit words, so frame `begin + i` lives in word `i / 64`, bit `i % 64`.
#[derive(Clone, PartialEq, Eq)]
pub struct DirtyBitmap {
    begin: Gfn,
    nr: u64,
    words: Vec<u64>,
}

impl DirtyBitmap {
    /// An all-clean bitmap for `nr` frames from `begin`, or `None` if the
    /// words cannot be allocated.
    #[must_use]
    pub fn try_clean(begin: Gfn, nr: u64) -> Option<Self> {
        let n = usize::try_from(nr.div_ceil(64)).ok()?;
        let mut words = Vec::new();
        words.try_reserve_exact(n).ok()?;
        words.resize(n, 0);
        Some(Self { begin, nr, words })
    }

    #[inline]
    #[must_use]
    pub const fn begin(&self) -> Gfn {
        self.begin
    }

    /// Number of frames described.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.nr
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.nr == 0
    }

    /// Dirty state of frame `begin + i`; `false` outside the range.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn is_set(&self, i: u64) -> bool {
        i < self.nr && self.words[(i / 64) as usize] & (1 << (i % 64)) != 0
    }

    /// Dirty state of `gfn`; `false` outside the range.
    #[must_use]
    pub fn contains_dirty(&self, gfn: Gfn) -> bool {
        gfn.as_u64()
            .checked_sub(self.begin.as_u64())
            .is_some_and(|i| self.is_set(i))
    }

    /// Number of dirty frames.
    #[must_use]
    pub fn count_dirty(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    /// Dirty frames in ascending order.
    pub fn iter_dirty(&self) -> impl Iterator<Item = Gfn> + '_ {
        self.words.iter().enumerate().flat_map(move |(w, &bits)| {
            let base = self.begin.as_u64() + w as u64 * 64;
            BitIter(bits).map(move |b| Gfn::new(base + u64::from(b)))
        })
    }

    /// Packed words, LSB-first.
    #[inline]
    #[must_use]
    pub fn as_words(&self) -> &[u64] {
        &self.words
    }

    /// Packed bytes, LSB-first, `ceil(len / 8)` long.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes: Vec<u8> = self.words.iter().flat_map(|w| w.to_le_bytes()).collect();
        bytes.truncate(self.nr.div_ceil(8) as usize);
        bytes
    }

    /// OR the low `n` bits of `value` in at bit offset `at`.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn put_bits(&mut self, at: u64, value: u64, n: u32) {
        debug_assert!(n <= 64 && at + u64::from(n) <= self.nr);
        if n == 0 || value == 0 {
            return;
        }
        let w = (at / 64) as usize;
        let off = (at % 64) as u32;
        self.words[w] |= value << off;
        if off != 0 && n > 64 - off {
            self.words[w + 1] |= value >> (64 - off);
        }
    }
}

impl core::fmt::Debug for DirtyBitmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DirtyBitmap")
            .field("begin", &self.begin)
            .field("len", &self.nr)
            .field("dirty", &self.count_dirty())
            .finish()
    }
}

struct BitIter(u64);

impl Iterator for BitIter {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.0 == 0 {
            return None;
        }
        let b = self.0.trailing_zeros();
        self.0 &= self.0 - 1;
        Some(b)
    }
}
