//! # EPT Entries
//!
//! One 64-bit word describes either a child node (an *intermediate* entry), a
//! leaf mapping at its level (4 KiB at level 0, 2 MiB or 1 GiB superpages at
//! levels 1 and 2), or nothing at all (the all-zero *empty* entry).
//!
//! The hardware permission bits of a leaf are never set by hand: they are
//! derived from the semantic [`P2mType`] and [`P2mAccess`] by
//! [`EptEntry::with_type_flags`], so a leaf always reads the same way
//! regardless of which code path wrote it.

use bitfield_struct::bitfield;
use kernel_memory_addresses::Mfn;

/// Semantic type of a guest frame, stored in bits 8..=11 of a leaf.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum P2mType {
    /// Nothing mapped; always written as an empty entry.
    Invalid = 0,
    /// Ordinary read-write RAM.
    RamRw = 1,
    /// Read-only RAM.
    RamRo = 2,
    /// RAM write-protected to record writes for migration.
    RamLogDirty = 3,
    /// Device memory passed straight through to the guest.
    MmioDirect = 4,
    /// Device memory emulated by the device model; every access traps.
    MmioDm = 5,
    /// Not yet backed; a frame is supplied on first access.
    PopulateOnDemand = 6,
}

impl P2mType {
    /// Decode bits 8..=11; unknown encodings read as [`P2mType::Invalid`].
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::RamRw,
            2 => Self::RamRo,
            3 => Self::RamLogDirty,
            4 => Self::MmioDirect,
            5 => Self::MmioDm,
            6 => Self::PopulateOnDemand,
            _ => Self::Invalid,
        }
    }

    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    /// RAM of any flavour: read-write, read-only, or log-dirty.
    #[inline]
    #[must_use]
    pub const fn is_ram(self) -> bool {
        matches!(self, Self::RamRw | Self::RamRo | Self::RamLogDirty)
    }

    #[inline]
    #[must_use]
    pub const fn is_mmio(self) -> bool {
        matches!(self, Self::MmioDirect | Self::MmioDm)
    }

    #[inline]
    #[must_use]
    pub const fn is_pod(self) -> bool {
        matches!(self, Self::PopulateOnDemand)
    }

    /// Types whose memory type is resolved by the memory-type hook.
    #[inline]
    #[must_use]
    pub const fn has_emt(self) -> bool {
        self.is_ram() || matches!(self, Self::MmioDirect)
    }
}

/// Access restriction applied on top of the type's permissions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum P2mAccess {
    N = 0,
    R = 1,
    W = 2,
    RW = 3,
    X = 4,
    RX = 5,
    WX = 6,
    RWX = 7,
    /// Read-execute now; promoted to read-write on the first write fault.
    RX2RW = 8,
}

impl P2mAccess {
    /// Decode bits 52..=55; unknown encodings read as [`P2mAccess::N`].
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::R,
            2 => Self::W,
            3 => Self::RW,
            4 => Self::X,
            5 => Self::RX,
            6 => Self::WX,
            7 => Self::RWX,
            8 => Self::RX2RW,
            _ => Self::N,
        }
    }

    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    /// Permission mask this access right leaves standing.
    #[must_use]
    pub const fn mask(self) -> Rwx {
        match self {
            Self::N => Rwx::NONE,
            Self::R => Rwx::R,
            Self::W => Rwx::W,
            Self::X => Rwx::X,
            Self::RX | Self::RX2RW => Rwx(Rwx::R.0 | Rwx::X.0),
            Self::WX => Rwx(Rwx::W.0 | Rwx::X.0),
            Self::RW => Rwx(Rwx::R.0 | Rwx::W.0),
            Self::RWX => Rwx::ALL,
        }
    }
}

/// Hardware permission bits 0..=2 (`r`, `w`, `x`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Rwx(u8);

impl Rwx {
    pub const NONE: Self = Self(0);
    pub const R: Self = Self(0b001);
    pub const W: Self = Self(0b010);
    pub const X: Self = Self(0b100);
    pub const ALL: Self = Self(0b111);

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Permissions granted by `ty` before the access restriction.
    ///
    /// `backed` is the type's frame predicate: for
    /// [`PopulateOnDemand`](P2mType::PopulateOnDemand) whether the entry
    /// carries a backing hint; for [`MmioDirect`](P2mType::MmioDirect) whether
    /// the frame is writable (not in the read-only MMIO set). Other types
    /// ignore it.
    #[must_use]
    pub const fn for_type(ty: P2mType, backed: bool) -> Self {
        match ty {
            P2mType::Invalid | P2mType::MmioDm => Self::NONE,
            P2mType::RamRw => Self::ALL,
            P2mType::RamRo | P2mType::RamLogDirty => Self(Self::R.0 | Self::X.0),
            P2mType::MmioDirect if backed => Self::ALL,
            P2mType::MmioDirect => Self(Self::R.0 | Self::X.0),
            P2mType::PopulateOnDemand if backed => Self(Self::R.0 | Self::X.0),
            P2mType::PopulateOnDemand => Self::NONE,
        }
    }
}

/// Effective memory type of a leaf (bits 3..=6).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryType {
    /// Cacheability (`emt`).
    pub emt: u8,
    /// Ignore the guest's PAT (`ipat`).
    pub ipat: bool,
}

impl MemoryType {
    pub const UNCACHEABLE: u8 = 0;
    pub const WRITE_BACK: u8 = 6;

    /// Write-back, guest PAT honoured.
    pub const RAM: Self = Self {
        emt: Self::WRITE_BACK,
        ipat: false,
    };

    /// Uncacheable, guest PAT ignored.
    pub const DEVICE: Self = Self {
        emt: Self::UNCACHEABLE,
        ipat: true,
    };
}

/// A single EPT entry in its raw bitfield form.
///
/// ### Bit layout
///
/// | Bits  | Field         | Meaning |
/// |-------|---------------|---------|
/// | 0     | `r`           | read permission |
/// | 1     | `w`           | write permission |
/// | 2     | `x`           | execute permission |
/// | 3-5   | `emt`         | effective memory type |
/// | 6     | `ipat`        | ignore guest PAT |
/// | 7     | `sp`          | superpage leaf (levels 1 and 2 only) |
/// | 8-11  | `p2m_type`    | [`P2mType`] |
/// | 12-51 | `mfn`         | machine frame number |
/// | 52-55 | `access`      | [`P2mAccess`] |
/// | 56-62 | `ptp_idx`     | node-slot hint (intermediate entries) |
/// | 63    | `suppress_ve` | reserved, always 0 |
///
/// ### Shapes
/// - **empty**: all bits zero
/// - **intermediate**: `sp == 0`, `rwx == 111`, type `Invalid`, child node in
///   `mfn`, optional slot hint in `ptp_idx`
/// - **leaf**: everything else; at levels 1 and 2 `sp` is set
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::Mfn;
/// # use kernel_p2m::{EptEntry, P2mAccess, P2mType, Rwx};
/// let e = EptEntry::new()
///     .with_mfn(Mfn::new(0x2000))
///     .with_type_flags(P2mType::RamRo, P2mAccess::RWX, false);
/// assert_eq!(e.rwx(), Rwx::R.union(Rwx::X));
/// assert_eq!(e.p2m_type(), P2mType::RamRo);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct EptEntry {
    /// Read (bit 0).
    pub r: bool,
    /// Write (bit 1).
    pub w: bool,
    /// Execute (bit 2).
    pub x: bool,
    /// Effective memory type (bits 3..=5).
    #[bits(3)]
    pub emt: u8,
    /// Ignore guest PAT (bit 6).
    pub ipat: bool,
    /// Superpage leaf (bit 7).
    pub sp: bool,
    /// Raw [`P2mType`] (bits 8..=11).
    #[bits(4)]
    type_bits: u8,
    /// Machine frame number (bits 12..=51).
    #[bits(40)]
    mfn_bits: u64,
    /// Raw [`P2mAccess`] (bits 52..=55).
    #[bits(4)]
    access_bits: u8,
    /// Node-slot hint of an intermediate entry (bits 56..=62); 0 = none.
    #[bits(7)]
    pub ptp_idx: u8,
    /// Suppress #VE (bit 63); never set.
    pub suppress_ve: bool,
}

impl EptEntry {
    /// The all-zero entry.
    pub const EMPTY: Self = Self::new();

    /// Intermediate entry pointing at child node `child`.
    #[inline]
    #[must_use]
    pub const fn intermediate(child: Mfn, ptp_idx: u8) -> Self {
        Self::new()
            .with_rwx(Rwx::ALL)
            .with_mfn(child)
            .with_ptp_idx(ptp_idx)
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.into_bits() == 0
    }

    /// Any hardware permission bit set.
    ///
    /// This is the hardware's notion of presence: a POD placeholder without a
    /// hint or a leaf with access [`N`](P2mAccess::N) is not present, yet it is
    /// not [empty](Self::is_empty) either.
    #[inline]
    #[must_use]
    pub const fn is_present(&self) -> bool {
        self.rwx().0 != 0
    }

    /// Structural test for an entry at `level` that points to a child node.
    #[inline]
    #[must_use]
    pub const fn is_intermediate(&self, level: u8) -> bool {
        level > 0 && !self.is_empty() && !self.sp()
    }

    /// Structural test for a leaf mapping (including placeholders) at `level`.
    #[inline]
    #[must_use]
    pub const fn is_leaf(&self, level: u8) -> bool {
        !self.is_empty() && (level == 0 || self.sp())
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn rwx(&self) -> Rwx {
        Rwx((self.into_bits() & 0b111) as u8)
    }

    #[inline]
    #[must_use]
    pub const fn with_rwx(self, rwx: Rwx) -> Self {
        Self::from_bits((self.into_bits() & !0b111) | rwx.0 as u64)
    }

    #[inline]
    #[must_use]
    pub const fn mfn(&self) -> Mfn {
        Mfn::new(self.mfn_bits())
    }

    #[inline]
    #[must_use]
    pub const fn with_mfn(self, mfn: Mfn) -> Self {
        self.with_mfn_bits(mfn.as_u64())
    }

    #[inline]
    #[must_use]
    pub const fn p2m_type(&self) -> P2mType {
        P2mType::from_bits(self.type_bits())
    }

    #[inline]
    #[must_use]
    pub const fn with_p2m_type(self, ty: P2mType) -> Self {
        self.with_type_bits(ty.into_bits())
    }

    #[inline]
    #[must_use]
    pub const fn access(&self) -> P2mAccess {
        P2mAccess::from_bits(self.access_bits())
    }

    #[inline]
    #[must_use]
    pub const fn with_access(self, access: P2mAccess) -> Self {
        self.with_access_bits(access.into_bits())
    }

    #[inline]
    #[must_use]
    pub const fn memory_type(&self) -> MemoryType {
        MemoryType {
            emt: self.emt(),
            ipat: self.ipat(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn with_memory_type(self, mt: MemoryType) -> Self {
        self.with_emt(mt.emt).with_ipat(mt.ipat)
    }

    /// Store `ty` and `access` and derive `r`/`w`/`x` from them.
    ///
    /// `backed` is the frame predicate described at [`Rwx::for_type`].
    #[must_use]
    pub const fn with_type_flags(self, ty: P2mType, access: P2mAccess, backed: bool) -> Self {
        self.with_p2m_type(ty)
            .with_access(access)
            .with_rwx(Rwx::for_type(ty, backed).intersect(access.mask()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_TYPES: [P2mType; 7] = [
        P2mType::Invalid,
        P2mType::RamRw,
        P2mType::RamRo,
        P2mType::RamLogDirty,
        P2mType::MmioDirect,
        P2mType::MmioDm,
        P2mType::PopulateOnDemand,
    ];

    const ALL_ACCESS: [P2mAccess; 9] = [
        P2mAccess::N,
        P2mAccess::R,
        P2mAccess::W,
        P2mAccess::RW,
        P2mAccess::X,
        P2mAccess::RX,
        P2mAccess::WX,
        P2mAccess::RWX,
        P2mAccess::RX2RW,
    ];

    #[test]
    fn field_positions() {
        let e = EptEntry::new()
            .with_r(true)
            .with_emt(6)
            .with_sp(true)
            .with_p2m_type(P2mType::MmioDm)
            .with_mfn(Mfn::new(0xabcde))
            .with_access(P2mAccess::RX2RW)
            .with_ptp_idx(0x7f);
        let raw = e.into_bits();
        assert_eq!(raw & 1, 1);
        assert_eq!((raw >> 3) & 0b111, 6);
        assert_eq!((raw >> 7) & 1, 1);
        assert_eq!((raw >> 8) & 0xf, 5);
        assert_eq!((raw >> 12) & ((1 << 40) - 1), 0xabcde);
        assert_eq!((raw >> 52) & 0xf, 8);
        assert_eq!((raw >> 56) & 0x7f, 0x7f);
        assert_eq!(raw >> 63, 0);
    }

    #[test]
    fn invalid_mfn_fills_the_frame_field() {
        let e = EptEntry::new().with_mfn(Mfn::INVALID);
        assert_eq!(e.mfn(), Mfn::INVALID);
        assert!(!e.is_empty());
    }

    #[test]
    fn type_table_then_access_restriction() {
        let rx = Rwx::R.union(Rwx::X);
        assert_eq!(Rwx::for_type(P2mType::RamRw, false), Rwx::ALL);
        assert_eq!(Rwx::for_type(P2mType::RamRo, false), rx);
        assert_eq!(Rwx::for_type(P2mType::RamLogDirty, true), rx);
        assert_eq!(Rwx::for_type(P2mType::MmioDm, true), Rwx::NONE);
        assert_eq!(Rwx::for_type(P2mType::MmioDirect, true), Rwx::ALL);
        assert_eq!(Rwx::for_type(P2mType::MmioDirect, false), rx);
        assert_eq!(Rwx::for_type(P2mType::PopulateOnDemand, true), rx);
        assert_eq!(Rwx::for_type(P2mType::PopulateOnDemand, false), Rwx::NONE);

        assert_eq!(P2mAccess::RX2RW.mask(), P2mAccess::RX.mask());
        assert_eq!(P2mAccess::WX.mask(), Rwx::W.union(Rwx::X));
    }

    #[test]
    fn flags_are_a_function_of_type_and_access() {
        for ty in ALL_TYPES {
            for access in ALL_ACCESS {
                for backed in [false, true] {
                    let e = EptEntry::new()
                        .with_mfn(Mfn::new(0x42))
                        .with_type_flags(ty, access, backed);
                    assert!(Rwx::for_type(ty, backed).contains(e.rwx()), "{ty:?} {access:?}");
                    assert!(access.mask().contains(e.rwx()), "{ty:?} {access:?}");
                    assert_eq!(e.p2m_type(), ty);
                    assert_eq!(e.access(), access);
                }
            }
        }
    }

    #[test]
    fn intermediate_shape() {
        let e = EptEntry::intermediate(Mfn::new(0x99), 3);
        assert!(e.is_present());
        assert!(e.is_intermediate(1));
        assert!(!e.is_leaf(1));
        assert!(e.is_leaf(0));
        assert_eq!(e.p2m_type(), P2mType::Invalid);
        assert_eq!(e.ptp_idx(), 3);
        assert!(!EptEntry::EMPTY.is_intermediate(2));
    }

    #[test]
    fn pod_placeholder_is_neither_empty_nor_present() {
        let e = EptEntry::new()
            .with_sp(true)
            .with_mfn(Mfn::INVALID)
            .with_type_flags(P2mType::PopulateOnDemand, P2mAccess::RWX, false);
        assert!(!e.is_empty());
        assert!(!e.is_present());
        assert!(e.is_leaf(1));
    }

    #[test]
    fn unknown_encodings_decode_conservatively() {
        assert_eq!(P2mType::from_bits(0xf), P2mType::Invalid);
        assert_eq!(P2mAccess::from_bits(0xf), P2mAccess::N);
    }
}
