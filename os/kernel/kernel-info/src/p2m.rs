//! # P2M Tree Geometry

/// Bits of guest frame number resolved per tree level.
pub const EPT_TABLE_ORDER: u32 = 9;

/// Entries per radix node.
pub const EPT_ENTRIES: usize = 1 << EPT_TABLE_ORDER;

/// Number of levels below the root (the root is level [`WALK_LEVELS`]).
///
/// Level 0 holds 4 KiB leaves, level 1 may hold 2 MiB superpages,
/// level 2 may hold 1 GiB superpages, level 3 is the root (ASR).
pub const WALK_LEVELS: u8 = 3;

/// Width of a guest frame number the four-level tree can address.
pub const GFN_BITS: u32 = (WALK_LEVELS as u32 + 1) * EPT_TABLE_ORDER;

/// Highest addressable guest frame number.
pub const MAX_GFN: u64 = (1 << GFN_BITS) - 1;

/// Width of the node-slot index embedded in intermediate entries.
///
/// Slots whose index does not fit are found by scanning aliases with a stride
/// of [`PTP_IDX_STRIDE`].
pub const PTP_IDX_BITS: u32 = 7;

/// Distance between slot indices sharing the same embedded index.
pub const PTP_IDX_STRIDE: u16 = (1 << PTP_IDX_BITS) - 1;

/// Default number of pre-allocated node slots per address space.
pub const DEFAULT_NODE_SLOTS: u16 = 64;

/// Number of "get" translation-cache slots per CPU context.
pub const GET_CACHE_SLOTS: usize = 4;

/// Most frames one write fault inside the dirty-VRAM window unprotects.
pub const VRAM_FAULT_FRAMES: u32 = 32;

const _: () = {
    assert!(PTP_IDX_BITS <= 10);
    assert!(GET_CACHE_SLOTS.is_power_of_two());
    assert!(GFN_BITS == 36);
};
