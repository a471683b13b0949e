//! # Log-Dirty Trie Geometry
//!
//! ```text
//!  pfn bits:  41 ........ 33 32 ........ 24 23 ........ 15 14 ............ 0
//!            |  L4 (top)    |  L3          |  L2          |  L1 bitmap bit   |
//! ```

/// Bits per leaf bitmap (one 4 KiB page).
pub const LEAF_BITS: u32 = 15;

/// Frames tracked by one leaf bitmap.
pub const LEAF_FRAMES: u64 = 1 << LEAF_BITS;

/// Bits resolved per interior level.
pub const NODE_ORDER: u32 = 9;

/// Entries per interior node.
pub const NODE_ENTRIES: usize = 1 << NODE_ORDER;

/// Shift of the L2 index within a pfn.
pub const L2_SHIFT: u32 = LEAF_BITS;

/// Shift of the L3 index within a pfn.
pub const L3_SHIFT: u32 = L2_SHIFT + NODE_ORDER;

/// Shift of the L4 (top) index within a pfn.
pub const L4_SHIFT: u32 = L3_SHIFT + NODE_ORDER;

/// Highest pfn the trie can record.
pub const MAX_PFN: u64 = (1 << (L4_SHIFT + NODE_ORDER)) - 1;

/// Most frames one read may cover (4 TiB of guest memory, a 128 MiB bitmap).
pub const MAX_READ_FRAMES: u64 = 1 << 30;

const _: () = {
    assert!(LEAF_FRAMES == 4096 * 8);
    assert!(L4_SHIFT == 33);
    assert!(MAX_READ_FRAMES <= MAX_PFN + 1);
};
