use kernel_info::p2m::DEFAULT_NODE_SLOTS;
use kernel_memory_addresses::Mfn;
use utils_accessors_derive::Accessors;

/// Per-address-space settings fixed at construction.
///
/// ```rust
/// # use kernel_memory_addresses::Mfn;
/// # use kernel_p2m::P2mConfig;
/// const CFG: P2mConfig = P2mConfig::new(7)
///     .with_hap_1gb(false)
///     .with_node_slots(16)
///     .with_zero_page(Mfn::new(0x100));
/// assert_eq!(CFG.domain_id(), 7);
/// assert!(CFG.hap_2mb());
/// assert!(!CFG.hap_1gb());
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Accessors)]
pub struct P2mConfig {
    /// Owning domain; appears in log messages.
    domain_id: u16,
    /// Hardware can map 2 MiB leaves.
    hap_2mb: bool,
    /// Hardware can map 1 GiB leaves.
    hap_1gb: bool,
    /// Node frames pre-allocated and kept mapped for the lifetime of the
    /// address space. Slot 0 holds the root; 0 disables the arena.
    node_slots: u16,
    /// Shared all-zero frame used as a read-only POD backing, or
    /// [`Mfn::INVALID`] if there is none.
    zero_page: Mfn,
}

impl P2mConfig {
    #[must_use]
    pub const fn new(domain_id: u16) -> Self {
        Self {
            domain_id,
            hap_2mb: true,
            hap_1gb: true,
            node_slots: DEFAULT_NODE_SLOTS,
            zero_page: Mfn::INVALID,
        }
    }
}

impl Default for P2mConfig {
    fn default() -> Self {
        Self::new(0)
    }
}
