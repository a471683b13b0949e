//! # Per-CPU Translation Cache
//!
//! Remembers which level-0 table covers a 2 MiB-aligned gfn prefix so that
//! repeated accesses to neighbouring frames skip the root-to-leaf walk.
//!
//! ```text
//!   gfn >> 9 ──► prefix ─┬─► set slot          (set_entry, level-0 targets)
//!                        └─► get[prefix % 4]   (lookups)
//! ```
//!
//! The cache is stamped with the identity and epoch of the address space it
//! was filled from. Any non-leaf change bumps the address-space epoch, so the
//! next use through a stale stamp flushes every slot and walks again.

use crate::node::CachedTable;
use kernel_info::p2m::GET_CACHE_SLOTS;
use kernel_memory_addresses::Gfn;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Line {
    prefix: u64,
    table: CachedTable,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Stamp {
    owner: u64,
    epoch: u64,
}

/// Cached level-0 tables of one CPU context.
#[derive(Debug, Clone, Default)]
pub struct L1Cache {
    stamp: Option<Stamp>,
    set: Option<Line>,
    get: [Option<Line>; GET_CACHE_SLOTS],
}

#[inline]
pub(crate) const fn prefix_of(gfn: Gfn) -> u64 {
    gfn.as_u64() >> kernel_info::p2m::EPT_TABLE_ORDER
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn get_slot(prefix: u64) -> usize {
    (prefix % GET_CACHE_SLOTS as u64) as usize
}

impl L1Cache {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stamp: None,
            set: None,
            get: [None; GET_CACHE_SLOTS],
        }
    }

    /// Drop every line.
    pub fn flush(&mut self) {
        *self = Self::new();
    }

    /// Flush unless the stamp matches, then adopt `(owner, epoch)`.
    fn validate(&mut self, owner: u64, epoch: u64) {
        let stamp = Stamp { owner, epoch };
        if self.stamp != Some(stamp) {
            self.flush();
            self.stamp = Some(stamp);
        }
    }

    pub(crate) fn lookup_set(&mut self, owner: u64, epoch: u64, gfn: Gfn) -> Option<CachedTable> {
        self.validate(owner, epoch);
        let prefix = prefix_of(gfn);
        self.set.filter(|l| l.prefix == prefix).map(|l| l.table)
    }

    pub(crate) fn fill_set(&mut self, owner: u64, epoch: u64, gfn: Gfn, table: CachedTable) {
        self.validate(owner, epoch);
        self.set = Some(Line {
            prefix: prefix_of(gfn),
            table,
        });
    }

    pub(crate) fn lookup_get(&mut self, owner: u64, epoch: u64, gfn: Gfn) -> Option<CachedTable> {
        self.validate(owner, epoch);
        let prefix = prefix_of(gfn);
        self.get[get_slot(prefix)]
            .filter(|l| l.prefix == prefix)
            .map(|l| l.table)
    }

    pub(crate) fn fill_get(&mut self, owner: u64, epoch: u64, gfn: Gfn, table: CachedTable) {
        self.validate(owner, epoch);
        let prefix = prefix_of(gfn);
        self.get[get_slot(prefix)] = Some(Line { prefix, table });
    }

    /// Number of occupied lines.
    #[must_use]
    pub fn occupancy(&self) -> usize {
        usize::from(self.set.is_some()) + self.get.iter().filter(|l| l.is_some()).count()
    }
}

/// Explicit per-CPU state passed to every address-space operation.
///
/// The `cpu` id is the owner under which the address-space lock is taken.
pub struct CpuContext {
    cpu: u32,
    cache: L1Cache,
}

impl CpuContext {
    /// # Panics
    /// If `cpu` is the reserved [`NO_OWNER`](kernel_sync::NO_OWNER) id.
    #[must_use]
    pub const fn new(cpu: u32) -> Self {
        assert!(cpu != kernel_sync::NO_OWNER, "reserved cpu id");
        Self {
            cpu,
            cache: L1Cache::new(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn cpu(&self) -> u32 {
        self.cpu
    }

    #[inline]
    #[must_use]
    pub const fn cache(&self) -> &L1Cache {
        &self.cache
    }

    #[inline]
    pub(crate) const fn cache_mut(&mut self) -> &mut L1Cache {
        &mut self.cache
    }

    pub fn flush(&mut self) {
        self.cache.flush();
    }
}
