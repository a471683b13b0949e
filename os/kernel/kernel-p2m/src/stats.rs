use core::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of an address space's counters.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct P2mStats {
    /// `set_entry` calls that walked from the root.
    pub set_walks: u64,
    /// `set_entry` calls served by the CPU context's set slot.
    pub set_cached: u64,
    /// Lookups that walked from the root.
    pub get_walks: u64,
    /// Lookups served by a get slot.
    pub get_cached: u64,
    /// Nodes reached through the slot arena.
    pub map_direct: u64,
    /// Nodes reached through an ephemeral mapping.
    pub map_fallback: u64,
    /// Intermediate nodes installed by writing walks.
    pub top_down_fills: u64,
    /// Superpages split.
    pub splits: u64,
    /// POD entries backed with a frame.
    pub pod_populations: u64,
    /// `sync_domain` calls.
    pub syncs: u64,
    /// Level-0 POD entries currently in the tree.
    pub pod_entries: u64,
    /// POD superpage entries currently in the tree.
    pub pod_superpages: u64,
    /// Epoch of the translation caches.
    pub epoch: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub set_walks: AtomicU64,
    pub set_cached: AtomicU64,
    pub get_walks: AtomicU64,
    pub get_cached: AtomicU64,
    pub map_direct: AtomicU64,
    pub map_fallback: AtomicU64,
    pub top_down_fills: AtomicU64,
    pub splits: AtomicU64,
    pub pod_populations: AtomicU64,
    pub syncs: AtomicU64,
    pub pod_entries: AtomicU64,
    pub pod_superpages: AtomicU64,
}

#[inline]
pub(crate) fn bump(c: &AtomicU64) {
    c.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    /// Move the POD counters by the given signed amounts.
    pub fn pod_delta(&self, entries: i64, superpages: i64) {
        apply(&self.pod_entries, entries);
        apply(&self.pod_superpages, superpages);
    }

    pub fn snapshot(&self, epoch: u64) -> P2mStats {
        let r = |c: &AtomicU64| c.load(Ordering::Relaxed);
        P2mStats {
            set_walks: r(&self.set_walks),
            set_cached: r(&self.set_cached),
            get_walks: r(&self.get_walks),
            get_cached: r(&self.get_cached),
            map_direct: r(&self.map_direct),
            map_fallback: r(&self.map_fallback),
            top_down_fills: r(&self.top_down_fills),
            splits: r(&self.splits),
            pod_populations: r(&self.pod_populations),
            syncs: r(&self.syncs),
            pod_entries: r(&self.pod_entries),
            pod_superpages: r(&self.pod_superpages),
            epoch,
        }
    }
}

fn apply(c: &AtomicU64, delta: i64) {
    if delta >= 0 {
        c.fetch_add(delta.unsigned_abs(), Ordering::Relaxed);
    } else {
        c.fetch_sub(delta.unsigned_abs(), Ordering::Relaxed);
    }
}
