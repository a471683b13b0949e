//! Diagnostics: single-gfn walks and whole-tree dumps, written to the log.

use crate::entry::EptEntry;
use crate::hooks::P2mHooks;
use crate::node::TableRef;
use crate::p2m::P2m;
use crate::walk::{entry_span, leaf_order, table_index};
use alloc::vec::Vec;
use kernel_alloc::{FrameAlloc, PhysMapper};
use kernel_info::p2m::{EPT_ENTRIES, MAX_GFN, WALK_LEVELS};
use kernel_memory_addresses::Gfn;

impl<'m, A: FrameAlloc, M: PhysMapper, H: P2mHooks> P2m<'m, A, M, H> {
    /// The entries visited from the root towards the leaf for `gfn`, as
    /// `(level, entry)` pairs.
    #[must_use]
    pub fn walk_table(&self, gfn: Gfn) -> Vec<(u8, EptEntry)> {
        let mut path = Vec::new();
        if gfn.as_u64() > MAX_GFN {
            log::info!("d{}: {gfn} is outside the guest frame space", self.domain());
            return path;
        }

        log::info!("d{}: walking {gfn} from root {}", self.domain(), self.root());
        let mut table = self.open_root();
        let mut level = WALK_LEVELS;
        loop {
            let i = table_index(gfn, level);
            let e = table.entry(i);
            log::info!(
                "d{}:  level {level} [{i:3}] {:#018x} mfn {} {:?} {:?}",
                self.domain(),
                e.into_bits(),
                e.mfn(),
                e.p2m_type(),
                e.access()
            );
            path.push((level, e));
            if !e.is_intermediate(level) {
                break;
            }
            table = self.open(e.mfn(), e.ptp_idx());
            log::trace!("d{}:  -> node {}", self.domain(), table.mfn());
            level -= 1;
        }
        path
    }

    /// Log every leaf that maps a frame or is a POD placeholder. Returns the
    /// number of records written.
    pub fn dump_table(&self) -> u64 {
        let root = self.open_root();
        log::info!("d{}: p2m dump, root {}", self.domain(), root.mfn());
        let records = self.dump_node(&root, WALK_LEVELS, Gfn::new(0));
        log::info!("d{}: {records} mappings", self.domain());
        records
    }

    fn dump_node(&self, table: &TableRef<'m, M>, level: u8, base: Gfn) -> u64 {
        let mut records = 0;
        for i in 0..EPT_ENTRIES {
            let e = table.entry(i);
            if e.is_empty() {
                continue;
            }
            let gfn = base.offset(i as u64 * entry_span(level));
            if e.is_intermediate(level) {
                let child = self.open(e.mfn(), e.ptp_idx());
                records += self.dump_node(&child, level - 1, gfn);
                continue;
            }
            let pod = e.p2m_type().is_pod();
            if !pod && !e.mfn().is_valid() {
                continue;
            }
            log::info!(
                "d{}: gfn {:#x} mfn {} {} {:?}{}",
                self.domain(),
                gfn.as_u64(),
                e.mfn(),
                leaf_order(level),
                e.p2m_type(),
                if pod { " (pod)" } else { "" }
            );
            records += 1;
        }
        records
    }
}
