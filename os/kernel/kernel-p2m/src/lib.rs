//! # Guest-Physical to Machine Translation
//!
//! The P2M ("physical to machine") tree of a hardware-virtualised guest: a
//! four-level radix tree in the EPT format that maps guest frame numbers
//! ([`Gfn`]) to machine frame numbers ([`Mfn`]) together with a semantic type,
//! an access right, and a memory type.
//!
//! ## What you get
//! - [`P2m`]: one address space per guest, with map/unmap, lookup with
//!   populate-on-demand, superpage splitting, retyping, and teardown.
//! - [`EptEntry`]: the 64-bit entry format with typed accessors.
//! - [`CpuContext`]: explicit per-CPU state (lock owner id and translation
//!   cache) passed to every operation.
//! - [`P2mHooks`]: what the tree needs from the rest of the hypervisor.
//! - Log-dirty mode on top of [`kernel_logdirty::LogDirty`].
//!
//! ## Guest Frame Number → Machine Frame Walk
//!
//! A 36-bit gfn is divided into four 9-bit indices:
//!
//! ```text
//! | 35‒27 | 26‒18 | 17‒9 | 8‒0 |
//! |  L3   |  L2   |  L1  | L0  |
//! ```
//!
//! ```text
//!  root (L3) → L2 → L1 → L0 → machine frame
//!               │     │     └──► 4 KiB leaf
//!               │     └────────► sp=1 → 2 MiB leaf
//!               └──────────────► sp=1 → 1 GiB leaf
//! ```
//!
//! | Level | Entry covers | Leaf allowed |
//! |:------|:-------------|:-------------|
//! | 3 | 512 GiB | never (root) |
//! | 2 | 1 GiB | with `sp` and [`P2mConfig::hap_1gb`] |
//! | 1 | 2 MiB | with `sp` and [`P2mConfig::hap_2mb`] |
//! | 0 | 4 KiB | always |
//!
//! ### Leaf vs. intermediate entries
//!
//! - A **leaf** carries the machine frame, the [`P2mType`], the [`P2mAccess`],
//!   and the permission bits derived from both.
//! - An **intermediate** entry has full permissions, no type, and the child
//!   node in its frame field; `ptp_idx` may name the arena slot holding it.
//! - An all-zero entry maps nothing.
//!
//! ### Populate on demand
//!
//! A [`PopulateOnDemand`](P2mType::PopulateOnDemand) leaf reserves guest
//! address space without a frame. The first
//! [`LookupMode::Alloc`] lookup asks [`P2mHooks::pod_populate`] for one
//! and installs it as ordinary RAM.
//!
//! ## Usage
//!
//! ```rust
//! use kernel_alloc::FramePool;
//! use kernel_memory_addresses::{Gfn, Mfn};
//! use kernel_p2m::{CpuContext, LookupMode, NoHooks, P2m, P2mAccess, P2mConfig, P2mType};
//!
//! let pool = FramePool::new(Mfn::new(0x4_0000), 128).unwrap();
//! let p2m = P2m::new(P2mConfig::new(3), &pool, &pool, NoHooks).unwrap();
//! let mut cpu = CpuContext::new(0);
//!
//! // one 2 MiB superpage, then a read-only 4 KiB frame inside it
//! p2m.set_entry(&mut cpu, Gfn::new(0), Mfn::new(0x10000), 9, P2mType::RamRw, P2mAccess::RW).unwrap();
//! p2m.set_entry(&mut cpu, Gfn::new(0x10), Mfn::new(0x10010), 0, P2mType::RamRo, P2mAccess::R).unwrap();
//!
//! let t = p2m.get_entry(&mut cpu, Gfn::new(0x11), LookupMode::Query).unwrap();
//! assert_eq!(t.mfn, Mfn::new(0x10011));
//! assert_eq!(t.p2m_type, P2mType::RamRw);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod cache;
mod config;
mod dump;
mod entry;
mod error;
mod hooks;
mod node;
mod p2m;
mod paging;
mod retype;
mod split;
mod stats;
mod walk;

pub use crate::cache::{CpuContext, L1Cache};
pub use crate::config::P2mConfig;
pub use crate::entry::{EptEntry, MemoryType, P2mAccess, P2mType, Rwx};
pub use crate::error::P2mError;
pub use crate::hooks::{NoHooks, P2mHooks};
pub use crate::p2m::{LookupMode, P2m, PodHint, Translation};
pub use crate::stats::P2mStats;

pub use kernel_logdirty::{DirtyBitmap, LogDirtyError};
pub use kernel_memory_addresses::{Gfn, Mfn, PageOrder};
