//! # Machine Frame Allocation and Mapping
//!
//! This crate provides the two capabilities the translation engine consumes
//! from the rest of the hypervisor, plus a host-memory implementation of both.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │         P2M translation tree / log-dirty trie       │
//! │    • radix nodes and dirty bitmaps are frames       │
//! └──────────────┬─────────────────────┬────────────────┘
//!                │ alloc / free        │ map / unmap
//! ┌──────────────▼──────────┐ ┌────────▼────────────────┐
//! │       FrameAlloc        │ │       PhysMapper        │
//! │ • zeroed 4 KiB frames   │ │ • Mfn → &RawFrame       │
//! │ • None on exhaustion    │ │ • RAII MappedFrame      │
//! └──────────────┬──────────┘ └────────┬────────────────┘
//!                │                     │
//! ┌──────────────▼─────────────────────▼────────────────┐
//! │                     FramePool                       │
//! │    • host-backed array of RawFrame                  │
//! │    • bitmap free/used tracking under a SpinLock     │
//! │    • failure injection and leak counters            │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Frames ([`raw_frame`])
//! A [`RawFrame`] is 512 [`AtomicU64`](core::sync::atomic::AtomicU64) words.
//! Table entries are read and written one word at a time, so a single atomic
//! store makes an entry update indivisible to concurrent readers.
//!
//! ### Allocation ([`frame_alloc`])
//! * **[`FrameAlloc`]**: `alloc_zeroed() -> Option<Mfn>`, `free(Mfn)`
//! * **[`FramePool`]**: the host-memory implementation
//!
//! ### Mapping ([`phys_mapper`])
//! * **[`PhysMapper`]**: `map(Mfn) -> Option<&RawFrame>`, `unmap(&RawFrame)`
//! * **[`MappedFrame`]**: guard that unmaps on drop
//!
//! ## Usage
//!
//! ```rust
//! use kernel_alloc::{FrameAlloc, FramePool, PhysMapper};
//! use kernel_memory_addresses::Mfn;
//!
//! let pool = FramePool::new(Mfn::new(0x10_0000), 16).unwrap();
//! let node = pool.alloc_zeroed().expect("frame");
//! let frame = pool.map_guarded(node).expect("mappable");
//! assert_eq!(frame.load(0), 0);
//! ```
//!
//! ## Integration Points
//! * **kernel-memory-addresses**: [`Mfn`](kernel_memory_addresses::Mfn)
//! * **kernel-sync**: the pool's [`SpinLock`](kernel_sync::SpinLock)

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod frame_alloc;
pub mod phys_mapper;
pub mod raw_frame;

pub use frame_alloc::{FrameAlloc, FramePool, FramePoolError};
pub use phys_mapper::{MappedFrame, PhysMapper};
pub use raw_frame::{FRAME_WORDS, RawFrame};
