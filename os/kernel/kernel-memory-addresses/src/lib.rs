//! # Guest and Machine Frame Number Types
//!
//! Strongly typed wrappers for page-granular frame numbers used by the
//! guest-physical-to-machine (P2M) translation code.
//!
//! ## Overview
//!
//! A hypervisor juggles two kinds of "physical" page numbers at once:
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`Gfn`] | Guest frame number: what the guest believes is physical memory. |
//! | [`Mfn`] | Machine frame number: real backing memory. |
//!
//! Both wrap the principal [`FrameNumber`] type and are zero-cost
//! `#[repr(transparent)]` newtypes, so mixing them up is a compile error rather
//! than a silent mis-translation.
//!
//! Mapping granularity is described by [`PageOrder`] (4 KiB, 2 MiB, 1 GiB),
//! which also knows at which radix level a leaf of that size lives.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let gfn = Gfn::new(0x10);
//! let base = gfn.align_down(PageOrder::Size2M);
//! assert_eq!(base.as_u64(), 0);
//!
//! // A 2 MiB mapping of gfn 0 -> mfn 0x10000 translates gfn 0x10 to:
//! let mfn = Mfn::new(0x10000) + gfn.offset_in(PageOrder::Size2M);
//! assert_eq!(mfn.as_u64(), 0x10010);
//! ```
//!
//! ## Design Notes
//!
//! - Sentinels ([`Mfn::INVALID`], [`Gfn::INVALID`]) are associated constants
//!   rather than `Option`s because they are stored verbatim inside hardware
//!   table entries.
//! - All alignment helpers are `const fn`.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod frame_number;
mod gfn;
mod mfn;
mod page_order;

pub use frame_number::FrameNumber;
pub use gfn::Gfn;
pub use mfn::Mfn;
pub use page_order::PageOrder;

/// log2 of the base frame size in bytes.
pub const FRAME_SHIFT: u32 = 12;

/// Base frame size in bytes.
pub const FRAME_SIZE: u64 = 1 << FRAME_SHIFT;
