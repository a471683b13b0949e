//! # Log-Dirty Tracking
//!
//! Records which guest frames were written while a domain runs with write
//! protection on its RAM, so a migration or checkpoint driver can copy only
//! the frames that changed since the previous pass.
//!
//! ## Architecture Overview
//!
//! ```text
//!  write fault ──► mark_dirty(gfn) ──┐
//!                                    ▼
//!                       ┌─────────────────────────┐
//!                       │   LogDirty (SpinLock)   │
//!                       │ • 4-level trie of frames│
//!                       │ • dirty / fault counts  │
//!                       │ • sticky alloc failures │
//!                       └────────────┬────────────┘
//!                                    ▼
//!  migration driver ◄── read_range / peek / clean ──► DirtyBitmap
//! ```
//!
//! ## Core Components
//! * **[`LogDirty`]**: the per-domain trie with its own lock
//! * **[`DirtyBitmap`]**: packed result of a range read
//! * **[`LogDirtyStats`]**: counters returned with whole-bitmap reads
//!
//! ## Locking
//! The trie lock is a leaf lock: nothing is acquired while it is held, so it
//! may be taken with or without the owning address-space lock.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod bitmap;
mod trie;

pub use bitmap::DirtyBitmap;
pub use trie::{LogDirty, LogDirtyError, LogDirtyStats};
