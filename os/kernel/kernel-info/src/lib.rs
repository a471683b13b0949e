//! # Translation Engine Configuration Constants
//!
//! This crate is the single source of truth for the fixed geometry shared by
//! the P2M translation tree, the per-CPU translation cache, and the log-dirty
//! trie. Everything here is a `const`, so layout mismatches between crates are
//! caught at compile time.
//!
//! ## Modules
//!
//! ### Translation tree ([`p2m`])
//! * **Radix layout**: 512 entries per node, four levels, 36-bit gfns
//! * **Node slots**: width of the embedded slot index and its alias stride
//! * **Translation cache**: number of "get" slots per CPU context
//!
//! ### Log-dirty trie ([`logdirty`])
//! * **Leaf bitmap**: one 4 KiB page tracks 32768 frames
//! * **Interior levels**: 9 bits each, three levels above the leaf
//!
//! ```text
//! gfn bits:  35 .... 27 26 .... 18 17 .... 9 8 ..... 0
//!           | level 3  | level 2  | level 1 | level 0 |
//!           |  (root)  |  1 GiB   |  2 MiB  |  4 KiB  |
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod logdirty;
pub mod p2m;
