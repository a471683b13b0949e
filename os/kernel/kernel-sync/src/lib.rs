//! # Synchronization primitives
//!
//! - [`SpinLock`]: plain spin lock for state without an owning context.
//! - [`OwnedMutex`]: spin mutex acquired on behalf of an owner id (a CPU);
//!   recursive acquisition by the same owner panics instead of deadlocking.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod mutex;
mod raw_owned;
mod spin_lock;

pub use mutex::{Mutex, MutexGuard};
pub use raw_owned::{NO_OWNER, RawOwnedSpin};
pub use spin_lock::{SpinLock, SpinLockGuard};

pub type OwnedMutex<T> = Mutex<T, RawOwnedSpin>;
pub type OwnedMutexGuard<'a, T> = MutexGuard<'a, T, RawOwnedSpin>;

impl<T> OwnedMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawOwnedSpin::new(), value)
    }
}

pub trait RawLock {
    fn raw_lock(&self, owner: u32);
    fn raw_try_lock(&self, owner: u32) -> bool;
    fn raw_owner(&self) -> Option<u32>;
}

pub trait RawUnlock {
    unsafe fn raw_unlock(&self);
}
