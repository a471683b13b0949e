use crate::{RawLock, RawUnlock};
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, Ordering};

/// Owner value meaning "not held".
pub const NO_OWNER: u32 = u32::MAX;

/// A spin lock that records which execution context holds it.
///
/// Each caller identifies itself with an owner id (a CPU number, in practice).
/// Re-acquiring the lock with the id that already holds it would deadlock a
/// plain spin lock; here it panics instead.
///
/// Owner ids must be unique among contexts that may contend at the same time.
pub struct RawOwnedSpin {
    owner: AtomicU32,
}

impl Default for RawOwnedSpin {
    fn default() -> Self {
        Self::new()
    }
}

impl RawOwnedSpin {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            owner: AtomicU32::new(NO_OWNER),
        }
    }

    /// Spin until acquired on behalf of `owner`.
    ///
    /// # Panics
    /// If `owner` already holds the lock, or `owner` is [`NO_OWNER`].
    #[inline]
    pub fn lock(&self, owner: u32) {
        assert_ne!(owner, NO_OWNER, "owner id {NO_OWNER:#x} is reserved");
        loop {
            match self.owner.compare_exchange_weak(
                NO_OWNER,
                owner,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) if current == owner => {
                    panic!("recursive lock acquisition by owner {owner}");
                }
                Err(_) => {
                    while self.owner.load(Ordering::Relaxed) != NO_OWNER {
                        spin_loop();
                    }
                }
            }
        }
    }

    /// Try once on behalf of `owner`.
    ///
    /// # Panics
    /// If `owner` already holds the lock.
    #[inline]
    pub fn try_lock(&self, owner: u32) -> bool {
        match self
            .owner
            .compare_exchange(NO_OWNER, owner, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => true,
            Err(current) if current == owner => {
                panic!("recursive lock acquisition by owner {owner}");
            }
            Err(_) => false,
        }
    }

    /// Current holder, if any. Only a hint unless called by the holder.
    #[inline]
    pub fn owner(&self) -> Option<u32> {
        match self.owner.load(Ordering::Relaxed) {
            NO_OWNER => None,
            owner => Some(owner),
        }
    }

    /// # Safety
    /// Only the current holder may unlock.
    #[inline]
    pub unsafe fn unlock(&self) {
        self.owner.store(NO_OWNER, Ordering::Release);
    }
}

impl RawLock for RawOwnedSpin {
    fn raw_lock(&self, owner: u32) {
        self.lock(owner);
    }

    fn raw_try_lock(&self, owner: u32) -> bool {
        self.try_lock(owner)
    }

    fn raw_owner(&self) -> Option<u32> {
        self.owner()
    }
}

impl RawUnlock for RawOwnedSpin {
    unsafe fn raw_unlock(&self) {
        unsafe { self.unlock() }
    }
}
