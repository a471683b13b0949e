use crate::{RawLock, RawUnlock};
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

/// Data guarded by a raw lock that is acquired on behalf of an owner id.
pub struct Mutex<T, R> {
    raw: R,
    cell: UnsafeCell<T>,
    _no_send_sync: PhantomData<*mut ()>, // !Send/!Sync by default; we implement below
}

unsafe impl<T: Send, R: Sync> Sync for Mutex<T, R> {}
unsafe impl<T: Send, R: Send> Send for Mutex<T, R> {}

impl<T, R> Mutex<T, R> {
    pub const fn from_raw(raw: R, value: T) -> Self {
        Self {
            raw,
            cell: UnsafeCell::new(value),
            _no_send_sync: PhantomData,
        }
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.cell.get_mut()
    }
}

pub struct MutexGuard<'a, T, R>
where
    R: RawUnlock,
{
    m: &'a Mutex<T, R>,
    owner: u32,
}

impl<T, R> MutexGuard<'_, T, R>
where
    R: RawUnlock,
{
    /// The owner id this guard was acquired for.
    #[inline]
    #[must_use]
    pub const fn owner(&self) -> u32 {
        self.owner
    }
}

impl<T, R> Deref for MutexGuard<'_, T, R>
where
    R: RawUnlock,
{
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.m.cell.get() }
    }
}

impl<T, R> DerefMut for MutexGuard<'_, T, R>
where
    R: RawUnlock,
{
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.m.cell.get() }
    }
}

impl<T, R> Drop for MutexGuard<'_, T, R>
where
    R: RawUnlock,
{
    fn drop(&mut self) {
        unsafe { self.m.raw.raw_unlock() }
    }
}

impl<T, R> Mutex<T, R>
where
    R: RawLock + RawUnlock,
{
    /// Acquire on behalf of `owner`.
    ///
    /// # Panics
    /// If `owner` already holds this lock.
    #[inline]
    pub fn lock(&self, owner: u32) -> MutexGuard<'_, T, R> {
        self.raw.raw_lock(owner);
        MutexGuard { m: self, owner }
    }

    #[inline]
    pub fn try_lock(&self, owner: u32) -> Option<MutexGuard<'_, T, R>> {
        if self.raw.raw_try_lock(owner) {
            Some(MutexGuard { m: self, owner })
        } else {
            None
        }
    }

    /// `true` if `owner` currently holds the lock.
    #[inline]
    pub fn locked_by(&self, owner: u32) -> bool {
        self.raw.raw_owner() == Some(owner)
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw.raw_owner().is_some()
    }
}
