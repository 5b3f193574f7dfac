//! Owner-tagged spin locks
//!
//! [`RawSpinlock`] is the bare lock word plus bookkeeping: who holds it, how
//! many times it has been taken, and how many times its owner tried to take
//! it again. Recursion is only recorded, never granted; an owner that calls
//! [`RawSpinlock::acquire`] twice spins forever.
//!
//! [`Spinlock<T>`] wraps data with a guard that releases on drop.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use super::CurrentTask;
use crate::types::TaskId;

const NO_OWNER: u32 = u32::MAX;

// ============================================================================
// Raw spin lock
// ============================================================================

pub struct RawSpinlock {
    locked: AtomicBool,
    owner: AtomicU32,
    acquisitions: AtomicU64,
    recursion: AtomicU32,
}

impl RawSpinlock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicU32::new(NO_OWNER),
            acquisitions: AtomicU64::new(0),
            recursion: AtomicU32::new(0),
        }
    }

    /// Spin until the lock is taken for `owner`
    pub fn acquire(&self, owner: TaskId) {
        if self.try_claim(owner) {
            return;
        }
        if self.owner() == Some(owner) {
            self.recursion.fetch_add(1, Ordering::Relaxed);
            log::warn!(target: "sync", "task {} re-acquiring a spinlock it holds", owner);
        }
        loop {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
            if self.try_claim(owner) {
                return;
            }
        }
    }

    /// Take the lock for `owner` if it is free
    pub fn try_acquire(&self, owner: TaskId) -> bool {
        if self.try_claim(owner) {
            return true;
        }
        if self.owner() == Some(owner) {
            self.recursion.fetch_add(1, Ordering::Relaxed);
        }
        false
    }

    fn try_claim(&self, owner: TaskId) -> bool {
        let claimed = self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        if claimed {
            self.owner.store(owner.0, Ordering::Relaxed);
            self.acquisitions.fetch_add(1, Ordering::Relaxed);
        }
        claimed
    }

    /// Release the lock; only the recorded owner can
    pub fn release(&self, owner: TaskId) -> bool {
        if !self.is_held() || self.owner() != Some(owner) {
            return false;
        }
        // Ownership is cleared before the lock word
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        true
    }

    pub fn is_held(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn owner(&self) -> Option<TaskId> {
        match self.owner.load(Ordering::Relaxed) {
            NO_OWNER => None,
            id => Some(TaskId(id)),
        }
    }

    /// Successful acquisitions since creation
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    /// Attempts by the holder to take the lock again
    pub fn recursion(&self) -> u32 {
        self.recursion.load(Ordering::Relaxed)
    }
}

impl Default for RawSpinlock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RawSpinlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawSpinlock")
            .field("locked", &self.is_held())
            .field("owner", &self.owner())
            .field("acquisitions", &self.acquisitions())
            .finish()
    }
}

// ============================================================================
// Spin lock with data
// ============================================================================

pub struct Spinlock<T> {
    raw: RawSpinlock,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `raw`
unsafe impl<T: Send> Send for Spinlock<T> {}
unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            raw: RawSpinlock::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock<C: CurrentTask + ?Sized>(&self, ctx: &C) -> SpinlockGuard<'_, T> {
        let owner = ctx.current_task_id();
        self.raw.acquire(owner);
        SpinlockGuard { lock: self, owner }
    }

    pub fn try_lock<C: CurrentTask + ?Sized>(&self, ctx: &C) -> Option<SpinlockGuard<'_, T>> {
        let owner = ctx.current_task_id();
        self.raw
            .try_acquire(owner)
            .then(|| SpinlockGuard { lock: self, owner })
    }

    pub fn raw(&self) -> &RawSpinlock {
        &self.raw
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: fmt::Debug> fmt::Debug for Spinlock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spinlock").field("raw", &self.raw).finish()
    }
}

/// Held [`Spinlock`]; releases on drop
pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
    owner: TaskId,
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock exclusively
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release(self.owner);
    }
}
