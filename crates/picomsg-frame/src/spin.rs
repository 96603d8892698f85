//! Spin flags and a small spin lock.
//!
//! A [`SpinFlag`] is a single-owner gate: only one thread can hold it at a
//! time, and a contending thread is expected to skip its work rather than
//! wait. The worker loop relies on this to never stall on one connection.
//!
//! [`SpinLock`] wraps a value behind the same kind of flag for the few places
//! that must wait (registry mutation), where hold times are O(1).

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

/// Spins before yielding to the OS scheduler while waiting on a lock.
const SPINS_BEFORE_YIELD: u32 = 64;

/// A non-blocking mutual-exclusion gate.
#[derive(Debug, Default)]
pub struct SpinFlag {
    held: AtomicBool,
}

impl SpinFlag {
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// Try to take the flag. Returns `None` if another thread holds it.
    #[inline]
    pub fn try_enter(&self) -> Option<SpinFlagGuard<'_>> {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinFlagGuard { flag: self })
    }

    /// Take the flag, spinning (and eventually yielding) until it is free.
    pub fn enter(&self) -> SpinFlagGuard<'_> {
        let mut spins = 0u32;
        loop {
            if let Some(guard) = self.try_enter() {
                return guard;
            }
            spins = spins.wrapping_add(1);
            if spins % SPINS_BEFORE_YIELD == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Whether some thread currently holds the flag.
    #[inline]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }
}

/// Releases the [`SpinFlag`] on drop.
#[derive(Debug)]
pub struct SpinFlagGuard<'a> {
    flag: &'a SpinFlag,
}

impl Drop for SpinFlagGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.flag.held.store(false, Ordering::Release);
    }
}

/// A value guarded by a [`SpinFlag`].
pub struct SpinLock<T> {
    flag: SpinFlag,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `flag`.
unsafe impl<T: Send> Send for SpinLock<T> {}
// SAFETY: a guard hands out `&mut T` to exactly one thread at a time.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            flag: SpinFlag::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, spinning until it is available.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        SpinLockGuard {
            _flag: self.flag.enter(),
            lock: self,
        }
    }

    /// Acquire the lock only if it is free right now.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.flag.try_enter().map(|flag| SpinLockGuard {
            _flag: flag,
            lock: self,
        })
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> std::fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.flag.is_held())
            .finish()
    }
}

/// Grants access to the value inside a [`SpinLock`] until dropped.
pub struct SpinLockGuard<'a, T> {
    _flag: SpinFlagGuard<'a>,
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the flag guard proves exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the flag guard proves exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}
