//! Scoped mutual-exclusion lock used to guard a ring buffer's reservation state.
//!
//! Unlike `std::sync::Mutex<T>`, this type does not own the data it protects —
//! it is a bare lock with an explicit `lock`/`try_lock`/`unlock` API, matching
//! the shape of a pthread mutex wrapped around reservation bookkeeping that
//! lives elsewhere (e.g. `next_slot`, `last_ack_slot` in `ffado-ring`). The
//! explicit unlock is what lets [`ScopedLock::early_unlock`] release a
//! reservation before the end of its enclosing scope.

use lock_api::RawMutex as _;
use parking_lot::RawMutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Error returned by mutex operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MutexError {
    /// `unlock()` was called on a mutex that the caller did not hold.
    #[error("mutex is not locked")]
    NotLocked,
}

/// A mutually-exclusive lock with an explicit, non-RAII unlock.
///
/// Built on `parking_lot`'s raw mutex so `lock`/`try_lock`/`unlock` can be
/// called independently of any guard lifetime. Recursive acquisition from the
/// same thread is not supported (relocking deadlocks, as with a non-recursive
/// pthread mutex) — this matches the spec's choice to not require recursion.
pub struct ScopedMutex {
    /// The actual lock; acquired/released independently of any guard.
    raw: RawMutex,
    /// Best-effort "currently locked" flag for [`ScopedMutex::is_locked`] and
    /// for rejecting a redundant `unlock()`. Racy with respect to other
    /// callers by design: it is a diagnostic probe, never a synchronization
    /// primitive in its own right.
    locked: AtomicBool,
}

impl Default for ScopedMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopedMutex {
    /// Creates a new, unlocked mutex.
    pub fn new() -> Self {
        Self {
            raw: RawMutex::INIT,
            locked: AtomicBool::new(false),
        }
    }

    /// Blocks until the lock is acquired.
    pub fn lock(&self) {
        self.raw.lock();
        self.locked.store(true, Ordering::Relaxed);
    }

    /// Attempts to acquire the lock without blocking.
    ///
    /// Returns `true` if the lock was acquired.
    pub fn try_lock(&self) -> bool {
        if self.raw.try_lock() {
            self.locked.store(true, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Releases a lock previously acquired by `lock()`/`try_lock()`.
    ///
    /// Returns [`MutexError::NotLocked`] if the mutex was not held; in that
    /// case the underlying raw mutex is left untouched.
    pub fn unlock(&self) -> Result<(), MutexError> {
        if !self.locked.swap(false, Ordering::Relaxed) {
            return Err(MutexError::NotLocked);
        }
        // SAFETY: the swap above observed `locked == true`, and only the
        // thread that set it via `lock`/`try_lock` can have done so (the
        // mutex is non-recursive), so we are the current holder.
        unsafe { self.raw.unlock() };
        Ok(())
    }

    /// Best-effort probe of whether the mutex is currently held.
    ///
    /// Never use this to decide whether it is safe to lock — it is racy with
    /// respect to other callers and exists only for defensive assertions and
    /// logging.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// RAII helper that acquires a [`ScopedMutex`] on construction and releases it
/// on every exit path, including an explicit early release.
pub struct ScopedLock<'a> {
    /// The mutex acquired on construction and released on drop.
    mutex: &'a ScopedMutex,
    /// Set by `early_unlock` so `Drop` knows not to unlock a second time.
    released: bool,
}

impl<'a> ScopedLock<'a> {
    /// Acquires `mutex`, blocking until it is held.
    pub fn new(mutex: &'a ScopedMutex) -> Self {
        mutex.lock();
        Self {
            mutex,
            released: false,
        }
    }

    /// Attempts to acquire `mutex` without blocking.
    pub fn try_new(mutex: &'a ScopedMutex) -> Option<Self> {
        if mutex.try_lock() {
            Some(Self {
                mutex,
                released: false,
            })
        } else {
            None
        }
    }

    /// Releases the lock now, before the guard goes out of scope.
    ///
    /// After this call the destructor is a no-op: the guard has already
    /// given up the lock and must not unlock it a second time.
    pub fn early_unlock(mut self) {
        let _ = self.mutex.unlock();
        self.released = true;
    }
}

impl Drop for ScopedLock<'_> {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.mutex.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_and_unlock_round_trip() {
        let m = ScopedMutex::new();
        assert!(!m.is_locked());
        m.lock();
        assert!(m.is_locked());
        m.unlock().unwrap();
        assert!(!m.is_locked());
    }

    #[test]
    fn try_lock_fails_while_held() {
        let m = ScopedMutex::new();
        assert!(m.try_lock());
        assert!(!m.try_lock());
        m.unlock().unwrap();
        assert!(m.try_lock());
    }

    #[test]
    fn unlock_without_lock_is_an_error() {
        let m = ScopedMutex::new();
        assert_eq!(m.unlock(), Err(MutexError::NotLocked));
    }

    #[test]
    fn double_unlock_is_rejected() {
        let m = ScopedMutex::new();
        m.lock();
        m.unlock().unwrap();
        assert_eq!(m.unlock(), Err(MutexError::NotLocked));
    }

    #[test]
    fn scoped_lock_releases_on_drop() {
        let m = ScopedMutex::new();
        {
            let _guard = ScopedLock::new(&m);
            assert!(m.is_locked());
        }
        assert!(!m.is_locked());
    }

    #[test]
    fn scoped_lock_early_unlock_is_idempotent_on_drop() {
        let m = ScopedMutex::new();
        let guard = ScopedLock::new(&m);
        assert!(m.is_locked());
        guard.early_unlock();
        assert!(!m.is_locked());
        // A concurrent lock/unlock must not be disturbed by the dropped guard.
        m.lock();
        assert!(m.is_locked());
        m.unlock().unwrap();
    }

    #[test]
    fn try_new_returns_none_when_contended() {
        let m = ScopedMutex::new();
        let _first = ScopedLock::new(&m);
        assert!(ScopedLock::try_new(&m).is_none());
    }
}
