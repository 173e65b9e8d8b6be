//! The tracer's mutual-exclusion primitive.
//!
//! A plain pthread mutex rather than [`std::sync::Mutex`]: the lock is taken
//! inside allocator hooks, so it must not allocate, must not poison, and must
//! be forcibly releasable by the fatal-error path (which never returns
//! through a guard's destructor).

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};

use crate::fatal;

/// Mutex plus the data it protects.  All reads and writes of the tracer's
/// shared state go through [`TraceLock::lock`], except for the documented
/// lock-free accessors used while crashing.
pub struct TraceLock<T> {
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for TraceLock<T> {}
unsafe impl<T: Send> Sync for TraceLock<T> {}

impl<T> TraceLock<T> {
    pub fn new(data: T) -> Self {
        TraceLock {
            mutex: UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER),
            data: UnsafeCell::new(data),
        }
    }

    /// Blocks until the lock is obtained.  Acquisition failure indicates an
    /// unrecoverable runtime condition and takes the fatal path.
    pub fn lock(&self) -> TraceLockGuard<'_, T> {
        let rc = unsafe { libc::pthread_mutex_lock(self.mutex.get()) };
        if rc != 0 {
            fatal::fatal_error(&format!("pthread_mutex_lock failed with {}", rc));
        }
        TraceLockGuard { lock: self }
    }

    /// Forcibly marks the lock available without going through a guard.
    ///
    /// Reserved for the fatal-error path: a crash while a hook holds the
    /// lock would otherwise deadlock the crash handler.  This is a
    /// deliberate safety-over-purity exception, not a general pattern.
    ///
    /// # Safety
    ///
    /// Must only be called from the fatal-error path; afterwards the
    /// protected data may be observed mid-update.
    pub unsafe fn force_unlock(&self) {
        libc::pthread_mutex_unlock(self.mutex.get());
    }

    /// Reads the protected data without taking the lock.
    ///
    /// # Safety
    ///
    /// Only for the fatal-error report printer, which must stay usable when
    /// the lock is held by a crashed thread.  The data may be inconsistent.
    pub unsafe fn data_unlocked(&self) -> &T {
        &*self.data.get()
    }
}

/// Scoped acquisition of a [`TraceLock`]; releases on drop.
pub struct TraceLockGuard<'a, T> {
    lock: &'a TraceLock<T>,
}

impl<T> Deref for TraceLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for TraceLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for TraceLockGuard<'_, T> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.lock.mutex.get());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn lock_serializes_writers() {
        let lock = Arc::new(TraceLock::new(0u64));
        let mut handles = vec![];
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 8000);
    }

    #[test]
    fn force_unlock_releases_a_held_lock() {
        let lock = TraceLock::new(());
        let guard = lock.lock();
        std::mem::forget(guard);
        unsafe { lock.force_unlock() };
        // Re-acquisition succeeds only if force_unlock released the mutex.
        drop(lock.lock());
    }
}
