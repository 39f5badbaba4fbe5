//! Reentrant per-heap exclusivity guard.
//!
//! Every heap serializes its mutating operations behind one of these
//! locks. Unlike a plain spin mutex, the lock records the identity of
//! the task holding it and a hold depth: if the holding task re-enters
//! (for example an allocation performed inside a scope that already
//! holds the heap), the depth is bumped instead of spinning forever on
//! itself. Any other task spins until the depth drops back to zero and
//! the owner word is cleared.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU32, Ordering},
};

use crate::task;

/// A spin lock that the owning task may re-acquire without deadlocking.
///
/// The guard releases on every exit path; only the drop of the
/// outermost guard actually clears the owner word.
///
/// Crate-internal: re-entry hands the holder a second guard to the same
/// data, so this must never be exposed where safe code could deref two
/// guards at once. [`Heap::guarded`](crate::heap::Heap::guarded) is the
/// public surface, and the allocator itself holds at most one
/// dereferenced guard per heap at a time.
pub(crate) struct ReentrantMutex<T> {
    /// Task token of the current holder, 0 when unheld.
    owner: AtomicU32,
    /// Number of nested re-acquisitions by the holder. Written only by
    /// the task named in `owner`.
    depth: UnsafeCell<u32>,
    data: UnsafeCell<T>,
}

unsafe impl<T> Send for ReentrantMutex<T> where T: Send {}
unsafe impl<T> Sync for ReentrantMutex<T> where T: Send {}

impl<T> ReentrantMutex<T> {
    pub(crate) const fn new(data: T) -> Self {
        Self {
            owner: AtomicU32::new(0),
            depth: UnsafeCell::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock, spinning while another task holds it. A task
    /// that already holds the lock re-enters immediately.
    pub(crate) fn lock(&self) -> ReentrantMutexGuard<'_, T> {
        let me = owner_token();
        if self.owner.load(Ordering::Relaxed) == me {
            // Only this task can have stored its own token, so the read
            // cannot race with an acquisition by anyone else.
            unsafe {
                *self.depth.get() += 1;
            }
        } else {
            while self
                .owner
                .compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                core::hint::spin_loop();
            }
        }
        ReentrantMutexGuard { mutex: self }
    }

    /// Attempts to acquire the lock without blocking. Returns `None`
    /// (busy) when another task holds it; re-entry by the holder always
    /// succeeds.
    pub(crate) fn try_lock(&self) -> Option<ReentrantMutexGuard<'_, T>> {
        let me = owner_token();
        if self.owner.load(Ordering::Relaxed) == me {
            unsafe {
                *self.depth.get() += 1;
            }
            return Some(ReentrantMutexGuard { mutex: self });
        }
        self.owner
            .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;
        Some(ReentrantMutexGuard { mutex: self })
    }

    /// Task id of the current holder, if any.
    pub(crate) fn holder(&self) -> Option<u32> {
        match self.owner.load(Ordering::Relaxed) {
            0 => None,
            token => Some(token - 1),
        }
    }
}

/// Owner tokens are task ids offset by one so that 0 means "unheld".
fn owner_token() -> u32 {
    task::current_id() + 1
}

pub(crate) struct ReentrantMutexGuard<'a, T> {
    mutex: &'a ReentrantMutex<T>,
}

impl<T> Drop for ReentrantMutexGuard<'_, T> {
    fn drop(&mut self) {
        unsafe {
            let depth = &mut *self.mutex.depth.get();
            if *depth == 0 {
                self.mutex.owner.store(0, Ordering::Release);
            } else {
                *depth -= 1;
            }
        }
    }
}

impl<T> Deref for ReentrantMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for ReentrantMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutex.data.get() }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, vec::Vec};

    use super::*;

    #[test]
    fn test_lock_and_release() {
        let mutex = ReentrantMutex::new(0_u32);
        {
            let mut guard = mutex.lock();
            *guard = 7;
            assert!(mutex.holder().is_some());
        }
        assert_eq!(mutex.holder(), None);
        assert_eq!(*mutex.lock(), 7);
    }

    #[test]
    fn test_same_task_reenters_without_deadlock() {
        let mutex = ReentrantMutex::new(());
        let outer = mutex.lock();
        let inner = mutex.try_lock();
        assert!(inner.is_some(), "holder must be able to re-enter");
        drop(inner);
        assert!(mutex.holder().is_some(), "outer hold must survive");
        drop(outer);
        assert_eq!(mutex.holder(), None);
    }

    #[test]
    fn test_nested_release_order() {
        let mutex = ReentrantMutex::new(());
        let g1 = mutex.lock();
        let g2 = mutex.lock();
        let g3 = mutex.lock();
        drop(g3);
        drop(g2);
        assert!(mutex.holder().is_some());
        drop(g1);
        assert_eq!(mutex.holder(), None);
    }

    #[test]
    fn test_try_lock_reports_busy_to_other_tasks() {
        let mutex = Arc::new(ReentrantMutex::new(()));
        let guard = mutex.lock();
        let contender = Arc::clone(&mutex);
        let busy = thread::spawn(move || contender.try_lock().is_none())
            .join()
            .unwrap();
        assert!(busy, "other task must see the lock as busy");
        drop(guard);
    }

    #[test]
    fn test_serializes_competing_tasks() {
        let mutex = Arc::new(ReentrantMutex::new((0_u64, 0_u64)));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut pair = mutex.lock();
                        pair.0 += 1;
                        // A torn critical section would let another task
                        // observe the halves out of step.
                        assert_eq!(pair.0, pair.1 + 1);
                        pair.1 += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*mutex.lock(), (4000, 4000));
    }
}
