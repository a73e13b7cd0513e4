//! A futex mutex for the allocator's own locks. Unlike `std::sync::Mutex` it
//! never poisons, and locking it never allocates, so it is safe to take from
//! inside `malloc()`.

use std::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::Ordering,
};

use linux_futex::{Futex, Private};

use crate::util::hint::cold;

/// Nobody holds the lock
const UNLOCKED: u32 = 0;

/// Somebody holds the lock, and nobody is waiting on it
const LOCKED: u32 = 1;

/// Somebody holds the lock, and somebody might be asleep on the futex
const CONTENDED: u32 = 2;

pub struct FutexMutex<T> {
    futex: Futex<Private>,
    data: UnsafeCell<T>,
}

// SAFETY: The futex hands out exclusive access to `data`, the same way
//         `std::sync::Mutex` does.
unsafe impl<T: Send> Send for FutexMutex<T> {}
unsafe impl<T: Send> Sync for FutexMutex<T> {}

impl<T> FutexMutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            futex: Futex::new(UNLOCKED),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> FutexMutexGuard<'_, T> {
        if self
            .futex
            .value
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            cold(|| self.lock_contended());
        }
        FutexMutexGuard { mutex: self }
    }

    fn lock_contended(&self) {
        // Once we've marked the lock contended we can't tell whether anyone
        // else is still waiting, so we keep it marked until we get it
        while self.futex.value.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            // A spurious wake-up or a changed value just means we try again
            _ = self.futex.wait(CONTENDED);
        }
    }

    fn unlock(&self) {
        if self.futex.value.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            self.futex.wake(1);
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for FutexMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// RAII guard for a [`FutexMutex`], unlocks on drop
pub struct FutexMutexGuard<'a, T> {
    mutex: &'a FutexMutex<T>,
}

impl<T> Deref for FutexMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: We hold the lock, so nobody else has a reference to `data`
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for FutexMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: As for `deref()`, and `&mut self` makes this unique
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for FutexMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contended_increments_are_not_lost() {
        let counter = FutexMutex::new(0usize);
        crossbeam::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|_| {
                    for _ in 0..10_000 {
                        *counter.lock() += 1;
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(*counter.lock(), 80_000);
    }

    #[test]
    fn lock_is_released_on_unwind() {
        let mutex = FutexMutex::new(Vec::new());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut guard = mutex.lock();
            guard.push(1);
            panic!("boom");
        }));
        assert!(result.is_err());
        mutex.lock().push(2);
        assert_eq!(*mutex.lock(), vec![1, 2]);
    }
}
