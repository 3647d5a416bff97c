//! Interrupt-masking mutex for single-core kernel state.

use core::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
    panic::Location,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::interrupt::{self, Guard};

/// Mutual exclusion between the normal kernel flow and interrupt handlers.
///
/// Locking masks interrupts for as long as the guard lives, which on a
/// single core is all the exclusion there is to have: with interrupts off,
/// nothing else can run. A lock that is already held can therefore only mean
/// reentrancy from the same context, where a spinning wait would hang
/// forever, so [`lock`](Self::lock) panics instead, naming the original
/// acquisition site.
pub struct IntrMutex<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
    locked_at: UnsafeCell<&'static Location<'static>>,
}

impl<T> Default for IntrMutex<T>
where
    T: Default,
{
    #[track_caller]
    fn default() -> Self {
        Self::new(T::default())
    }
}

unsafe impl<T> Sync for IntrMutex<T> where T: Send {}

impl<T> fmt::Debug for IntrMutex<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("IntrMutex");
        match self.try_lock() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &"<locked>"),
        };
        d.finish()
    }
}

impl<T> IntrMutex<T> {
    #[track_caller]
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
            locked_at: UnsafeCell::new(Location::caller()),
        }
    }

    /// Masks interrupts and takes the lock.
    ///
    /// # Panics
    ///
    /// Panics when the lock is already held, which on one core is a
    /// reentrancy bug rather than contention.
    #[track_caller]
    pub fn lock(&self) -> IntrMutexGuard<'_, T> {
        let interrupt_guard = interrupt::push_disabled();

        if self.locked.swap(true, Ordering::Acquire) {
            let locked_at = unsafe { *self.locked_at.get() };
            panic!("IntrMutex already held, locked at {locked_at}");
        }

        unsafe {
            *self.locked_at.get() = Location::caller();
        }

        IntrMutexGuard {
            mutex: self,
            _interrupt_guard: interrupt_guard,
        }
    }

    #[track_caller]
    pub fn try_lock(&self) -> Option<IntrMutexGuard<'_, T>> {
        let interrupt_guard = interrupt::push_disabled();

        if self.locked.swap(true, Ordering::Acquire) {
            return None;
        }

        unsafe {
            *self.locked_at.get() = Location::caller();
        }

        Some(IntrMutexGuard {
            mutex: self,
            _interrupt_guard: interrupt_guard,
        })
    }
}

pub struct IntrMutexGuard<'a, T> {
    mutex: &'a IntrMutex<T>,
    _interrupt_guard: Guard,
}

unsafe impl<T> Send for IntrMutexGuard<'_, T> where T: Send {}
unsafe impl<T> Sync for IntrMutexGuard<'_, T> where T: Sync {}

impl<T> Drop for IntrMutexGuard<'_, T> {
    fn drop(&mut self) {
        assert!(
            self.mutex.locked.load(Ordering::Relaxed),
            "IntrMutexGuard dropped without holding the lock"
        );
        self.mutex.locked.store(false, Ordering::Release);
    }
}

impl<T> Deref for IntrMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for IntrMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> IntrMutexGuard<'_, T> {
    pub fn unlock(self) {
        let _ = self; // drop
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::GATE;

    #[test]
    fn lock_masks_interrupts_for_the_critical_section() {
        let _gate = GATE.lock();

        interrupt::enable();
        let mutex = IntrMutex::new(5);
        {
            let mut guard = mutex.lock();
            *guard += 1;
            assert!(!interrupt::is_enabled());
        }
        assert!(interrupt::is_enabled());
        assert_eq!(*mutex.lock(), 6);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let _gate = GATE.lock();

        let mutex = IntrMutex::new(());
        let guard = mutex.lock();
        assert!(mutex.try_lock().is_none());
        guard.unlock();
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    #[should_panic(expected = "already held")]
    fn reentrant_lock_panics() {
        let _gate = GATE.lock();

        let mutex = IntrMutex::new(());
        let _first = mutex.lock();
        let _second = mutex.lock();
    }
}
