use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::proc::{Cpu, InterruptLock, current_cpu, lock_current_cpu};

/// A mutual-exclusion lock that disables interrupts on the holding CPU while held.
///
/// Locked when the stored CPU pointer is non-null. Acquiring always goes through
/// [`lock_current_cpu`] so the interrupt state is restored exactly once, even under
/// nested locks, when the returned guard is dropped.
#[derive(Debug)]
pub struct SpinLock<T> {
    name: &'static str,
    cpu: AtomicPtr<Cpu>,
    data: UnsafeCell<T>,
}

// Safety: the UnsafeCell is only ever reached through a guard or an exclusive
// reference, so SpinLock<T> is Sync whenever T is safe to move between CPUs.
unsafe impl<T> Sync for SpinLock<T> where T: Send {}

pub struct SpinLockGuard<'a, T: 'a> {
    lock: &'a SpinLock<T>,
    _intr_lock: InterruptLock,
}

unsafe impl<T> Sync for SpinLockGuard<'_, T> where T: Sync {}

impl<T> SpinLock<T> {
    pub const fn new(value: T, name: &'static str) -> Self {
        SpinLock {
            name,
            cpu: AtomicPtr::new(ptr::null_mut()),
            data: UnsafeCell::new(value),
        }
    }

    /// Safety: must be called with interrupts disabled.
    unsafe fn holding(&self) -> bool {
        self.cpu.load(Ordering::Relaxed) == unsafe { current_cpu() as *mut Cpu }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let _intr_lock = lock_current_cpu();

        unsafe {
            assert!(!self.holding(), "acquire lock {}", self.name);

            loop {
                if self
                    .cpu
                    .compare_exchange(
                        ptr::null_mut(),
                        current_cpu() as *mut Cpu,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    break SpinLockGuard {
                        lock: self,
                        _intr_lock,
                    };
                }

                hint::spin_loop()
            }
        }
    }

    /// Releases a held guard early without running its destructor, returning a
    /// reference to the lock so the caller can decide when to reacquire it. Used
    /// by `proc::sleep` to drop the wait-condition lock only after the process
    /// table lock has been taken, so no wakeup can be missed in between.
    pub fn unlock(guard: SpinLockGuard<'_, T>) -> &'_ SpinLock<T> {
        let lock = guard.lock;
        core::mem::forget(guard);

        unsafe {
            assert!(lock.holding(), "unlock {}", lock.name);
        }
        lock.cpu.store(ptr::null_mut(), Ordering::Release);

        lock
    }

    /// Since this call consumes self, we can guarantee no one else is holding a reference.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Since this call mutably borrows self, we can guarantee no one else is holding a reference.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Use this over `get_mut` when only a shared reference to the lock is available and the
    /// caller can prove exclusive access by other means (e.g. during single-hart init).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }

    /// Clears the lock's held state without going through a guard, for the one case
    /// (a freshly scheduled process resuming in `fork_ret`) where the lock was
    /// acquired by the scheduler on a different stack and the guard that would
    /// normally release it never crosses the context switch.
    ///
    /// # Safety
    /// The caller must know the lock is currently held by the calling CPU and that
    /// no other guard will later try to release the same acquisition.
    pub unsafe fn force_unlock(&self) {
        self.cpu.store(ptr::null_mut(), Ordering::Release);
    }
}

impl<'a, T: 'a> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        // Safety: the guard holds an interrupt lock, so calling holding() is race-free.
        unsafe {
            assert!(self.lock.holding(), "release lock {}", self.lock.name);
        }

        self.lock.cpu.store(ptr::null_mut(), Ordering::Release);
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}
