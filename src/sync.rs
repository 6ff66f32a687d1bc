//! # Synchronization Primitives
//!
//! Interrupt-safe critical section abstractions. All shared scheduler state
//! is reached through an [`IrqSpinLock`], which masks interrupts for as long
//! as the lock is held, so thread code and interrupt handlers never observe
//! a half-updated run queue or timer list.
//!
//! On the Cortex-M4 build the critical section comes from `cortex-m`'s
//! single-core implementation (`cpsid i` / restore PRIMASK). Host tests link
//! the `std` implementation of the `critical-section` crate instead.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use critical_section::RestoreState;

/// Execute a closure within a critical section (interrupts disabled).
///
/// Interrupts are disabled on entry and restored on exit, ensuring atomicity
/// of the enclosed operation.
///
/// # Usage
/// ```ignore
/// sync::critical_section(|_cs| {
///     // Access shared state safely
/// });
/// ```
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(critical_section::CriticalSection<'_>) -> R,
{
    critical_section::with(f)
}

/// Spin lock acquired with interrupts disabled.
///
/// The lock is strictly non-reentrant: a context that already holds it and
/// tries again has broken the kernel's lock discipline, which is fatal.
/// Code paths that need both the run-queue lock and the clock-source lock
/// take the run queue first.
pub struct IrqSpinLock<T> {
    inner: spin::Mutex<T>,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Disable interrupts and take the lock.
    ///
    /// # Panics
    /// When the lock is already held. On a single core the holder can only
    /// be the caller itself (interrupts are masked while it is held).
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        // SAFETY: released exactly once, in the guard's Drop.
        let restore = unsafe { critical_section::acquire() };
        match self.inner.try_lock() {
            Some(guard) => IrqSpinLockGuard {
                guard: ManuallyDrop::new(guard),
                restore,
            },
            None => {
                // SAFETY: pairs with the acquire above.
                unsafe { critical_section::release(restore) };
                panic!("recursive acquisition of a kernel spin lock");
            }
        }
    }

    /// Whether some context holds the lock.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Access the protected value through an exclusive borrow, no locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

/// Guard returned by [`IrqSpinLock::lock`]. Unlocks and restores the saved
/// interrupt state when dropped.
pub struct IrqSpinLockGuard<'a, T> {
    guard: ManuallyDrop<spin::MutexGuard<'a, T>>,
    restore: RestoreState,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Unlock before interrupts come back on.
        // SAFETY: the guard is never touched again after this point.
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
            critical_section::release(self.restore);
        }
    }
}
