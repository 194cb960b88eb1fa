//! Interrupt-safe locking.

use core::ops::{Deref, DerefMut};

use vos_utils::{Mutex, MutexGuard};

use crate::interrupts;

/// Spinlock that masks interrupts for the lifetime of the guard.
///
/// Plain spinlocks deadlock when an interrupt handler reenters the
/// lock on the same core; masking IF before spinning removes that
/// path. The saved flag state travels in the guard, so nesting works.
pub struct IrqSafeLock<T> {
    inner: Mutex<T>,
}

impl<T> IrqSafeLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Masks interrupts, then spins for the lock.
    pub fn lock(&self) -> IrqSafeGuard<'_, T> {
        let saved = interrupts::disable();
        IrqSafeGuard {
            guard: Some(self.inner.lock()),
            saved,
        }
    }

    /// Non-blocking acquire for interrupt-context callers (the timer
    /// handler must never spin on the scheduler lock).
    pub fn try_lock(&self) -> Option<IrqSafeGuard<'_, T>> {
        let saved = interrupts::disable();
        match self.inner.try_lock() {
            Some(guard) => Some(IrqSafeGuard {
                guard: Some(guard),
                saved,
            }),
            None => {
                interrupts::restore(saved);
                None
            }
        }
    }
}

pub struct IrqSafeGuard<'a, T> {
    // Option so Drop can release the spinlock before restoring IF.
    guard: Option<MutexGuard<'a, T>>,
    saved: interrupts::Flags,
}

impl<T> Deref for IrqSafeGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T> DerefMut for IrqSafeGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T> Drop for IrqSafeGuard<'_, T> {
    fn drop(&mut self) {
        self.guard.take();
        interrupts::restore(self.saved);
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
