//! Interrupt flag control.
//!
//! `disable` returns the prior state so nested critical sections
//! restore correctly. On host builds the flag is a thread-local
//! boolean standing in for RFLAGS.IF, which keeps the lock and
//! scheduler invariants testable without a machine.

/// Opaque saved interrupt state for [`restore`].
pub type Flags = u64;

#[cfg(feature = "std")]
mod imp {
    use core::cell::Cell;

    std::thread_local! {
        static IF: Cell<bool> = const { Cell::new(true) };
    }

    pub fn disable() -> u64 {
        IF.with(|f| {
            let was = f.get();
            f.set(false);
            u64::from(was)
        })
    }

    pub unsafe fn enable() {
        IF.with(|f| f.set(true));
    }

    pub fn restore(state: u64) {
        IF.with(|f| f.set(state != 0));
    }

    pub fn is_enabled() -> bool {
        IF.with(Cell::get)
    }
}

#[cfg(all(not(feature = "std"), target_arch = "x86_64"))]
mod imp {
    use x86_64::instructions::interrupts;

    pub fn disable() -> u64 {
        let was = interrupts::are_enabled();
        interrupts::disable();
        u64::from(was)
    }

    pub unsafe fn enable() {
        interrupts::enable();
    }

    pub fn restore(state: u64) {
        if state != 0 {
            interrupts::enable();
        }
    }

    pub fn is_enabled() -> bool {
        interrupts::are_enabled()
    }
}

#[cfg(all(not(feature = "std"), not(target_arch = "x86_64")))]
mod imp {
    pub fn disable() -> u64 {
        0
    }

    pub unsafe fn enable() {}

    pub fn restore(_state: u64) {}

    pub fn is_enabled() -> bool {
        true
    }
}

/// Clears IF and returns the prior state.
#[inline(always)]
pub fn disable() -> Flags {
    imp::disable()
}

/// Unconditionally sets IF.
///
/// # Safety
/// Re-enabling interrupts inside a critical section hands control to
/// any pending handler; callers must not hold scheduler state.
#[inline(always)]
pub unsafe fn enable() {
    unsafe { imp::enable() }
}

/// Restores the state a matching [`disable`] returned.
#[inline(always)]
pub fn restore(state: Flags) {
    imp::restore(state);
}

#[inline(always)]
pub fn is_enabled() -> bool {
    imp::is_enabled()
}

/// Runs `f` with interrupts masked, restoring the prior state after.
pub fn without<R>(f: impl FnOnce() -> R) -> R {
    let state = disable();
    let out = f();
    restore(state);
    out
}

// ============================================================================
// Unit Tests
// ============================================================================
