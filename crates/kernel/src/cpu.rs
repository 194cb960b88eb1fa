//! Per-core state.
//!
//! Each core tracks which task/thread it is running (`-1` = idle),
//! the live errno cell of that thread, and the stack pointers the
//! syscall entry path needs. The timer handler reads and writes this
//! without locks, so every field is an atomic.

use core::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use vos_hal::apic;

pub const MAX_CORES: usize = 16;

/// Pid/tid sentinel for an idle core.
pub const NO_TASK: i32 = -1;

pub struct CoreLocal {
    pub pid: AtomicI32,
    pub tid: AtomicI32,
    pub errno: AtomicI32,
    pub kernel_stack: AtomicU64,
    pub user_stack: AtomicU64,
}

impl CoreLocal {
    const fn new() -> Self {
        Self {
            pid: AtomicI32::new(NO_TASK),
            tid: AtomicI32::new(NO_TASK),
            errno: AtomicI32::new(0),
            kernel_stack: AtomicU64::new(0),
            user_stack: AtomicU64::new(0),
        }
    }
}

static CORE_LOCALS: [CoreLocal; MAX_CORES] = [const { CoreLocal::new() }; MAX_CORES];

/// This core's slot, keyed by local-APIC id.
pub fn core_local() -> &'static CoreLocal {
    &CORE_LOCALS[apic::core_id() as usize % MAX_CORES]
}

pub fn current_pid() -> i32 {
    core_local().pid.load(Ordering::Acquire)
}

pub fn current_tid() -> i32 {
    core_local().tid.load(Ordering::Acquire)
}

/// True when this core runs no thread (invariant: pid == -1 iff idle).
pub fn is_idle() -> bool {
    current_pid() == NO_TASK
}

pub fn set_errno(value: i32) {
    core_local().errno.store(value, Ordering::Release);
}

pub fn errno() -> i32 {
    core_local().errno.load(Ordering::Acquire)
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::test_support::kernel_test;

    #[test]
    fn errno_cell_round_trips() {
        let _guard = kernel_test();
        set_errno(13);
        assert_eq!(errno(), 13);
        set_errno(0);
        assert_eq!(errno(), 0);
    }

    #[test]
    fn fresh_core_is_idle() {
        let _guard = kernel_test();
        assert!(is_idle());
        assert_eq!(current_pid(), NO_TASK);
        assert_eq!(current_tid(), NO_TASK);
    }
}
