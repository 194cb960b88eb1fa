//! VesperOS scheduler and process-lifecycle core.
//!
//! Multiplexes CPU cores over a single global ready set, enforces the
//! UNIX process model (fork, execve, exit, waitpid), bridges blocking
//! syscalls and wakeups through a level-triggered event primitive,
//! delivers signals at return-to-user, and maintains the session /
//! process-group topology behind job control.
//!
//! The memory managers, VFS, drivers and interrupt controllers live
//! outside this crate; what the core needs from them enters through
//! the seams in [`vm`], [`fs`] and `vos_hal`.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod arch;
pub mod cpu;
pub mod event;
pub mod fs;
pub mod loader;
pub mod signal;
pub mod syscall;
pub mod task;
pub mod time;
pub mod vm;
