//! Signal state and delivery.
//!
//! Dispositions hang off the task; pending bits, the mask and the
//! queued payloads hang off each thread. Delivery happens inside the
//! context switch just before a thread returns to user: the
//! scheduler forges a call frame on the user stack, rewrites the
//! saved registers to enter the handler, and clears the pending bit.
//! One signal per dispatch; the rest wait for later ticks.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::arch::Registers;
use crate::task::{Task, TaskStatus, Thread};

pub const SIGNAL_MAX: usize = 32;

pub const SIGHUP: i32 = 1;
pub const SIGINT: i32 = 2;
pub const SIGKILL: i32 = 9;
pub const SIGUSR1: i32 = 10;
pub const SIGUSR2: i32 = 12;
pub const SIGTERM: i32 = 15;
pub const SIGCHLD: i32 = 17;
pub const SIGCONT: i32 = 18;

/// System V red zone below the interrupted stack pointer.
const RED_ZONE: u64 = 128;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct SigactionFlags: u64 {
        /// Handler takes `(signum, &siginfo, &ucontext)`.
        const SIGINFO = 0x4;
    }
}

/// Disposition of one signal. `handler == 0` is SIG_DFL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sigaction {
    pub handler: u64,
    pub mask: u32,
    pub flags: SigactionFlags,
    pub restorer: u64,
}

/// Payload pushed for SA_SIGINFO handlers.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Siginfo {
    pub si_signo: i32,
    pub si_code: i32,
    pub si_pid: i32,
    pub si_uid: u32,
    pub si_status: i32,
    pub si_addr: u64,
}

/// What `kill` parked for the delivery path: the signal and the
/// disposition snapshot taken at queue time.
#[derive(Clone, Copy)]
pub struct QueuedSignal {
    pub signum: i32,
    pub action: Sigaction,
    pub info: Siginfo,
}

/// Queues `signum` on the target's main thread and, when the target
/// is parked, fires its sig-wait event so a blocked waiter comes
/// back through the ready set.
pub fn send(sender_pid: i32, sender_uid: u32, pid: i32, signum: i32) -> Result<(), i32> {
    use crate::syscall::errno;

    if !(0..SIGNAL_MAX as i32).contains(&signum) {
        return Err(errno::EINVAL);
    }
    let task = crate::task::translate_pid(pid).ok_or(errno::ESRCH)?;
    let thread = task.main_thread().ok_or(errno::ESRCH)?;

    let action = task.sigactions.lock()[signum as usize];
    thread.signal_queue.lock()[signum as usize] = Some(QueuedSignal {
        signum,
        action,
        info: Siginfo {
            si_signo: signum,
            si_pid: sender_pid,
            si_uid: sender_uid,
            ..Siginfo::default()
        },
    });
    thread.sigpending.fetch_or(1 << signum, Ordering::AcqRel);

    if thread.status() == TaskStatus::Yield {
        let _ = crate::event::fire(&thread.sig_trigger);
    }
    Ok(())
}

/// Delivery hook, run by the scheduler with the thread chosen but
/// not yet resumed. Rewrites the saved frame for the lowest pending
/// unmasked signal.
pub fn deliver_pending(task: &Arc<Task>, thread: &Arc<Thread>) {
    let pending = thread.sigpending.load(Ordering::Acquire);
    let mask = thread.sigmask.load(Ordering::Acquire);
    let deliverable = pending & !mask;
    if deliverable == 0 {
        return;
    }
    let signum = deliverable.trailing_zeros() as usize;

    let queued = thread.signal_queue.lock()[signum].take();
    let action = match queued {
        Some(q) => q.action,
        None => task.sigactions.lock()[signum],
    };
    let info = queued.map(|q| q.info).unwrap_or(Siginfo {
        si_signo: signum as i32,
        ..Siginfo::default()
    });

    thread.sigpending.fetch_and(!(1 << signum), Ordering::AcqRel);

    if action.handler == 0 {
        // SIG_DFL with no registered handler: nothing to enter.
        return;
    }

    let mut regs = thread.regs.lock();
    regs.rsp -= RED_ZONE;
    regs.rsp &= !0xF;

    if action.flags.contains(SigactionFlags::SIGINFO) {
        let space_guard = task.space.lock();
        let Some(space) = space_guard.as_ref() else {
            return;
        };

        regs.rsp -= core::mem::size_of::<Siginfo>() as u64;
        let siginfo_addr = regs.rsp;
        // SAFETY: Siginfo is repr(C) plain data.
        let info_bytes = unsafe {
            core::slice::from_raw_parts(
                (&raw const info).cast::<u8>(),
                core::mem::size_of::<Siginfo>(),
            )
        };
        if space.write(siginfo_addr, info_bytes).is_err() {
            return;
        }

        let context = *regs;
        regs.rsp -= core::mem::size_of::<Registers>() as u64;
        let ucontext_addr = regs.rsp;
        // SAFETY: Registers is repr(C) plain data.
        let context_bytes = unsafe {
            core::slice::from_raw_parts(
                (&raw const context).cast::<u8>(),
                core::mem::size_of::<Registers>(),
            )
        };
        if space.write(ucontext_addr, context_bytes).is_err() {
            return;
        }

        regs.rip = action.handler;
        regs.rdi = signum as u64;
        regs.rsi = siginfo_addr;
        regs.rdx = ucontext_addr;
    } else {
        regs.rip = action.handler;
        regs.rdi = signum as u64;
    }
}
