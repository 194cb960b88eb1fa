//! Signal syscalls: sigaction, sigpending, sigprocmask, kill.

use core::sync::atomic::Ordering;

use crate::arch::Registers;
use crate::cpu;
use crate::signal::{SIGNAL_MAX, Sigaction, SigactionFlags};
use crate::syscall::errno;
use crate::syscall::helpers::{complete, read_user_bytes, with_current, write_user_bytes};
use crate::task;

pub const SIG_BLOCK: i32 = 0;
pub const SIG_UNBLOCK: i32 = 1;
pub const SIG_SETMASK: i32 = 2;

/// Userspace sigaction layout.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
struct UserSigaction {
    sa_handler: u64,
    sa_flags: u64,
    sa_restorer: u64,
    sa_mask: u64,
}

fn valid_signum(signum: i32) -> bool {
    (0..SIGNAL_MAX as i32).contains(&signum)
}

pub fn sys_sigaction(regs: &mut Registers) {
    let signum = regs.rdi as i32;
    let act_addr = regs.rsi;
    let old_addr = regs.rdx;

    let result = with_current(|task| {
        if !valid_signum(signum) {
            return Err(errno::EINVAL);
        }
        let space_guard = task.space.lock();
        let space = space_guard.as_ref().ok_or(errno::EFAULT)?;

        if old_addr != 0 {
            let current = task.sigactions.lock()[signum as usize];
            let user = UserSigaction {
                sa_handler: current.handler,
                sa_flags: current.flags.bits(),
                sa_restorer: current.restorer,
                sa_mask: u64::from(current.mask),
            };
            // SAFETY: UserSigaction is repr(C) plain data.
            let bytes = unsafe {
                core::slice::from_raw_parts(
                    (&raw const user).cast::<u8>(),
                    core::mem::size_of::<UserSigaction>(),
                )
            };
            write_user_bytes(space, old_addr, bytes)?;
        }

        if act_addr != 0 {
            let bytes = read_user_bytes(space, act_addr, core::mem::size_of::<UserSigaction>())?;
            let mut user = UserSigaction::default();
            // SAFETY: bytes has exactly size_of::<UserSigaction>() bytes.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    (&raw mut user).cast::<u8>(),
                    core::mem::size_of::<UserSigaction>(),
                );
            }
            task.sigactions.lock()[signum as usize] = Sigaction {
                handler: user.sa_handler,
                mask: user.sa_mask as u32,
                flags: SigactionFlags::from_bits_truncate(user.sa_flags),
                restorer: user.sa_restorer,
            };
        }

        Ok(0)
    });
    complete(regs, result);
}

/// Signals both pending and blocked on the calling thread.
pub fn sys_sigpending(regs: &mut Registers) {
    let set_addr = regs.rdi;
    let result = with_current(|task| {
        let thread = task::current_thread().ok_or(errno::ESRCH)?;
        let pending = thread.sigpending.load(Ordering::Acquire)
            & thread.sigmask.load(Ordering::Acquire);
        let space_guard = task.space.lock();
        let space = space_guard.as_ref().ok_or(errno::EFAULT)?;
        space
            .write_u64(set_addr, u64::from(pending))
            .map_err(|_| errno::EFAULT)?;
        Ok(0)
    });
    complete(regs, result);
}

pub fn sys_sigprocmask(regs: &mut Registers) {
    let how = regs.rdi as i32;
    let set_addr = regs.rsi;
    let old_addr = regs.rdx;

    let result = with_current(|task| {
        let thread = task::current_thread().ok_or(errno::ESRCH)?;
        let space_guard = task.space.lock();
        let space = space_guard.as_ref().ok_or(errno::EFAULT)?;

        if old_addr != 0 {
            let current = thread.sigmask.load(Ordering::Acquire);
            space
                .write_u64(old_addr, u64::from(current))
                .map_err(|_| errno::EFAULT)?;
        }

        if set_addr != 0 {
            let mask = space.read_u64(set_addr).map_err(|_| errno::EFAULT)? as u32;
            match how {
                SIG_BLOCK => {
                    thread.sigmask.fetch_or(mask, Ordering::AcqRel);
                }
                SIG_UNBLOCK => {
                    thread.sigmask.fetch_and(!mask, Ordering::AcqRel);
                }
                SIG_SETMASK => {
                    thread.sigmask.store(mask, Ordering::Release);
                }
                _ => return Err(errno::EINVAL),
            }
        }

        Ok(0)
    });
    complete(regs, result);
}

pub fn sys_kill(regs: &mut Registers) {
    let pid = regs.rdi as i32;
    let signum = regs.rsi as i32;
    let sender_pid = cpu::current_pid();
    let sender_uid = task::current_task()
        .map(|task| task.creds.lock().effective_uid)
        .unwrap_or(0);
    let result = crate::signal::send(sender_pid, sender_uid, pid, signum).map(|()| 0);
    complete(regs, result);
}
