//! Thread-context syscalls: FS/GS base for TLS, and the kernel log
//! passthrough.

use core::sync::atomic::Ordering;

use crate::arch::{self, Registers};
use crate::syscall::helpers::{complete, ok, read_user_string, with_current, with_current_space};
use crate::task;

pub fn sys_set_fs_base(regs: &mut Registers) {
    let addr = regs.rdi;
    let result = with_current(|_task| {
        if let Some(thread) = task::current_thread() {
            thread.user_fs_base.store(addr, Ordering::Release);
        }
        arch::set_user_fs_base(addr);
        Ok(0)
    });
    complete(regs, result);
}

pub fn sys_get_fs_base(regs: &mut Registers) {
    ok(regs, arch::user_fs_base());
}

pub fn sys_set_gs_base(regs: &mut Registers) {
    let addr = regs.rdi;
    let result = with_current(|_task| {
        if let Some(thread) = task::current_thread() {
            thread.user_gs_base.store(addr, Ordering::Release);
        }
        arch::set_user_gs_base(addr);
        Ok(0)
    });
    complete(regs, result);
}

pub fn sys_get_gs_base(regs: &mut Registers) {
    ok(regs, arch::user_gs_base());
}

/// Copies a user string into the kernel log.
pub fn sys_syslog(regs: &mut Registers) {
    let addr = regs.rdi;
    let result = with_current_space(|space| {
        let text = read_user_string(space, addr)?;
        log::info!("{text}");
        Ok(0)
    });
    complete(regs, result);
}
