//! Identity syscalls: pids, uid/gid triples, umask.

use core::sync::atomic::Ordering;

use crate::arch::Registers;
use crate::cpu;
use crate::syscall::errno;
use crate::syscall::helpers::{complete, fail, ok, with_current};

pub fn sys_getpid(regs: &mut Registers) {
    ok(regs, cpu::current_pid() as u64);
}

pub fn sys_gettid(regs: &mut Registers) {
    ok(regs, cpu::current_tid() as u64);
}

pub fn sys_getppid(regs: &mut Registers) {
    complete(
        regs,
        with_current(|task| Ok(task.ppid.load(Ordering::Acquire) as u64)),
    );
}

pub fn sys_getuid(regs: &mut Registers) {
    complete(regs, with_current(|task| Ok(u64::from(task.creds.lock().real_uid))));
}

pub fn sys_geteuid(regs: &mut Registers) {
    complete(
        regs,
        with_current(|task| Ok(u64::from(task.creds.lock().effective_uid))),
    );
}

pub fn sys_getgid(regs: &mut Registers) {
    complete(regs, with_current(|task| Ok(u64::from(task.creds.lock().real_gid))));
}

pub fn sys_getegid(regs: &mut Registers) {
    complete(
        regs,
        with_current(|task| Ok(u64::from(task.creds.lock().effective_gid))),
    );
}

/// Root sets all three uids; anyone else may switch the effective
/// uid to one of its real/effective/saved ids.
pub fn sys_setuid(regs: &mut Registers) {
    let uid = regs.rdi as u32;
    let result = with_current(|task| {
        let mut creds = task.creds.lock();
        if creds.effective_uid == 0 {
            creds.real_uid = uid;
            creds.effective_uid = uid;
            creds.saved_uid = uid;
            return Ok(0);
        }
        if creds.real_uid == uid || creds.effective_uid == uid || creds.saved_uid == uid {
            creds.effective_uid = uid;
            return Ok(0);
        }
        Err(errno::EPERM)
    });
    complete(regs, result);
}

pub fn sys_seteuid(regs: &mut Registers) {
    let euid = regs.rdi as u32;
    let result = with_current(|task| {
        let mut creds = task.creds.lock();
        if creds.real_uid == euid || creds.effective_uid == euid || creds.saved_uid == euid {
            creds.effective_uid = euid;
            return Ok(0);
        }
        Err(errno::EPERM)
    });
    complete(regs, result);
}

pub fn sys_setgid(regs: &mut Registers) {
    let gid = regs.rdi as u32;
    let result = with_current(|task| {
        let mut creds = task.creds.lock();
        if creds.effective_uid == 0 {
            creds.real_gid = gid;
            creds.effective_gid = gid;
            creds.saved_gid = gid;
            return Ok(0);
        }
        if creds.real_gid == gid || creds.effective_gid == gid || creds.saved_gid == gid {
            creds.effective_gid = gid;
            return Ok(0);
        }
        Err(errno::EPERM)
    });
    complete(regs, result);
}

pub fn sys_setegid(regs: &mut Registers) {
    let egid = regs.rdi as u32;
    let result = with_current(|task| {
        let mut creds = task.creds.lock();
        if creds.real_gid == egid || creds.effective_gid == egid || creds.saved_gid == egid {
            creds.effective_gid = egid;
            return Ok(0);
        }
        Err(errno::EPERM)
    });
    complete(regs, result);
}

/// Swaps the file-creation mask, returning the old one.
pub fn sys_umask(regs: &mut Registers) {
    let mask = regs.rdi as u32 & 0o777;
    match with_current(|task| Ok(task.umask.swap(mask, Ordering::AcqRel))) {
        Ok(old) => ok(regs, u64::from(old)),
        Err(code) => fail(regs, code),
    }
}
