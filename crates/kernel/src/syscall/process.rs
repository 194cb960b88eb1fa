//! Lifecycle syscalls: exit, fork, waitpid, execve.

use crate::arch::Registers;
use crate::syscall::helpers::{fail, ok, read_user_string, read_user_string_vec, with_current};
use crate::task::lifecycle::{self, Arguments};

pub fn sys_exit(regs: &mut Registers) {
    let status = regs.rdi as i32;
    lifecycle::exit(status);
    // Bare metal never gets here; host tests observe a clean return.
    ok(regs, 0);
}

pub fn sys_fork(regs: &mut Registers) {
    match lifecycle::fork(regs) {
        Ok(child) => ok(regs, child.pid() as u64),
        Err(code) => fail(regs, code),
    }
}

pub fn sys_waitpid(regs: &mut Registers) {
    let pid = regs.rdi as i32;
    let status_addr = regs.rsi;
    // rdx carries the options word; none are honored yet.

    match lifecycle::waitpid(pid) {
        Ok((reaped, status)) => {
            if status_addr != 0 {
                let wrote = with_current(|task| {
                    let guard = task.space.lock();
                    let space = guard.as_ref().ok_or(crate::syscall::errno::EFAULT)?;
                    space
                        .write(status_addr, &status.to_le_bytes())
                        .map_err(|_| crate::syscall::errno::EFAULT)?;
                    Ok(0u64)
                });
                if let Err(code) = wrote {
                    fail(regs, code);
                    return;
                }
            }
            ok(regs, reaped as u64);
        }
        Err(code) => fail(regs, code),
    }
}

pub fn sys_execve(regs: &mut Registers) {
    let path_addr = regs.rdi;
    let argv_addr = regs.rsi;
    let envp_addr = regs.rdx;

    let parsed = with_current(|task| {
        let guard = task.space.lock();
        let space = guard.as_ref().ok_or(crate::syscall::errno::EFAULT)?;
        let path = read_user_string(space, path_addr)?;
        let argv = read_user_string_vec(space, argv_addr)?;
        let envp = read_user_string_vec(space, envp_addr)?;
        Ok((path, argv, envp))
    });

    let (path, argv, envp) = match parsed {
        Ok(parts) => parts,
        Err(code) => {
            fail(regs, code);
            return;
        }
    };

    let args = Arguments { argv, envp };
    match lifecycle::execve(&path, &args) {
        // Reached on host builds only; the bare-metal path yields
        // into the new image and never returns.
        Ok(()) => ok(regs, 0),
        Err(code) => fail(regs, code),
    }
}
