//! Job-control syscalls: setpgid, getpgid, setsid, getsid.

use core::sync::atomic::Ordering;

use crate::arch::Registers;
use crate::syscall::errno;
use crate::syscall::helpers::{complete, with_current};
use crate::task::{self, sessions};

pub fn sys_setpgid(regs: &mut Registers) {
    let pid = regs.rdi as i32;
    let pgid = regs.rsi as i32;
    let result = with_current(|current| {
        let target = task::translate_pid(pid).ok_or(errno::ESRCH)?;
        sessions::set_pgid(current, &target, pgid)?;
        Ok(0)
    });
    complete(regs, result);
}

pub fn sys_getpgid(regs: &mut Registers) {
    let pid = regs.rdi as i32;
    let result = task::translate_pid(pid)
        .map(|target| target.pgid.load(Ordering::Acquire) as u64)
        .ok_or(errno::ESRCH);
    complete(regs, result);
}

pub fn sys_setsid(regs: &mut Registers) {
    let result = with_current(|current| sessions::create_session(current).map(|sid| sid as u64));
    complete(regs, result);
}

pub fn sys_getsid(regs: &mut Registers) {
    let result = with_current(|current| Ok(current.sid.load(Ordering::Acquire) as u64));
    complete(regs, result);
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::cpu;
    use crate::task::{Task, Thread};
    use crate::test_support::{become_current, kernel_test};

    #[test]
    fn setsid_round_trip_through_the_syscall_surface() {
        let _guard = kernel_test();
        let task = Task::create_default();
        let thread = Thread::create_default(&task).unwrap();
        become_current(&task, &thread);

        let mut regs = Registers::default();
        sys_setsid(&mut regs);
        let sid = regs.rax;
        assert_ne!(sid, u64::MAX);

        // getsid(getpid()) and getpgid(getpid()) observe the new ids.
        let mut regs = Registers::default();
        sys_getsid(&mut regs);
        assert_eq!(regs.rax, sid);

        let mut regs = Registers {
            rdi: task.pid() as u64,
            ..Registers::default()
        };
        sys_getpgid(&mut regs);
        assert_eq!(regs.rax, sid); // leader's pgid equals the new sid

        // A second setsid fails with EPERM.
        let mut regs = Registers::default();
        sys_setsid(&mut regs);
        assert_eq!(regs.rax, u64::MAX);
        assert_eq!(cpu::errno(), errno::EPERM);
    }

    #[test]
    fn group_queries_on_unknown_pids_are_esrch() {
        let _guard = kernel_test();
        let task = Task::create_default();
        let thread = Thread::create_default(&task).unwrap();
        become_current(&task, &thread);

        let mut regs = Registers {
            rdi: 999,
            ..Registers::default()
        };
        sys_getpgid(&mut regs);
        assert_eq!(regs.rax, u64::MAX);
        assert_eq!(cpu::errno(), errno::ESRCH);

        let mut regs = Registers {
            rdi: 999,
            rsi: 7,
            ..Registers::default()
        };
        sys_setpgid(&mut regs);
        assert_eq!(regs.rax, u64::MAX);
        assert_eq!(cpu::errno(), errno::ESRCH);
    }
}
