//! Anonymous memory syscalls over the address-space ledger.
//! File-backed mappings belong to the external memory manager.

use crate::arch::Registers;
use crate::syscall::errno;
use crate::syscall::helpers::{complete, with_current};
use crate::vm::Prot;

pub const PROT_READ: u32 = 1;
pub const PROT_WRITE: u32 = 2;
pub const PROT_EXEC: u32 = 4;

pub const MAP_ANONYMOUS: u32 = 0x20;

fn prot_from_user(prot: u32) -> Prot {
    let mut out = Prot::USER;
    if prot & PROT_READ != 0 {
        out |= Prot::READ;
    }
    if prot & PROT_WRITE != 0 {
        out |= Prot::WRITE;
    }
    if prot & PROT_EXEC != 0 {
        out |= Prot::EXEC;
    }
    out
}

pub fn sys_mmap(regs: &mut Registers) {
    let len = regs.rsi as usize;
    let prot = regs.rdx as u32;
    let flags = regs.rcx as u32;

    let result = with_current(|task| {
        if flags & MAP_ANONYMOUS == 0 {
            return Err(errno::ENOSYS);
        }
        if len == 0 {
            return Err(errno::EINVAL);
        }
        let mut guard = task.space.lock();
        let space = guard.as_mut().ok_or(errno::EFAULT)?;
        space
            .map_anonymous(len, prot_from_user(prot))
            .map_err(|_| errno::ENOMEM)
    });
    complete(regs, result);
}

pub fn sys_munmap(regs: &mut Registers) {
    let addr = regs.rdi;
    let len = regs.rsi as usize;

    let result = with_current(|task| {
        let mut guard = task.space.lock();
        let space = guard.as_mut().ok_or(errno::EFAULT)?;
        space.unmap_range(addr, len).map_err(|_| errno::EINVAL)?;
        Ok(0)
    });
    complete(regs, result);
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::test_support::{become_current, kernel_test, task_with_user_page};

    #[test]
    fn anonymous_mmap_maps_and_munmap_unmaps() {
        let _guard = kernel_test();
        let (task, thread, _scratch) = task_with_user_page();
        become_current(&task, &thread);

        let mut regs = Registers {
            rsi: 8192,
            rdx: u64::from(PROT_READ | PROT_WRITE),
            rcx: u64::from(MAP_ANONYMOUS),
            ..Registers::default()
        };
        sys_mmap(&mut regs);
        let base = regs.rax;
        assert_ne!(base, u64::MAX);

        {
            let guard = task.space.lock();
            let space = guard.as_ref().unwrap();
            space.write(base, b"mapped").unwrap();
        }

        let mut regs = Registers {
            rdi: base,
            rsi: 8192,
            ..Registers::default()
        };
        sys_munmap(&mut regs);
        assert_eq!(regs.rax, 0);
        {
            let guard = task.space.lock();
            assert!(guard.as_ref().unwrap().page_refcount(base).is_none());
        }
    }

    #[test]
    fn file_backed_mappings_are_refused_here() {
        let _guard = kernel_test();
        let (task, thread, _scratch) = task_with_user_page();
        become_current(&task, &thread);

        let mut regs = Registers {
            rsi: 4096,
            rdx: u64::from(PROT_READ),
            rcx: 0, // not MAP_ANONYMOUS
            ..Registers::default()
        };
        sys_mmap(&mut regs);
        assert_eq!(regs.rax, u64::MAX);
        assert_eq!(crate::cpu::errno(), errno::ENOSYS);
    }
}
