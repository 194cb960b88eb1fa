//! x86-64 specifics: the interrupt frame, segment selectors, FS/GS
//! base plumbing and the reschedule kick.
//!
//! On host builds (`std`) the privileged operations degrade to
//! observable stand-ins so the scheduler logic stays testable: FS/GS
//! bases live in thread-locals, the self-IPI is counted by the hal
//! mock, and `halt_until_rescheduled` returns instead of halting.

use vos_hal::apic;

/// Vector the timer and every voluntary reschedule funnel into.
pub const RESCHEDULE_VECTOR: u8 = apic::RESCHEDULE_VECTOR;

/// Ring-3 code selector; user SS sits one descriptor below.
pub const USER_CS: u64 = 0x43;
pub const USER_SS: u64 = USER_CS - 8;

/// Ring-0 code selector; kernel SS sits one descriptor above.
pub const KERNEL_CS: u64 = 0x08;
pub const KERNEL_SS: u64 = KERNEL_CS + 8;

/// RFLAGS with IF set, the state every fresh thread starts in.
pub const RFLAGS_IF: u64 = 0x202;

/// Saved register frame, in push order of the interrupt stubs: the
/// general registers with r15 lowest, then the vector/error words,
/// then the hardware iretq frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub isr_number: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl Registers {
    /// True when the frame was captured in ring 3.
    pub fn from_user(&self) -> bool {
        self.cs & 0x3 != 0
    }
}

#[cfg(feature = "std")]
mod imp {
    use core::cell::Cell;

    std::thread_local! {
        static FS_BASE: Cell<u64> = const { Cell::new(0) };
        static GS_BASE: Cell<u64> = const { Cell::new(0) };
    }

    pub fn set_user_fs_base(addr: u64) {
        FS_BASE.with(|c| c.set(addr));
    }

    pub fn user_fs_base() -> u64 {
        FS_BASE.with(Cell::get)
    }

    pub fn set_user_gs_base(addr: u64) {
        GS_BASE.with(|c| c.set(addr));
    }

    pub fn user_gs_base() -> u64 {
        GS_BASE.with(Cell::get)
    }

    pub unsafe fn swapgs() {}

    pub unsafe fn load_page_table(_root: u64) {}

    pub fn halt_until_rescheduled() {
        // Host builds have no interrupt to wait for; the caller's
        // test drives the dispatch loop by hand.
    }
}

#[cfg(all(not(feature = "std"), target_arch = "x86_64"))]
mod imp {
    use vos_hal::x86_64::cpu;

    pub fn set_user_fs_base(addr: u64) {
        cpu::set_user_fs_base(addr);
    }

    pub fn user_fs_base() -> u64 {
        cpu::user_fs_base()
    }

    pub fn set_user_gs_base(addr: u64) {
        cpu::set_user_gs_base(addr);
    }

    pub fn user_gs_base() -> u64 {
        cpu::user_gs_base()
    }

    pub unsafe fn swapgs() {
        unsafe { cpu::swapgs() };
    }

    pub unsafe fn load_page_table(root: u64) {
        if root != 0 && cpu::read_cr3() != root {
            unsafe { cpu::write_cr3(root) };
        }
    }

    pub fn halt_until_rescheduled() -> ! {
        loop {
            cpu::wait_for_interrupt();
        }
    }
}

pub fn set_user_fs_base(addr: u64) {
    imp::set_user_fs_base(addr);
}

pub fn user_fs_base() -> u64 {
    imp::user_fs_base()
}

pub fn set_user_gs_base(addr: u64) {
    imp::set_user_gs_base(addr);
}

pub fn user_gs_base() -> u64 {
    imp::user_gs_base()
}

/// # Safety
/// Must pair with the syscall/interrupt entry swap.
pub unsafe fn swapgs() {
    unsafe { imp::swapgs() };
}

/// Activates an address-space root (no-op for root 0 or on host).
///
/// # Safety
/// `root` must reference a live top-level page table.
pub unsafe fn load_page_table(root: u64) {
    unsafe { imp::load_page_table(root) };
}

/// Sends the reschedule vector to this core.
pub fn reschedule_self() {
    apic::send_self_ipi(RESCHEDULE_VECTOR);
}

/// Parks the core until an interrupt dispatches someone else. On
/// host builds this returns immediately.
pub fn halt_until_rescheduled() {
    imp::halt_until_rescheduled();
}

/// Returns to ring 3 (or ring 0) on `frame`.
///
/// # Safety
/// `frame` must hold a consistent iretq frame whose stack and code
/// addresses are mapped in the active address space.
#[cfg(all(not(feature = "std"), target_arch = "x86_64"))]
pub unsafe fn resume_frame(frame: &Registers) -> ! {
    unsafe {
        core::arch::asm!(
            "mov rsp, {0}",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop r11",
            "pop r10",
            "pop r9",
            "pop r8",
            "pop rsi",
            "pop rdi",
            "pop rbp",
            "pop rdx",
            "pop rcx",
            "pop rbx",
            "pop rax",
            "add rsp, 16",
            "iretq",
            in(reg) frame as *const Registers,
            options(noreturn)
        );
    }
}
