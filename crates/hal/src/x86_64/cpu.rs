//! Privileged CPU state the scheduler touches on every dispatch.

use x86_64::VirtAddr;
use x86_64::registers::model_specific::{FsBase, KernelGsBase};

/// User FS base (TLS pointer) of the thread about to run.
pub fn set_user_fs_base(addr: u64) {
    FsBase::write(VirtAddr::new(addr));
}

pub fn user_fs_base() -> u64 {
    FsBase::read().as_u64()
}

/// While the kernel runs (post-swapgs), the user GS base parks in
/// IA32_KERNEL_GS_BASE; the return-to-user swapgs swaps it back in.
pub fn set_user_gs_base(addr: u64) {
    KernelGsBase::write(VirtAddr::new(addr));
}

pub fn user_gs_base() -> u64 {
    KernelGsBase::read().as_u64()
}

/// # Safety
/// Must be paired with the entry-path swap; an unbalanced swapgs
/// leaves the kernel running on a user GS base.
pub unsafe fn swapgs() {
    unsafe { core::arch::asm!("swapgs", options(nostack, preserves_flags)) };
}

/// Loads a new page-table root.
///
/// # Safety
/// `root` must be the physical address of a valid top-level table
/// that maps the current instruction stream.
pub unsafe fn write_cr3(root: u64) {
    unsafe { core::arch::asm!("mov cr3, {}", in(reg) root, options(nostack)) };
}

pub fn read_cr3() -> u64 {
    let value: u64;
    // SAFETY: reading CR3 has no side effects.
    unsafe { core::arch::asm!("mov {}, cr3", out(reg) value, options(nostack)) };
    value & !0xFFF
}

/// Halts until the next interrupt.
#[inline]
pub fn wait_for_interrupt() {
    x86_64::instructions::hlt();
}
