//! System-call dispatch.
//!
//! The table is ABI: index → name is fixed, userland is built
//! against it. Entries the core does not own (the external VFS and
//! device layers) start empty and are filled in at boot through
//! [`register`]; invoking an entry that never got a handler is an
//! invariant violation and panics with the syscall name.
//!
//! Convention: arguments in SysV order (rdi, rsi, rdx, rcx, r8,
//! r9), result in rax, `-1` plus the per-thread errno cell on
//! failure.

pub mod context;
pub mod fs;
pub mod groups;
pub mod helpers;
pub mod identity;
pub mod mm;
pub mod process;
pub mod signal;

use vos_hal::IrqSafeLock;

use crate::arch::Registers;
use crate::cpu;

/// Flat error codes written into the per-thread errno cell.
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const ESRCH: i32 = 3;
    pub const EINTR: i32 = 4;
    pub const EIO: i32 = 5;
    pub const EBADF: i32 = 9;
    pub const ECHILD: i32 = 10;
    pub const ENOMEM: i32 = 12;
    pub const EACCES: i32 = 13;
    pub const EFAULT: i32 = 14;
    pub const EEXIST: i32 = 17;
    pub const ENOTDIR: i32 = 20;
    pub const EINVAL: i32 = 22;
    pub const EMFILE: i32 = 24;
    pub const ENOTTY: i32 = 25;
    pub const ERANGE: i32 = 34;
    pub const ENOSYS: i32 = 38;
}

pub type Handler = fn(&mut Registers);

/// Number of table entries; the ABI surface.
pub const SYSCALL_COUNT: usize = 51;

struct SyscallHandle {
    handler: Option<Handler>,
    name: &'static str,
}

macro_rules! syscall {
    ($name:literal, $handler:path) => {
        SyscallHandle {
            handler: Some($handler),
            name: $name,
        }
    };
    ($name:literal) => {
        SyscallHandle {
            handler: None,
            name: $name,
        }
    };
}

/// The dispatch table. Order is ABI; do not reorder.
static SYSCALL_TABLE: [SyscallHandle; SYSCALL_COUNT] = [
    syscall!("open", fs::sys_open),              // 0
    syscall!("close", fs::sys_close),            // 1
    syscall!("read", fs::sys_read),              // 2
    syscall!("write", fs::sys_write),            // 3
    syscall!("seek", fs::sys_seek),              // 4
    syscall!("dup", fs::sys_dup),                // 5
    syscall!("dup2", fs::sys_dup2),              // 6
    syscall!("mmap", mm::sys_mmap),              // 7
    syscall!("munmap", mm::sys_munmap),          // 8
    syscall!("set_fs_base", context::sys_set_fs_base), // 9
    syscall!("set_gs_base", context::sys_set_gs_base), // 10
    syscall!("get_fs_base", context::sys_get_fs_base), // 11
    syscall!("get_gs_base", context::sys_get_gs_base), // 12
    syscall!("syslog", context::sys_syslog),     // 13
    syscall!("exit", process::sys_exit),         // 14
    syscall!("getpid", identity::sys_getpid),    // 15
    syscall!("gettid", identity::sys_gettid),    // 16
    syscall!("getppid", identity::sys_getppid),  // 17
    syscall!("isatty"),                          // 18
    syscall!("fcntl", fs::sys_fcntl),            // 19
    syscall!("fstat", fs::sys_fstat),            // 20
    syscall!("fstatat", fs::sys_fstatat),        // 21
    syscall!("ioctl", fs::sys_ioctl),            // 22
    syscall!("fork", process::sys_fork),         // 23
    syscall!("waitpid", process::sys_waitpid),   // 24
    syscall!("readdir"),                         // 25
    syscall!("execve", process::sys_execve),     // 26
    syscall!("getcwd", fs::sys_getcwd),          // 27
    syscall!("chdir", fs::sys_chdir),            // 28
    syscall!("faccessat", fs::sys_faccessat),    // 29
    syscall!("pipe"),                            // 30
    syscall!("umask", identity::sys_umask),      // 31
    syscall!("getuid", identity::sys_getuid),    // 32
    syscall!("geteuid", identity::sys_geteuid),  // 33
    syscall!("setuid", identity::sys_setuid),    // 34
    syscall!("seteuid", identity::sys_seteuid),  // 35
    syscall!("getgid", identity::sys_getgid),    // 36
    syscall!("getegid", identity::sys_getegid),  // 37
    syscall!("setgid", identity::sys_setgid),    // 38
    syscall!("setegid", identity::sys_setegid),  // 39
    syscall!("fchmod"),                          // 40
    syscall!("fchmodat"),                        // 41
    syscall!("fchownat"),                        // 42
    syscall!("sigaction", signal::sys_sigaction), // 43
    syscall!("sigpending", signal::sys_sigpending), // 44
    syscall!("sigprocmask", signal::sys_sigprocmask), // 45
    syscall!("kill", signal::sys_kill),          // 46
    syscall!("setpgid", groups::sys_setpgid),    // 47
    syscall!("getpgid", groups::sys_getpgid),    // 48
    syscall!("setsid", groups::sys_setsid),      // 49
    syscall!("getsid", groups::sys_getsid),      // 50
];

/// Handlers the external layers installed at boot.
static REGISTERED: IrqSafeLock<[Option<Handler>; SYSCALL_COUNT]> =
    IrqSafeLock::new([None; SYSCALL_COUNT]);

/// Installs a handler for a table entry the core ships empty.
/// Returns false when the number is out of range or the core already
/// owns the entry.
pub fn register(number: usize, handler: Handler) -> bool {
    let Some(entry) = SYSCALL_TABLE.get(number) else {
        return false;
    };
    if entry.handler.is_some() {
        return false;
    }
    REGISTERED.lock()[number] = Some(handler);
    true
}

/// Name of a table entry (strace, panic messages).
pub fn syscall_name(number: usize) -> Option<&'static str> {
    SYSCALL_TABLE.get(number).map(|entry| entry.name)
}

/// Entry point from the syscall interrupt: `rax` holds the number.
pub fn handle(regs: &mut Registers) {
    let number = regs.rax as usize;

    let Some(entry) = SYSCALL_TABLE.get(number) else {
        log::warn!("[SYSCALL] unknown syscall number {number}");
        return;
    };

    #[cfg(feature = "verbose-syscalls")]
    log::trace!(
        "syscall: [pid {}] {}({:#x}, {:#x}, {:#x})",
        cpu::current_pid(),
        entry.name,
        regs.rdi,
        regs.rsi,
        regs.rdx
    );

    let handler = entry.handler.or_else(|| REGISTERED.lock()[number]);
    match handler {
        Some(handler) => handler(regs),
        None => panic!("null syscall {}", entry.name),
    }

    if regs.rax != u64::MAX {
        cpu::set_errno(0);
    }

    #[cfg(feature = "verbose-syscalls")]
    log::trace!(
        "syscall: [pid {}] {} returning {:#x} with errno {}",
        cpu::current_pid(),
        entry.name,
        regs.rax,
        cpu::errno()
    );
}
