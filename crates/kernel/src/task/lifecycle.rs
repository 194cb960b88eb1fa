//! Process lifecycle: fork, execve, exit, waitpid, and the
//! `task_exec` path that builds a task around a program image (used
//! by execve and to launch the first task).

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use vos_error::define_kernel_error;
use vos_hal::interrupts;

use crate::arch::{self, Registers};
use crate::cpu::{self, NO_TASK};
use crate::event::{self, EventType};
use crate::fs::{self, S_ISGID, S_ISUID, X_OK, stat_allows};
use crate::loader::elf::{self, Aux, ElfLoadError, INTERP_BIAS};
use crate::syscall::errno;
use crate::task::{
    self, Pid, THREAD_USER_STACK_SIZE, Task, TaskStatus, Thread, scheduler, sessions,
};
use crate::vm::{AddressSpace, Prot, VmError};

define_kernel_error! {
    pub enum ExecError(0x03) {
        NotFound = 0x01 => "no such executable",
        Access = 0x02 => "execute permission denied",
        Load(ElfLoadError) = 0x03 => "program load failed",
        Vm(VmError) = 0x04 => "address space construction failed",
        NoCaller = 0x05 => "no calling task",
    }
}

impl ExecError {
    /// The flat errno a syscall reports for this failure.
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound => errno::ENOENT,
            Self::Access => errno::EACCES,
            Self::Load(_) => errno::EIO,
            Self::Vm(_) => errno::ENOMEM,
            Self::NoCaller => errno::ESRCH,
        }
    }
}

/// argv/envp strings handed to a fresh image.
#[derive(Default, Clone)]
pub struct Arguments {
    pub argv: Vec<String>,
    pub envp: Vec<String>,
}

/// Wait-status encoding for a normal exit.
pub fn encode_exit_status(status: i32) -> i32 {
    (status & 0xff) | 0x200
}

// ============================================================================
// Initial stack layout
// ============================================================================

/// Lays the System-V entry stack out under `stack_top` and returns
/// the final stack pointer: strings highest (envp then argv), then a
/// 16-byte-aligned block of auxv, the null-terminated envp and argv
/// pointer arrays, and argc at the very bottom.
fn place_args(
    space: &AddressSpace,
    stack_top: u64,
    args: &Arguments,
    aux: &Aux,
) -> Result<u64, VmError> {
    let mut ptr = stack_top;

    for text in &args.envp {
        ptr -= text.len() as u64 + 1;
        space.write(ptr, text.as_bytes())?;
        space.write(ptr + text.len() as u64, &[0])?;
    }
    for text in &args.argv {
        ptr -= text.len() as u64 + 1;
        space.write(ptr, text.as_bytes())?;
        space.write(ptr + text.len() as u64, &[0])?;
    }

    ptr &= !0xF;
    // Keep the final rsp 16-byte aligned: the qword count below is
    // auxv (10) + two terminators + argc + the pointer arrays.
    if (args.argv.len() + args.envp.len() + 1) & 1 == 1 {
        ptr -= 8;
    }

    ptr -= 10 * 8;
    let auxv = [
        elf::AT_PHNUM,
        aux.at_phnum,
        elf::AT_PHENT,
        aux.at_phent,
        elf::AT_PHDR,
        aux.at_phdr,
        elf::AT_ENTRY,
        aux.at_entry,
        0,
        0,
    ];
    for (index, value) in auxv.iter().enumerate() {
        space.write_u64(ptr + index as u64 * 8, *value)?;
    }

    // String addresses replay the same descending walk the copies
    // made from the stack top.
    let mut cursor = stack_top;

    ptr -= 8;
    space.write_u64(ptr, 0)?;
    ptr -= args.envp.len() as u64 * 8;
    for (index, text) in args.envp.iter().enumerate() {
        cursor -= text.len() as u64 + 1;
        space.write_u64(ptr + index as u64 * 8, cursor)?;
    }

    ptr -= 8;
    space.write_u64(ptr, 0)?;
    ptr -= args.argv.len() as u64 * 8;
    for (index, text) in args.argv.iter().enumerate() {
        cursor -= text.len() as u64 + 1;
        space.write_u64(ptr + index as u64 * 8, cursor)?;
    }

    ptr -= 8;
    space.write_u64(ptr, args.argv.len() as u64)?;

    Ok(ptr)
}

// ============================================================================
// task_exec / thread_exec
// ============================================================================

/// Builds the first thread of a fresh image: user stack, entry
/// frame, argument block. Kernel-mode callers run on their kernel
/// stack instead.
pub fn thread_exec(
    task: &Arc<Task>,
    rip: u64,
    cs: u16,
    aux: &Aux,
    args: &Arguments,
) -> Result<Arc<Thread>, ExecError> {
    let thread = Thread::create_default(task).map_err(ExecError::Vm)?;

    let mut regs = Registers {
        rip,
        cs: u64::from(cs),
        rflags: arch::RFLAGS_IF,
        ..Registers::default()
    };

    if cs & 0x3 != 0 {
        regs.ss = u64::from(cs) - 8;
        let mut space_guard = task.space.lock();
        let space = space_guard.as_mut().ok_or(ExecError::NoCaller)?;
        let stack_base = space
            .map_anonymous(
                THREAD_USER_STACK_SIZE,
                Prot::READ | Prot::WRITE | Prot::USER,
            )
            .map_err(ExecError::Vm)?;
        let stack_top = stack_base + THREAD_USER_STACK_SIZE as u64;
        thread.user_stack.store(stack_top, Ordering::Release);
        regs.rsp = place_args(space, stack_top, args, aux).map_err(ExecError::Vm)?;
    } else {
        regs.ss = u64::from(cs) + 8;
        regs.rsp = thread.kernel_stack;
    }

    *thread.regs.lock() = regs;
    Ok(thread)
}

/// Builds a complete task around the ELF image at `path`: address
/// space, loaded segments (interpreter included), initial thread,
/// stdio descriptors, event wiring. The result is left in `status`.
pub fn task_exec(
    path: &str,
    cs: u16,
    args: &Arguments,
    status: TaskStatus,
) -> Result<Arc<Task>, ExecError> {
    let _sched = scheduler::sched_guard();

    let caller = task::current_task();

    let cwd = caller
        .as_ref()
        .and_then(|task| task.cwd.lock().clone());

    let node = fs::resolve(cwd.as_ref(), path).ok_or(ExecError::NotFound)?;

    let task = Task::create_default();
    let mut space = AddressSpace::new().map_err(ExecError::Vm)?;

    let loaded = match elf::load(&mut space, &node, 0) {
        Ok(loaded) => loaded,
        Err(err) => {
            task::remove_task(task.pid());
            return Err(ExecError::Load(err));
        }
    };
    let mut entry = loaded.aux.at_entry;

    if let Some(ld_path) = &loaded.interp {
        let ld_node = fs::resolve(cwd.as_ref(), ld_path).ok_or_else(|| {
            task::remove_task(task.pid());
            ExecError::NotFound
        })?;
        match elf::load(&mut space, &ld_node, INTERP_BIAS) {
            Ok(ld_loaded) => entry = ld_loaded.aux.at_entry,
            Err(err) => {
                task::remove_task(task.pid());
                return Err(ExecError::Load(err));
            }
        }
    }

    *task.space.lock() = Some(space);
    *task.cwd.lock() = cwd;

    let thread = match thread_exec(&task, entry, cs, &loaded.aux, args) {
        Ok(thread) => thread,
        Err(err) => {
            task::remove_task(task.pid());
            return Err(err);
        }
    };

    // Stdio lands in the fd table here; afterwards nothing
    // distinguishes the three descriptors from any other.
    task.fds.lock().attach_stdio();

    task.event.set_owner(task.pid(), thread.tid);
    let exit_trigger = task.exit_trigger();
    exit_trigger.agent_tid.store(thread.tid, Ordering::Release);
    if let Some(parent) = &caller {
        // Install the exit rendezvous before the task can ever run:
        // this closes the wait race.
        exit_trigger.retarget(parent.event.clone());
    }

    log::trace!(
        "[LIFECYCLE] task_exec '{}' -> pid {} entry {:#x}",
        path,
        task.pid(),
        entry
    );

    task.set_status(status);
    thread.set_status(TaskStatus::Waiting);
    Ok(task)
}

/// Launches the first user task. The scheduler dispatches it on the
/// next tick.
pub fn start_init(path: &str, args: &Arguments) -> Result<Arc<Task>, ExecError> {
    task_exec(path, arch::USER_CS as u16, args, TaskStatus::Waiting)
}

// ============================================================================
// fork
// ============================================================================

/// Clones the caller: copy-on-write address space, shallow-copied
/// descriptors, inherited identity. The child's thread resumes from
/// `caller_regs` with `rax = 0`; the caller gets the child pid.
pub fn fork(caller_regs: &Registers) -> Result<Arc<Task>, i32> {
    let _sched = scheduler::sched_guard();

    let Some(current) = task::current_task() else {
        panic!("fork with no current task");
    };
    let Some(current_thread) = task::current_thread() else {
        panic!("fork with no current thread");
    };

    let child = Task::create_default();

    let forked_space = {
        let guard = current.space.lock();
        match guard.as_ref() {
            Some(space) => space.fork().map_err(|_| errno::ENOMEM),
            None => Err(errno::ENOMEM),
        }
    };
    let forked_space = match forked_space {
        Ok(space) => space,
        Err(err) => {
            task::remove_task(child.pid());
            return Err(err);
        }
    };
    *child.space.lock() = Some(forked_space);

    let thread = match Thread::create_default(&child) {
        Ok(thread) => thread,
        Err(_) => {
            task::remove_task(child.pid());
            return Err(errno::ENOMEM);
        }
    };

    child.event.set_owner(child.pid(), thread.tid);
    let exit_trigger = child.exit_trigger();
    exit_trigger.agent_tid.store(thread.tid, Ordering::Release);
    // Exit rendezvous wired before the child can run (wait race).
    exit_trigger.retarget(current.event.clone());

    *child.fds.lock() = current.fds.lock().clone_for_fork();

    *child.creds.lock() = *current.creds.lock();
    child
        .umask
        .store(current.umask.load(Ordering::Acquire), Ordering::Release);
    *child.cwd.lock() = current.cwd.lock().clone();

    let pgid = current.pgid.load(Ordering::Acquire);
    let sid = current.sid.load(Ordering::Acquire);
    child.pgid.store(pgid, Ordering::Release);
    child.sid.store(sid, Ordering::Release);
    if let Some(group) = sessions::find_group(sid, pgid) {
        group.members.lock().push(child.pid());
    }

    let mut child_regs = *caller_regs;
    child_regs.rax = 0;
    *thread.regs.lock() = child_regs;
    thread.user_fs_base.store(
        current_thread.user_fs_base.load(Ordering::Acquire),
        Ordering::Release,
    );
    thread.user_gs_base.store(
        current_thread.user_gs_base.load(Ordering::Acquire),
        Ordering::Release,
    );
    thread.user_stack.store(
        current_thread.user_stack.load(Ordering::Acquire),
        Ordering::Release,
    );

    thread.set_status(TaskStatus::Waiting);
    child.set_status(TaskStatus::Waiting);

    current.children.lock().push(child.clone());

    log::trace!("[LIFECYCLE] fork: pid {} -> child {}", current.pid(), child.pid());
    Ok(child)
}

// ============================================================================
// execve
// ============================================================================

/// Replaces the caller's image: builds the new task, then grafts its
/// thread and address space onto the caller's pid under the lock.
/// On success the calling thread never runs again.
pub fn execve(path: &str, args: &Arguments) -> Result<(), i32> {
    let current = task::current_task().ok_or(errno::ESRCH)?;

    let node = {
        let cwd = current.cwd.lock().clone();
        fs::resolve(cwd.as_ref(), path).ok_or(errno::ENOENT)?
    };

    let stat = node.stat();
    {
        let creds = current.creds.lock();
        if !stat_allows(&stat, creds.effective_uid, creds.effective_gid, X_OK) {
            return Err(errno::EACCES);
        }
    }
    let is_suid = stat.st_mode & S_ISUID != 0;
    let is_sgid = stat.st_mode & S_ISGID != 0;

    let replacement = task_exec(path, arch::USER_CS as u16, args, TaskStatus::Waiting)
        .map_err(|err| {
            log::debug!("[LIFECYCLE] execve '{path}' failed: {err}");
            err.errno()
        })?;

    let _sched = scheduler::sched_guard();

    // Drop the temporary identity; the replacement takes over the
    // caller's pid atomically.
    let temp_pid = replacement.pid();
    task::remove_task(temp_pid);
    let pid = current.pid();
    task::remove_task(pid);

    replacement.set_pid(pid);
    replacement.ppid.store(
        current.ppid.load(Ordering::Acquire),
        Ordering::Release,
    );
    if let Some(thread) = replacement.main_thread() {
        thread.pid.store(pid, Ordering::Release);
    }

    // The caller's exit rendezvous survives the exec: the
    // replacement fires the trigger a waiter may already hold.
    let inherited_trigger = current.exit_trigger();
    inherited_trigger.set_agent(replacement.clone());
    replacement.set_exit_trigger(inherited_trigger);

    *replacement.cwd.lock() = current.cwd.lock().clone();
    replacement
        .umask
        .store(current.umask.load(Ordering::Acquire), Ordering::Release);
    replacement
        .pgid
        .store(current.pgid.load(Ordering::Acquire), Ordering::Release);
    replacement
        .sid
        .store(current.sid.load(Ordering::Acquire), Ordering::Release);

    {
        let old = *current.creds.lock();
        let mut creds = replacement.creds.lock();
        creds.real_uid = old.real_uid;
        creds.effective_uid = if is_suid { stat.st_uid } else { old.effective_uid };
        creds.saved_uid = creds.effective_uid;
        creds.real_gid = old.real_gid;
        creds.effective_gid = if is_sgid { stat.st_gid } else { old.effective_gid };
        creds.saved_gid = creds.effective_gid;
    }

    // Descriptors survive exec minus the close-on-exec set. The
    // stdio attached by task_exec is replaced wholesale.
    {
        let mut inherited = current.fds.lock().clone_for_fork();
        inherited.close_cloexec();
        *replacement.fds.lock() = inherited;
    }

    replacement.has_execved.store(true, Ordering::Release);

    // Tear the old image down; its threads never run again.
    for thread in current.threads_snapshot() {
        thread.set_status(TaskStatus::Yield);
        current.remove_thread(thread.tid);
    }

    task::install_task(&replacement);

    let core = cpu::core_local();
    core.pid.store(NO_TASK, Ordering::Release);
    core.tid.store(NO_TASK, Ordering::Release);

    drop(_sched);

    log::trace!("[LIFECYCLE] execve '{path}' grafted onto pid {pid}");

    // The caller thread does not return to its old image.
    scheduler::yield_now();
    Ok(())
}

// ============================================================================
// exit
// ============================================================================

/// Terminates the calling task: descriptors closed, threads parked,
/// pages released, children re-parented to pid 1, the wait-encoded
/// status published through the pre-allocated exit trigger.
pub fn exit(status: i32) {
    let saved = interrupts::disable();

    let Some(task) = task::current_task() else {
        panic!("exit with no current task");
    };

    task.fds.lock().close_all();

    for thread in task.threads_snapshot() {
        thread.set_status(TaskStatus::Yield);
        task.remove_thread(thread.tid);
    }

    if let Some(mut space) = task.space.lock().take() {
        // Walk the page list: drop each reference, free on last.
        space.release_all();
    }

    // Re-parent every child to pid 1.
    let orphans: Vec<Arc<Task>> = core::mem::take(&mut *task.children.lock());
    let init = task::translate_pid(1);
    for child in orphans {
        child.ppid.store(1, Ordering::Release);
        if let Some(init) = &init {
            init.children.lock().push(child);
        }
    }

    // Eager teardown of the job-control and parent links.
    sessions::leave_group(&task);
    let ppid = task.ppid.load(Ordering::Acquire);
    if let Some(parent) = task::translate_pid(ppid) {
        parent.children.lock().retain(|c| c.pid() != task.pid());
    }

    task.process_status
        .store(encode_exit_status(status), Ordering::Release);
    let _ = event::fire(&task.exit_trigger());

    task.set_status(TaskStatus::Yield);
    task::remove_task(task.pid());

    let core = cpu::core_local();
    core.pid.store(NO_TASK, Ordering::Release);
    core.tid.store(NO_TASK, Ordering::Release);

    interrupts::restore(saved);

    log::trace!("[LIFECYCLE] exit: pid {} status {:#x}", task.pid(), encode_exit_status(status));
    scheduler::yield_now();
}

// ============================================================================
// waitpid
// ============================================================================

/// Selects the candidate set for `waitpid(pid, ...)`, points every
/// candidate's exit trigger at the caller's event, and blocks for a
/// `ProcExit` fire. Returns `(pid, wait_status)` of the reaped task.
pub fn waitpid(pid: Pid) -> Result<(Pid, i32), i32> {
    let saved = interrupts::disable();

    let Some(current) = task::current_task() else {
        interrupts::restore(saved);
        return Err(errno::ESRCH);
    };

    let candidates: Vec<Arc<Task>> = if pid > 0 {
        task::translate_pid(pid).into_iter().collect()
    } else if pid == -1 {
        current.children.lock().clone()
    } else {
        // pid == 0: the caller's own group; pid < -1: group -pid.
        let pgid = if pid == 0 {
            current.pgid.load(Ordering::Acquire)
        } else {
            -pid
        };
        current
            .children
            .lock()
            .iter()
            .filter(|child| child.pgid.load(Ordering::Acquire) == pgid)
            .cloned()
            .collect()
    };

    if candidates.is_empty() && current.event.pending() == 0 {
        // Nothing to wait for and no unreaped exit parked.
        interrupts::restore(saved);
        return Err(errno::ECHILD);
    }

    for candidate in &candidates {
        let trigger = candidate.exit_trigger();
        trigger.retarget(current.event.clone());
        event::append_trigger(&current.event, &trigger);
    }

    interrupts::restore(saved);

    event::wait(&current.event, EventType::ProcExit).map_err(|()| errno::EINTR)?;

    let trigger = current
        .last_trigger
        .lock()
        .clone()
        .ok_or(errno::ECHILD)?;
    let agent = trigger.agent().ok_or(errno::ECHILD)?;
    let reaped_pid = trigger.agent_pid();
    let status = agent.process_status.load(Ordering::Acquire);
    // Reap: let the zombie task object go.
    trigger.clear_agent();

    Ok((reaped_pid, status))
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::arch;
    use crate::loader::elf::testelf;
    use crate::syscall::process::{sys_execve, sys_fork};
    use crate::task::fd_table::{FD_CLOEXEC, FileHandle, O_RDWR};
    use crate::test_support::{become_current, install_ramfs, kernel_test, task_with_user_page};

    /// fork: parent sees the child pid, the child thread sees 0, the
    /// child lands in the parent's children with the right ppid, and
    /// both observe identical memory before any write.
    #[test]
    fn fork_scenario() {
        let _guard = kernel_test();
        let (parent, parent_thread, scratch) = task_with_user_page();
        become_current(&parent, &parent_thread);

        {
            let guard = parent.space.lock();
            guard.as_ref().unwrap().write(scratch, b"inherited").unwrap();
        }

        let mut regs = Registers {
            rip: 0x40_2000,
            rsp: 0x7000_0000,
            ..Registers::default()
        };
        sys_fork(&mut regs);
        let child_pid = regs.rax as Pid;
        assert_ne!(regs.rax, u64::MAX);
        assert_ne!(child_pid, parent.pid());

        let child = task::translate_pid(child_pid).unwrap();
        assert_eq!(child.ppid.load(Ordering::Acquire), parent.pid());
        assert!(
            parent
                .children
                .lock()
                .iter()
                .any(|c| c.pid() == child_pid)
        );

        // Child resumes from the caller's frame with rax = 0.
        let child_thread = child.main_thread().unwrap();
        let child_regs = *child_thread.regs.lock();
        assert_eq!(child_regs.rax, 0);
        assert_eq!(child_regs.rip, 0x40_2000);
        assert_eq!(child_regs.rsp, 0x7000_0000);
        assert_eq!(child_thread.status(), TaskStatus::Waiting);

        // Identical memory via the shared (copy-on-write) pages.
        {
            let guard = child.space.lock();
            let mut back = [0u8; 9];
            guard.as_ref().unwrap().read(scratch, &mut back).unwrap();
            assert_eq!(&back, b"inherited");
            assert_eq!(guard.as_ref().unwrap().page_refcount(scratch), Some(2));
        }

        // Descriptors are shallow copies of the parent's table.
        assert_eq!(child.fds.lock().len(), parent.fds.lock().len());
        assert!(task::table_consistent());
    }

    /// execve: the caller's pid keeps its identity, but thread,
    /// address space and credentials are the new image's; the entry
    /// stack carries argc/argv/envp/auxv; O_CLOEXEC descriptors are
    /// gone; setpgid is refused afterwards.
    #[test]
    fn execve_scenario() {
        let _guard = kernel_test();
        let ramfs = install_ramfs();
        ramfs.add_executable("/bin/sh", testelf::simple(b"\x48\x31\xc0\xc3"));

        let (parent, parent_thread, scratch) = task_with_user_page();
        become_current(&parent, &parent_thread);
        let pid = parent.pid();

        let kept_fd = parent
            .fds
            .lock()
            .install(FileHandle::open(crate::fs::console_node(), O_RDWR), 0);
        let doomed_fd = parent.fds.lock().install(
            FileHandle::open(crate::fs::console_node(), O_RDWR),
            FD_CLOEXEC,
        );

        // Marshal path/argv/envp through user memory, as userland would.
        {
            let guard = parent.space.lock();
            let space = guard.as_ref().unwrap();
            space.write(scratch, b"/bin/sh\0sh\0PATH=/\0").unwrap();
            // argv = [scratch+8 ("sh"), 0], envp = [scratch+11 ("PATH=/"), 0]
            space.write_u64(scratch + 64, scratch + 8).unwrap();
            space.write_u64(scratch + 72, 0).unwrap();
            space.write_u64(scratch + 80, scratch + 11).unwrap();
            space.write_u64(scratch + 88, 0).unwrap();
        }

        let mut regs = Registers {
            rdi: scratch,
            rsi: scratch + 64,
            rdx: scratch + 80,
            ..Registers::default()
        };
        sys_execve(&mut regs);
        assert_ne!(regs.rax, u64::MAX);

        let image = task::translate_pid(pid).unwrap();
        assert!(!Arc::ptr_eq(&image, &parent));
        assert!(image.has_execved.load(Ordering::Acquire));
        assert_eq!(image.pid(), pid);

        // First instruction is the ELF entry point.
        let thread = image.main_thread().unwrap();
        let entry_regs = *thread.regs.lock();
        assert_eq!(entry_regs.rip, 0x40_0000);
        assert_eq!(entry_regs.cs, arch::USER_CS);
        assert_eq!(entry_regs.ss, arch::USER_SS);
        assert_eq!(entry_regs.rflags, arch::RFLAGS_IF);
        assert_eq!(entry_regs.rsp % 16, 0); // SysV entry alignment

        // Walk the entry stack: argc, argv, envp, auxv.
        let guard = image.space.lock();
        let space = guard.as_ref().unwrap();
        let rsp = entry_regs.rsp;
        assert_eq!(space.read_u64(rsp).unwrap(), 1); // argc

        let argv0 = space.read_u64(rsp + 8).unwrap();
        let mut text = [0u8; 3];
        space.read(argv0, &mut text).unwrap();
        assert_eq!(&text, b"sh\0");
        assert_eq!(space.read_u64(rsp + 16).unwrap(), 0); // argv terminator

        let envp0 = space.read_u64(rsp + 24).unwrap();
        let mut env = [0u8; 7];
        space.read(envp0, &mut env).unwrap();
        assert_eq!(&env, b"PATH=/\0");
        assert_eq!(space.read_u64(rsp + 32).unwrap(), 0); // envp terminator

        // Auxv block: (AT_PHNUM, AT_PHENT, AT_PHDR, AT_ENTRY, 0, 0).
        let auxv = rsp + 40;
        assert_eq!(space.read_u64(auxv).unwrap(), crate::loader::elf::AT_PHNUM);
        assert_eq!(space.read_u64(auxv + 8).unwrap(), 1);
        assert_eq!(space.read_u64(auxv + 16).unwrap(), crate::loader::elf::AT_PHENT);
        assert_eq!(space.read_u64(auxv + 24).unwrap(), 56);
        assert_eq!(space.read_u64(auxv + 32).unwrap(), crate::loader::elf::AT_PHDR);
        assert_eq!(space.read_u64(auxv + 48).unwrap(), crate::loader::elf::AT_ENTRY);
        assert_eq!(space.read_u64(auxv + 56).unwrap(), 0x40_0000);
        assert_eq!(space.read_u64(auxv + 64).unwrap(), 0);
        assert_eq!(space.read_u64(auxv + 72).unwrap(), 0);
        drop(guard);

        // Descriptor sweep: the close-on-exec fd is gone, the other
        // survives alongside the stdio attached by the exec.
        assert!(image.fds.lock().get(kept_fd).is_some());
        assert!(image.fds.lock().get(doomed_fd).is_none());

        // Invariant: a process that has execved cannot change groups.
        assert_eq!(
            sessions::set_pgid(&image, &image, 42),
            Err(errno::EPERM)
        );
        assert!(task::table_consistent());
    }

    /// fork + exit(7) + waitpid: the parent reaps the child's pid
    /// and observes the wait-encoded status 0x207.
    #[test]
    fn exit_and_waitpid_scenario() {
        let _guard = kernel_test();
        let (parent, parent_thread, _scratch) = task_with_user_page();
        become_current(&parent, &parent_thread);

        let mut regs = Registers::default();
        sys_fork(&mut regs);
        let child_pid = regs.rax as Pid;
        let child = task::translate_pid(child_pid).unwrap();
        let child_thread = child.main_thread().unwrap();

        // The child runs and exits with status 7.
        become_current(&child, &child_thread);
        exit(7);

        // The child is fully torn down.
        assert!(task::translate_pid(child_pid).is_none());
        assert!(parent.children.lock().is_empty()); // eager removal
        assert_eq!(child.thread_count(), 0);
        assert!(child.space.lock().is_none());
        assert!(task::table_consistent());

        // The parent reaps: pid and encoded status come back.
        become_current(&parent, &parent_thread);
        let (reaped, status) = waitpid(child_pid).unwrap();
        assert_eq!(reaped, child_pid);
        assert_eq!(status, 0x207);
    }

    #[test]
    fn waitpid_with_no_children_is_echild() {
        let _guard = kernel_test();
        let (parent, parent_thread, _scratch) = task_with_user_page();
        become_current(&parent, &parent_thread);
        assert_eq!(waitpid(-1), Err(errno::ECHILD));
    }

    /// Group-scoped waits select by the child's pgid.
    #[test]
    fn waitpid_group_scoping() {
        let _guard = kernel_test();
        let (parent, parent_thread, _scratch) = task_with_user_page();
        become_current(&parent, &parent_thread);

        let mut regs = Registers::default();
        sys_fork(&mut regs);
        let in_group = regs.rax as Pid;
        let mut regs = Registers::default();
        sys_fork(&mut regs);
        let other = regs.rax as Pid;

        // Move the second child into a foreign group id.
        task::translate_pid(other)
            .unwrap()
            .pgid
            .store(99, Ordering::Release);

        // Exit only the in-group child.
        let child = task::translate_pid(in_group).unwrap();
        let child_thread = child.main_thread().unwrap();
        become_current(&child, &child_thread);
        exit(3);

        become_current(&parent, &parent_thread);
        // waitpid(0) waits on the caller's own group.
        let (reaped, status) = waitpid(0).unwrap();
        assert_eq!(reaped, in_group);
        assert_eq!(status, 0x203);

        // Exit the foreign-group child, then reap through its group id.
        let child = task::translate_pid(other).unwrap();
        let child_thread = child.main_thread().unwrap();
        become_current(&child, &child_thread);
        exit(4);
        become_current(&parent, &parent_thread);
        let (reaped, status) = waitpid(-99).unwrap();
        assert_eq!(reaped, other);
        assert_eq!(status, 0x204);
    }

    /// exit re-parents children to pid 1.
    #[test]
    fn exit_reparents_to_init() {
        let _guard = kernel_test();
        let (root_task, root_thread, _scratch) = task_with_user_page();
        assert_eq!(root_task.pid(), 0);
        let init = Task::create_default();
        assert_eq!(init.pid(), 1);

        become_current(&root_task, &root_thread);
        let mut regs = Registers::default();
        sys_fork(&mut regs);
        let middle_pid = regs.rax as Pid;
        let middle = task::translate_pid(middle_pid).unwrap();
        let middle_thread = middle.main_thread().unwrap();

        become_current(&middle, &middle_thread);
        let mut regs = Registers::default();
        sys_fork(&mut regs);
        let orphan_pid = regs.rax as Pid;

        exit(0); // middle dies; the grandchild must land on init

        let orphan = task::translate_pid(orphan_pid).unwrap();
        assert_eq!(orphan.ppid.load(Ordering::Acquire), 1);
        assert!(init.children.lock().iter().any(|c| c.pid() == orphan_pid));
        assert!(
            !root_task
                .children
                .lock()
                .iter()
                .any(|c| c.pid() == middle_pid)
        );
    }

    /// Freed pids are reused, and a stale pid resolves to the new
    /// owner (or nothing), never the dead task.
    #[test]
    fn pid_reuse_after_exit() {
        let _guard = kernel_test();
        let (parent, parent_thread, _scratch) = task_with_user_page();
        become_current(&parent, &parent_thread);

        let mut regs = Registers::default();
        sys_fork(&mut regs);
        let first_pid = regs.rax as Pid;
        let first = task::translate_pid(first_pid).unwrap();
        let first_thread = first.main_thread().unwrap();
        become_current(&first, &first_thread);
        exit(0);

        become_current(&parent, &parent_thread);
        let _ = waitpid(first_pid);

        let mut regs = Registers::default();
        sys_fork(&mut regs);
        let second_pid = regs.rax as Pid;
        assert_eq!(second_pid, first_pid); // lowest free id came back
        let second = task::translate_pid(second_pid).unwrap();
        assert!(!Arc::ptr_eq(&second, &first));
        assert!(task::table_consistent());
    }

    #[test]
    fn start_init_builds_a_ready_task_with_stdio() {
        let _guard = kernel_test();
        let ramfs = install_ramfs();
        ramfs.add_executable("/sbin/init", testelf::simple(b"\xeb\xfe"));

        let args = Arguments {
            argv: alloc::vec![String::from("init")],
            envp: alloc::vec![],
        };
        let init = start_init("/sbin/init", &args).unwrap();

        assert_eq!(init.status(), TaskStatus::Waiting);
        assert_eq!(init.ppid.load(Ordering::Acquire), -1);
        let fds = init.fds.lock();
        assert!(fds.get(0).is_some());
        assert!(fds.get(1).is_some());
        assert!(fds.get(2).is_some());
        drop(fds);

        let thread = init.main_thread().unwrap();
        let regs = *thread.regs.lock();
        assert_eq!(regs.rip, 0x40_0000);
        assert_eq!(regs.cs, arch::USER_CS);
        assert_ne!(regs.rsp, 0);
    }

    #[test]
    fn execve_missing_path_and_permissions() {
        let _guard = kernel_test();
        let ramfs = install_ramfs();
        ramfs.add("/bin/locked", testelf::simple(b"\xc3"), 0o600, 42, 42);

        let (parent, parent_thread, _scratch) = task_with_user_page();
        become_current(&parent, &parent_thread);
        {
            let mut creds = parent.creds.lock();
            creds.effective_uid = 100; // not root, not the owner
            creds.effective_gid = 100;
        }

        let args = Arguments::default();
        assert_eq!(execve("/bin/nowhere", &args), Err(errno::ENOENT));
        assert_eq!(execve("/bin/locked", &args), Err(errno::EACCES));
    }

    /// Suid bit: the effective and saved uid become the image
    /// owner's; the real uid stays.
    #[test]
    fn execve_honors_suid() {
        let _guard = kernel_test();
        let ramfs = install_ramfs();
        ramfs.add("/bin/passwd", testelf::simple(b"\xc3"), 0o4755, 0, 0);

        let (parent, parent_thread, _scratch) = task_with_user_page();
        become_current(&parent, &parent_thread);
        let pid = parent.pid();
        {
            let mut creds = parent.creds.lock();
            creds.real_uid = 1000;
            creds.effective_uid = 1000;
            creds.saved_uid = 1000;
        }

        execve("/bin/passwd", &Arguments::default()).unwrap();

        let image = task::translate_pid(pid).unwrap();
        let creds = *image.creds.lock();
        assert_eq!(creds.real_uid, 1000);
        assert_eq!(creds.effective_uid, 0); // image owner
        assert_eq!(creds.saved_uid, 0);
    }

    #[test]
    fn encode_exit_status_matches_the_wait_convention() {
        assert_eq!(encode_exit_status(7), 0x207);
        assert_eq!(encode_exit_status(0), 0x200);
        assert_eq!(encode_exit_status(0x1ff), 0x2ff); // truncated to a byte
    }
}
