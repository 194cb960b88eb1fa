//! Task and thread objects, identity allocation, and the global
//! lookup tables.
//!
//! Cyclic relationships (task ↔ children ↔ parent, task ↔ group ↔
//! session) are stored as ids and resolved through the tables; ids
//! are reused as soon as they are freed, so a stale pid must be
//! re-validated against the table before use.

pub mod fd_table;
pub mod lifecycle;
pub mod scheduler;
pub mod sessions;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, AtomicU64, Ordering};

use vos_hal::IrqSafeLock;
use vos_hal::memory::{self, PAGE_SIZE};
use vos_utils::{Bitmap, HashMap, Lazy};

use crate::arch::Registers;
use crate::cpu;
use crate::event::{Event, EventType, Trigger};
use crate::fs::VfsNode;
use crate::signal::{QueuedSignal, SIGNAL_MAX, Sigaction};
use crate::task::fd_table::FdTable;
use crate::vm::{AddressSpace, VmError};

pub type Pid = i32;
pub type Tid = i32;

pub const THREAD_KERNEL_STACK_SIZE: usize = 0x4000;
pub const THREAD_USER_STACK_SIZE: usize = 0x10000;

/// Ready-state machine. Exactly one of these per task/thread; a
/// `Yield` entry is invisible to selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    Running = 0,
    Waiting = 1,
    Yield = 2,
}

impl TaskStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::Waiting,
            _ => Self::Yield,
        }
    }
}

/// Real/effective/saved uid and gid triples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Credentials {
    pub real_uid: u32,
    pub effective_uid: u32,
    pub saved_uid: u32,
    pub real_gid: u32,
    pub effective_gid: u32,
    pub saved_gid: u32,
}

/// A process: one address space, one credential set, one or more
/// threads.
pub struct Task {
    pid: AtomicI32,
    pub ppid: AtomicI32,
    status: AtomicU8,
    pub idle_cnt: AtomicU64,

    /// Raised by a blocked waiter, cleared by the dispatch that
    /// resumes it; the timer handler polls this across cores.
    pub event_waiting: AtomicBool,

    pub has_execved: AtomicBool,
    /// Wait-encoded exit code, valid once the exit trigger fires.
    pub process_status: AtomicI32,
    pub umask: AtomicU32,

    pub pgid: AtomicI32,
    pub sid: AtomicI32,

    pub creds: IrqSafeLock<Credentials>,
    pub cwd: IrqSafeLock<Option<Arc<VfsNode>>>,
    pub space: IrqSafeLock<Option<AddressSpace>>,
    pub fds: IrqSafeLock<FdTable>,
    pub sigactions: IrqSafeLock<[Sigaction; SIGNAL_MAX]>,

    threads: IrqSafeLock<ThreadSet>,
    pub children: IrqSafeLock<Vec<Arc<Task>>>,

    /// Rendezvous this task waits on (waitpid, blocking I/O).
    pub event: Arc<Event>,
    /// Pre-allocated so `exit` never allocates; execve swaps the
    /// caller's trigger in so an installed wait survives the exec.
    exit_trigger: IrqSafeLock<Arc<Trigger>>,
    pub last_trigger: IrqSafeLock<Option<Arc<Trigger>>>,
}

#[derive(Default)]
struct ThreadSet {
    map: HashMap<Tid, Arc<Thread>>,
    tid_bitmap: Bitmap,
}

/// A schedulable execution context within a task.
pub struct Thread {
    pub tid: Tid,
    pub pid: AtomicI32,
    status: AtomicU8,
    pub idle_cnt: AtomicU64,

    pub regs: IrqSafeLock<Registers>,
    pub user_stack: AtomicU64,
    pub user_fs_base: AtomicU64,
    pub user_gs_base: AtomicU64,
    pub errno: AtomicI32,

    /// Kernel stack top (higher-half alias); exclusively owned.
    pub kernel_stack: u64,
    kernel_stack_phys: usize,

    pub sigmask: AtomicU32,
    pub sigpending: AtomicU32,
    pub signal_queue: IrqSafeLock<[Option<QueuedSignal>; SIGNAL_MAX]>,

    /// Rendezvous for blocking signal waits; `kill` fires it.
    pub sigwait: Arc<Event>,
    pub sig_trigger: Arc<Trigger>,
}

static TASK_TABLE: Lazy<IrqSafeLock<HashMap<Pid, Arc<Task>>>> =
    Lazy::new(|| IrqSafeLock::new(HashMap::new()));
static PID_BITMAP: Lazy<IrqSafeLock<Bitmap>> = Lazy::new(|| IrqSafeLock::new(Bitmap::new()));

/// Looks a pid up in the global table.
pub fn translate_pid(pid: Pid) -> Option<Arc<Task>> {
    if pid < 0 {
        return None;
    }
    TASK_TABLE.lock().get(&pid).cloned()
}

/// Looks a `(pid, tid)` pair up.
pub fn translate_tid(pid: Pid, tid: Tid) -> Option<Arc<Thread>> {
    translate_pid(pid)?.thread(tid)
}

/// The task running on this core, if any.
pub fn current_task() -> Option<Arc<Task>> {
    translate_pid(cpu::current_pid())
}

pub fn current_thread() -> Option<Arc<Thread>> {
    translate_tid(cpu::current_pid(), cpu::current_tid())
}

impl Task {
    /// Default construction per the process model: fresh pid,
    /// installed in the table, root credentials, umask 022, parent
    /// is the caller (or none for the first task). Starts in
    /// `Yield`, invisible to the scheduler.
    pub fn create_default() -> Arc<Self> {
        let pid = PID_BITMAP.lock().alloc() as Pid;
        let ppid = match current_task() {
            Some(parent) => parent.pid(),
            None => -1,
        };

        let task = Arc::new(Self {
            pid: AtomicI32::new(pid),
            ppid: AtomicI32::new(ppid),
            status: AtomicU8::new(TaskStatus::Yield as u8),
            idle_cnt: AtomicU64::new(0),
            event_waiting: AtomicBool::new(false),
            has_execved: AtomicBool::new(false),
            process_status: AtomicI32::new(0),
            umask: AtomicU32::new(0o022),
            pgid: AtomicI32::new(0),
            sid: AtomicI32::new(0),
            creds: IrqSafeLock::new(Credentials::default()),
            cwd: IrqSafeLock::new(None),
            space: IrqSafeLock::new(None),
            fds: IrqSafeLock::new(FdTable::new()),
            sigactions: IrqSafeLock::new([Sigaction::default(); SIGNAL_MAX]),
            threads: IrqSafeLock::new(ThreadSet::default()),
            children: IrqSafeLock::new(Vec::new()),
            event: Event::new(pid, 0),
            exit_trigger: IrqSafeLock::new(Trigger::new(pid, 0, EventType::ProcExit)),
            last_trigger: IrqSafeLock::new(None),
        });

        // The exit trigger names its agent so a waiter can still read
        // the wait-encoded status after the task leaves the table.
        task.exit_trigger().set_agent(task.clone());

        TASK_TABLE.lock().insert(pid, task.clone());
        task
    }

    pub fn pid(&self) -> Pid {
        self.pid.load(Ordering::Acquire)
    }

    /// Re-keys the task (execve grafts the replacement image onto
    /// the caller's pid). Caller owns the table bookkeeping.
    pub(crate) fn set_pid(&self, pid: Pid) {
        self.pid.store(pid, Ordering::Release);
        self.event.owner_pid.store(pid, Ordering::Release);
        self.exit_trigger().agent_pid.store(pid, Ordering::Release);
    }

    /// The trigger `exit` will fire.
    pub fn exit_trigger(&self) -> Arc<Trigger> {
        self.exit_trigger.lock().clone()
    }

    /// Execve graft: the replacement reports exits on the caller's
    /// pre-installed trigger.
    pub(crate) fn set_exit_trigger(&self, trigger: Arc<Trigger>) {
        *self.exit_trigger.lock() = trigger;
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: TaskStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn thread(&self, tid: Tid) -> Option<Arc<Thread>> {
        self.threads.lock().map.get(&tid).cloned()
    }

    /// Main thread: tid 0, or the lowest tid after it is gone.
    pub fn main_thread(&self) -> Option<Arc<Thread>> {
        let set = self.threads.lock();
        if let Some(main) = set.map.get(&0) {
            return Some(main.clone());
        }
        set.map
            .iter()
            .min_by_key(|(tid, _)| **tid)
            .map(|(_, t)| t.clone())
    }

    pub fn threads_snapshot(&self) -> Vec<Arc<Thread>> {
        self.threads.lock().map.values().cloned().collect()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().map.len()
    }

    /// Drops `tid` from the thread table, freeing the id for reuse.
    pub fn remove_thread(&self, tid: Tid) {
        let mut set = self.threads.lock();
        if set.map.remove(&tid).is_some() {
            set.tid_bitmap.clear(tid as usize);
        }
    }
}

impl Thread {
    /// Default construction: fresh tid within the task, installed in
    /// the thread table, kernel stack allocated in the higher half.
    /// Starts in `Yield`.
    pub fn create_default(task: &Arc<Task>) -> Result<Arc<Self>, VmError> {
        let frames = THREAD_KERNEL_STACK_SIZE / PAGE_SIZE;
        let stack_phys = memory::frame_allocator()
            .alloc_frames(frames)
            .ok_or(VmError::OutOfFrames)?;
        let stack_top = (memory::phys_to_virt(stack_phys) + THREAD_KERNEL_STACK_SIZE) as u64;

        let mut set = task.threads.lock();
        let tid = set.tid_bitmap.alloc() as Tid;
        let pid = task.pid();

        let sigwait = Event::new(pid, tid);
        let sig_trigger = Trigger::new(pid, tid, EventType::Signal);
        sig_trigger.retarget(sigwait.clone());

        let thread = Arc::new(Self {
            tid,
            pid: AtomicI32::new(pid),
            status: AtomicU8::new(TaskStatus::Yield as u8),
            idle_cnt: AtomicU64::new(0),
            regs: IrqSafeLock::new(Registers::default()),
            user_stack: AtomicU64::new(0),
            user_fs_base: AtomicU64::new(0),
            user_gs_base: AtomicU64::new(0),
            errno: AtomicI32::new(0),
            kernel_stack: stack_top,
            kernel_stack_phys: stack_phys,
            sigmask: AtomicU32::new(0),
            sigpending: AtomicU32::new(0),
            signal_queue: IrqSafeLock::new([const { None }; SIGNAL_MAX]),
            sigwait,
            sig_trigger,
        });

        set.map.insert(tid, thread.clone());
        Ok(thread)
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: TaskStatus) {
        self.status.store(status as u8, Ordering::Release);
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        let frames = THREAD_KERNEL_STACK_SIZE / PAGE_SIZE;
        memory::frame_allocator().free_frames(self.kernel_stack_phys, frames);
    }
}

/// Unlinks `pid` from the table and releases the id.
pub fn remove_task(pid: Pid) {
    let removed = TASK_TABLE.lock().remove(&pid);
    if removed.is_some() && pid >= 0 {
        PID_BITMAP.lock().clear(pid as usize);
    }
}

/// Reinstalls a task under its (possibly re-keyed) pid, claiming the
/// pid bit when it is not already held.
pub(crate) fn install_task(task: &Arc<Task>) {
    let pid = task.pid();
    PID_BITMAP.lock().set(pid as usize);
    TASK_TABLE.lock().insert(pid, task.clone());
}

/// Snapshot of the global table for the selection scan.
pub(crate) fn tasks_snapshot() -> Vec<Arc<Task>> {
    TASK_TABLE.lock().values().cloned().collect()
}

/// Table/bitmap agreement check (test builds only).
#[cfg(feature = "std")]
pub fn table_consistent() -> bool {
    let table = TASK_TABLE.lock();
    let bitmap = PID_BITMAP.lock();
    table.keys().all(|pid| bitmap.test(*pid as usize))
        && bitmap.iter_set().all(|pid| table.contains_key(&(pid as Pid)))
}

#[cfg(all(test, feature = "std"))]
pub(crate) fn reset_tables() {
    use crate::cpu::NO_TASK;

    TASK_TABLE.lock().clear();
    *PID_BITMAP.lock() = Bitmap::new();
    sessions::reset_tables();
    crate::time::reset_timers();
    let core = cpu::core_local();
    core.pid.store(NO_TASK, Ordering::Release);
    core.tid.store(NO_TASK, Ordering::Release);
    core.errno.store(0, Ordering::Release);
}
