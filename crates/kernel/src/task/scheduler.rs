//! Core multiplexing.
//!
//! One global ready set, consulted greedily by every core on its
//! timer interrupt. A single lock serializes selection and the
//! state hand-off; a core that loses the race simply keeps running
//! what it has until the next tick. Selection is strict aging:
//! every scan bumps the idle count of the ready population and the
//! largest count wins, so no finite set of competitors can starve a
//! thread forever.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use vos_hal::{IrqSafeLock, interrupts};

use crate::arch::{self, Registers};
use crate::cpu::{self, NO_TASK};
use crate::event;
use crate::signal;
use crate::task::{self, Task, TaskStatus, Thread};

/// Serializes ready-set manipulation and context switching.
static SCHED_LOCK: IrqSafeLock<()> = IrqSafeLock::new(());

/// Requeue boost: a woken waiter outbids any aged competitor on the
/// next tick. The aging scan saturates, so the boost sticks.
const WAKEUP_PRIORITY: u64 = u64::MAX;

/// Outcome of one reschedule decision.
pub enum Dispatch {
    /// Load this task/thread; its saved frame is ready to resume.
    Run(Arc<Task>, Arc<Thread>),
    /// Nothing better to do; keep the current thread (or, on a
    /// contended lock, skip the tick entirely).
    Keep,
    /// No runnable thread and the core was idle.
    Idle,
}

fn pick_task(tasks: &[Arc<Task>]) -> Option<Arc<Task>> {
    let mut best: Option<Arc<Task>> = None;
    let mut best_cnt = 0;
    for candidate in tasks {
        let aged = candidate
            .idle_cnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_add(1))
            })
            .unwrap_or(0)
            .saturating_add(1);
        if candidate.status() == TaskStatus::Waiting && best_cnt < aged {
            best_cnt = aged;
            best = Some(candidate.clone());
        }
    }
    best
}

fn pick_thread(task: &Task) -> Option<Arc<Thread>> {
    let mut best: Option<Arc<Thread>> = None;
    let mut best_cnt = 0;
    for candidate in task.threads_snapshot() {
        let aged = candidate
            .idle_cnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_add(1))
            })
            .unwrap_or(0)
            .saturating_add(1);
        if candidate.status() == TaskStatus::Waiting && best_cnt < aged {
            best_cnt = aged;
            best = Some(candidate);
        }
    }
    best
}

/// One scheduling decision, driven by the timer interrupt.
///
/// Saves the outgoing thread's frame and per-thread cells, loads the
/// chosen thread onto this core, and runs the signal-delivery hook
/// against its saved frame. The caller resumes the returned thread's
/// `regs` (or keeps running / idles).
pub fn reschedule(regs: &Registers) -> Dispatch {
    let Some(_guard) = SCHED_LOCK.try_lock() else {
        return Dispatch::Keep;
    };

    let tasks = task::tasks_snapshot();
    let core = cpu::core_local();
    let core_busy =
        core.pid.load(Ordering::Acquire) != NO_TASK && core.tid.load(Ordering::Acquire) != NO_TASK;

    let Some(next_task) = pick_task(&tasks) else {
        return if core_busy { Dispatch::Keep } else { Dispatch::Idle };
    };
    let Some(next_thread) = pick_thread(&next_task) else {
        return if core_busy { Dispatch::Keep } else { Dispatch::Idle };
    };

    if core_busy {
        save_outgoing(regs);
    }

    load_incoming(&next_task, &next_thread);
    signal::deliver_pending(&next_task, &next_thread);

    Dispatch::Run(next_task, next_thread)
}

fn save_outgoing(regs: &Registers) {
    let core = cpu::core_local();
    let pid = core.pid.load(Ordering::Acquire);
    let tid = core.tid.load(Ordering::Acquire);

    // The outgoing task may have exited under us; nothing to save then.
    let Some(last_task) = task::translate_pid(pid) else {
        return;
    };
    let Some(last_thread) = task::translate_tid(pid, tid) else {
        return;
    };

    if last_thread.status() != TaskStatus::Yield {
        last_thread.set_status(TaskStatus::Waiting);
    }
    if last_task.status() != TaskStatus::Yield {
        last_task.set_status(TaskStatus::Waiting);
    }

    last_thread
        .errno
        .store(core.errno.load(Ordering::Acquire), Ordering::Release);
    *last_thread.regs.lock() = *regs;
    last_thread
        .user_fs_base
        .store(arch::user_fs_base(), Ordering::Release);
    last_thread
        .user_gs_base
        .store(arch::user_gs_base(), Ordering::Release);
    last_thread
        .user_stack
        .store(core.user_stack.load(Ordering::Acquire), Ordering::Release);
}

fn load_incoming(next_task: &Arc<Task>, next_thread: &Arc<Thread>) {
    let core = cpu::core_local();
    core.pid.store(next_task.pid(), Ordering::Release);
    core.tid.store(next_thread.tid, Ordering::Release);
    core.errno
        .store(next_thread.errno.load(Ordering::Acquire), Ordering::Release);
    core.kernel_stack
        .store(next_thread.kernel_stack, Ordering::Release);
    core.user_stack
        .store(next_thread.user_stack.load(Ordering::Acquire), Ordering::Release);

    if let Some(space) = next_task.space.lock().as_ref() {
        space.load();
    }

    next_task.idle_cnt.store(0, Ordering::Release);
    next_thread.idle_cnt.store(0, Ordering::Release);
    next_task.set_status(TaskStatus::Running);
    next_thread.set_status(TaskStatus::Running);

    arch::set_user_fs_base(next_thread.user_fs_base.load(Ordering::Acquire));
    arch::set_user_gs_base(next_thread.user_gs_base.load(Ordering::Acquire));

    event::note_dispatched(next_task);
}

/// Makes the pair invisible to selection. The blocking half of every
/// suspension point.
pub fn dequeue(task: &Arc<Task>, thread: &Arc<Thread>) {
    let _guard = SCHED_LOCK.lock();
    task.set_status(TaskStatus::Yield);
    thread.set_status(TaskStatus::Yield);
}

/// Puts the pair back in the ready set with the wakeup boost. A pair
/// currently running on some core is left alone; waking it would let
/// a second core select it while the first still executes it.
pub fn requeue(task: &Arc<Task>, thread: &Arc<Thread>) {
    let _guard = SCHED_LOCK.lock();
    if task.status() != TaskStatus::Running {
        task.set_status(TaskStatus::Waiting);
        task.idle_cnt.store(WAKEUP_PRIORITY, Ordering::Release);
    }
    if thread.status() != TaskStatus::Running {
        thread.set_status(TaskStatus::Waiting);
        thread.idle_cnt.store(WAKEUP_PRIORITY, Ordering::Release);
    }
}

/// Scope lock for the lifecycle paths (fork, task_exec, the execve
/// graft) that must be atomic against the timer interrupt.
pub(crate) fn sched_guard() -> vos_hal::sync::IrqSafeGuard<'static, ()> {
    SCHED_LOCK.lock()
}

/// Dequeue + forced reschedule, atomic against the timer interrupt.
/// The primitive beneath every blocking syscall.
pub fn dequeue_and_yield(task: &Arc<Task>, thread: &Arc<Thread>) {
    let saved = interrupts::disable();
    dequeue(task, thread);
    arch::reschedule_self();
    interrupts::restore(saved);
    arch::halt_until_rescheduled();
}

/// Voluntary yield: kick the reschedule vector and wait for it.
pub fn yield_now() {
    arch::reschedule_self();
    arch::halt_until_rescheduled();
}

/// Marks this core idle. The caller (interrupt tail) halts.
pub fn mark_core_idle() {
    let core = cpu::core_local();
    core.pid.store(NO_TASK, Ordering::Release);
    core.tid.store(NO_TASK, Ordering::Release);
}

/// Timer-interrupt tail on bare metal: apply the dispatch decision
/// and return to the chosen context.
#[cfg(all(not(feature = "std"), target_arch = "x86_64"))]
pub fn timer_interrupt(regs: &mut Registers) -> ! {
    use vos_hal::apic;

    match reschedule(regs) {
        Dispatch::Run(_task, thread) => {
            let frame = *thread.regs.lock();
            if frame.from_user() {
                // SAFETY: paired with the interrupt entry swap.
                unsafe { arch::swapgs() };
            }
            apic::end_of_interrupt();
            // SAFETY: the frame was captured by a prior save (or
            // built by thread_exec) and its address space is loaded.
            unsafe { arch::resume_frame(&frame) }
        }
        Dispatch::Keep => {
            apic::end_of_interrupt();
            // SAFETY: returning on the current frame.
            unsafe { arch::resume_frame(regs) }
        }
        Dispatch::Idle => {
            mark_core_idle();
            apic::end_of_interrupt();
            // SAFETY: idling with interrupts on; the next tick
            // re-enters selection.
            unsafe { interrupts::enable() };
            loop {
                vos_hal::x86_64::cpu::wait_for_interrupt();
            }
        }
    }
}
