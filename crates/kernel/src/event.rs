//! Level-triggered events.
//!
//! An event generalizes a condition variable: one task owns it,
//! prospective firers install triggers on it, and a pending counter
//! lets a fire that races ahead of the wait still release exactly
//! one waiter. waitpid, blocking reads, timers and signal waits all
//! sit on this one primitive.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use vos_hal::{IrqSafeLock, interrupts};

use crate::task::{self, Pid, Tid, scheduler};
use crate::time::Timespec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum EventType {
    ProcExit = 0,
    FdRead = 1,
    FdWrite = 2,
    Timer = 3,
    Signal = 4,
}

/// A standing registration: "when the agent fires, deliver into
/// `target`". Triggers are owned by their agent and never freed on
/// fire; `exit` relies on that to run without allocating. The agent
/// reference keeps an exited task readable (its wait-encoded status)
/// until the waiter reaps it.
pub struct Trigger {
    pub agent_pid: AtomicI32,
    pub agent_tid: AtomicI32,
    pub event_type: EventType,
    agent: IrqSafeLock<Option<Arc<task::Task>>>,
    target: IrqSafeLock<Option<Arc<Event>>>,
}

impl Trigger {
    pub fn new(agent_pid: Pid, agent_tid: Tid, event_type: EventType) -> Arc<Self> {
        Arc::new(Self {
            agent_pid: AtomicI32::new(agent_pid),
            agent_tid: AtomicI32::new(agent_tid),
            event_type,
            agent: IrqSafeLock::new(None),
            target: IrqSafeLock::new(None),
        })
    }

    /// Points the trigger at a (new) destination event. waitpid uses
    /// this to steer a child's exit trigger into the caller's event.
    pub fn retarget(&self, event: Arc<Event>) {
        *self.target.lock() = Some(event);
    }

    pub fn target(&self) -> Option<Arc<Event>> {
        self.target.lock().clone()
    }

    pub fn set_agent(&self, agent: Arc<task::Task>) {
        *self.agent.lock() = Some(agent);
    }

    pub fn agent(&self) -> Option<Arc<task::Task>> {
        self.agent.lock().clone()
    }

    /// Reap: releases the agent reference so the task object can go.
    pub fn clear_agent(&self) {
        *self.agent.lock() = None;
    }

    pub fn agent_pid(&self) -> Pid {
        self.agent_pid.load(Ordering::Acquire)
    }
}

/// Rendezvous object. `owner` is the task/thread a fire requeues.
pub struct Event {
    pub owner_pid: AtomicI32,
    pub owner_tid: AtomicI32,
    pending: AtomicU32,
    triggers: IrqSafeLock<Vec<Arc<Trigger>>>,
}

impl Event {
    pub fn new(owner_pid: Pid, owner_tid: Tid) -> Arc<Self> {
        Arc::new(Self {
            owner_pid: AtomicI32::new(owner_pid),
            owner_tid: AtomicI32::new(owner_tid),
            pending: AtomicU32::new(0),
            triggers: IrqSafeLock::new(Vec::new()),
        })
    }

    pub fn set_owner(&self, pid: Pid, tid: Tid) {
        self.owner_pid.store(pid, Ordering::Release);
        self.owner_tid.store(tid, Ordering::Release);
    }

    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }
}

/// Registers `trigger` on `event`.
pub fn append_trigger(event: &Arc<Event>, trigger: &Arc<Trigger>) {
    event.triggers.lock().push(trigger.clone());
}

/// Blocks the caller until a trigger of `event_type` lands on
/// `event`. A pending fire is consumed without blocking.
///
/// The slow path is the scheduler's blocking primitive: dequeue,
/// raise `event_waiting`, and spin until the next dispatch of this
/// thread clears the flag. Wrong-typed wakeups loop back to waiting.
pub fn wait(event: &Arc<Event>, event_type: EventType) -> Result<(), ()> {
    let task = task::current_task().ok_or(())?;
    let thread = task::current_thread().ok_or(())?;

    let saved = interrupts::disable();

    if event.pending.load(Ordering::Acquire) > 0 {
        event.pending.fetch_sub(1, Ordering::AcqRel);
        interrupts::restore(saved);
        return Ok(());
    }

    loop {
        scheduler::dequeue(&task, &thread);
        task.event_waiting.store(true, Ordering::Release);

        // SAFETY: state is parked; the dispatch that clears
        // `event_waiting` happens under the scheduler lock.
        unsafe { interrupts::enable() };

        while task.event_waiting.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }

        let matched = task
            .last_trigger
            .lock()
            .as_ref()
            .is_some_and(|t| t.event_type == event_type);
        if matched {
            // Consume the token the fire posted: each fire satisfies
            // exactly one waiter.
            event.pending.fetch_sub(1, Ordering::AcqRel);
            interrupts::restore(saved);
            return Ok(());
        }
    }
}

/// Fires `trigger` into its target event: bumps the pending counter,
/// records the trigger as the owner's `last_trigger`, and requeues
/// the owner so the next tick can dispatch it.
pub fn fire(trigger: &Arc<Trigger>) -> Result<(), ()> {
    let event = trigger.target().ok_or(())?;

    let saved = interrupts::disable();

    event.pending.fetch_add(1, Ordering::AcqRel);

    let owner_pid = event.owner_pid.load(Ordering::Acquire);
    let owner_tid = event.owner_tid.load(Ordering::Acquire);
    if let Some(owner) = task::translate_pid(owner_pid) {
        *owner.last_trigger.lock() = Some(trigger.clone());
        if let Some(owner_thread) = task::translate_tid(owner_pid, owner_tid) {
            scheduler::requeue(&owner, &owner_thread);
        }
    }

    interrupts::restore(saved);
    Ok(())
}

/// Installs a timer trigger on `event`; the timer subsystem fires it
/// once wall time reaches `deadline`.
pub fn create_timer(event: &Arc<Event>, deadline: Timespec) -> Arc<Trigger> {
    let trigger = Trigger::new(
        event.owner_pid.load(Ordering::Acquire),
        event.owner_tid.load(Ordering::Acquire),
        EventType::Timer,
    );
    trigger.retarget(event.clone());
    crate::time::arm_timer(deadline, trigger.clone());
    trigger
}

/// Consumes one pending count without blocking, if any.
pub fn poll(event: &Arc<Event>) -> bool {
    interrupts::without(|| {
        if event.pending.load(Ordering::Acquire) > 0 {
            event.pending.fetch_sub(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    })
}

/// Clears the waiting flag of a freshly dispatched task; only the
/// scheduler calls this.
pub(crate) fn note_dispatched(task: &task::Task) {
    task.event_waiting.store(false, Ordering::Release);
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::arch::Registers;
    use crate::task::scheduler::{self, Dispatch};
    use crate::task::{Task, TaskStatus, Thread};
    use crate::test_support::{become_current, kernel_test};

    #[test]
    fn fire_posts_a_token_and_records_the_trigger() {
        let _guard = kernel_test();
        let owner = Task::create_default();
        let owner_thread = Thread::create_default(&owner).unwrap();
        owner.event.set_owner(owner.pid(), owner_thread.tid);

        let agent = Task::create_default();
        let trigger = Trigger::new(agent.pid(), 0, EventType::ProcExit);
        trigger.retarget(owner.event.clone());
        append_trigger(&owner.event, &trigger);

        assert_eq!(owner.event.pending(), 0);
        fire(&trigger).unwrap();
        assert_eq!(owner.event.pending(), 1);

        let recorded = owner.last_trigger.lock().clone().unwrap();
        assert_eq!(recorded.agent_pid(), agent.pid());
        assert_eq!(recorded.event_type, EventType::ProcExit);
        // The parked owner came back to the ready set.
        assert_eq!(owner.status(), TaskStatus::Waiting);
    }

    #[test]
    fn pending_token_satisfies_the_next_wait_without_blocking() {
        let _guard = kernel_test();
        let (task, thread) = {
            let task = Task::create_default();
            let thread = Thread::create_default(&task).unwrap();
            task.event.set_owner(task.pid(), thread.tid);
            (task, thread)
        };
        become_current(&task, &thread);

        let trigger = Trigger::new(task.pid(), 0, EventType::Timer);
        trigger.retarget(task.event.clone());
        fire(&trigger).unwrap();

        // Level-triggered: the earlier fire releases this wait.
        wait(&task.event, EventType::Timer).unwrap();
        assert_eq!(task.event.pending(), 0);
    }

    #[test]
    fn fire_without_a_target_event_is_an_error() {
        let _guard = kernel_test();
        let trigger = Trigger::new(1, 0, EventType::FdRead);
        assert_eq!(fire(&trigger), Err(()));
    }

    /// Two threads of one task park themselves; neither is
    /// selectable until a fire targets their event.
    #[test]
    fn dequeued_threads_stay_parked_until_a_fire() {
        let _guard = kernel_test();
        let task = Task::create_default();
        let t0 = Thread::create_default(&task).unwrap();
        let t1 = Thread::create_default(&task).unwrap();
        task.event.set_owner(task.pid(), t0.tid);

        scheduler::dequeue_and_yield(&task, &t0);
        scheduler::dequeue_and_yield(&task, &t1);

        let regs = Registers::default();
        assert!(matches!(scheduler::reschedule(&regs), Dispatch::Idle));

        let trigger = Trigger::new(task.pid(), t0.tid, EventType::FdRead);
        trigger.retarget(task.event.clone());
        fire(&trigger).unwrap();

        match scheduler::reschedule(&regs) {
            Dispatch::Run(run_task, run_thread) => {
                assert_eq!(run_task.pid(), task.pid());
                assert_eq!(run_thread.tid, t0.tid);
                // Dispatch cleared the waiting flag.
                assert!(!task.event_waiting.load(Ordering::Acquire));
            }
            _ => panic!("fired owner must be selectable"),
        }
        // The sibling thread stays parked.
        assert_eq!(t1.status(), TaskStatus::Yield);
    }
}
