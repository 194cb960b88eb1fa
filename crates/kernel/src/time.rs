//! Wall-clock timers feeding the event subsystem.
//!
//! `event::create_timer` parks a trigger here; the platform timer
//! interrupt calls [`tick`] with the current time and every due
//! trigger fires into its event.

use alloc::sync::Arc;
use alloc::vec::Vec;

use vos_hal::IrqSafeLock;
use vos_utils::Lazy;

use crate::event::{self, Trigger};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(C)]
pub struct Timespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

impl Timespec {
    pub const fn new(tv_sec: i64, tv_nsec: i64) -> Self {
        Self { tv_sec, tv_nsec }
    }
}

struct Timer {
    deadline: Timespec,
    trigger: Arc<Trigger>,
}

static TIMER_LIST: Lazy<IrqSafeLock<Vec<Timer>>> = Lazy::new(|| IrqSafeLock::new(Vec::new()));

/// Parks `trigger` until wall time reaches `deadline`.
pub fn arm_timer(deadline: Timespec, trigger: Arc<Trigger>) {
    TIMER_LIST.lock().push(Timer { deadline, trigger });
}

/// Fires every timer whose deadline has passed. Called from the
/// platform tick with the current wall time.
pub fn tick(now: Timespec) {
    let due: Vec<Arc<Trigger>> = {
        let mut list = TIMER_LIST.lock();
        let mut fired = Vec::new();
        list.retain(|timer| {
            if timer.deadline <= now {
                fired.push(timer.trigger.clone());
                false
            } else {
                true
            }
        });
        fired
    };
    for trigger in due {
        let _ = event::fire(&trigger);
    }
}

pub fn armed_timers() -> usize {
    TIMER_LIST.lock().len()
}

#[cfg(all(test, feature = "std"))]
pub(crate) fn reset_timers() {
    TIMER_LIST.lock().clear();
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::event::{Event, EventType};
    use crate::test_support::kernel_test;

    #[test]
    fn tick_fires_exactly_the_due_triggers() {
        let _guard = kernel_test();
        let early = Event::new(-1, -1);
        let late = Event::new(-1, -1);

        event::create_timer(&early, Timespec::new(10, 0));
        event::create_timer(&late, Timespec::new(20, 0));
        assert_eq!(armed_timers(), 2);

        tick(Timespec::new(15, 0));
        assert_eq!(armed_timers(), 1);
        assert_eq!(early.pending(), 1); // token posted
        assert_eq!(late.pending(), 0);

        tick(Timespec::new(25, 0));
        assert_eq!(armed_timers(), 0);
        assert_eq!(late.pending(), 1);
    }

    #[test]
    fn timer_trigger_carries_the_timer_type() {
        let _guard = kernel_test();
        let ev = Event::new(-1, -1);
        let trigger = event::create_timer(&ev, Timespec::new(1, 0));
        assert_eq!(trigger.event_type, EventType::Timer);
    }

    #[test]
    fn nsec_ordering_is_respected() {
        assert!(Timespec::new(1, 500) < Timespec::new(1, 600));
        assert!(Timespec::new(2, 0) > Timespec::new(1, 999_999_999));
    }
}
