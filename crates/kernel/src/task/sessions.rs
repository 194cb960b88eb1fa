//! Sessions and process groups, the job-control topology.
//!
//! Groups and sessions refer to their members by pid and are
//! resolved through the tables; the only structural state is the
//! per-session pgid bitmap and group list. Membership is maintained
//! eagerly: exit and every group move unlink the pid from its old
//! group before the new link is made.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use vos_hal::IrqSafeLock;
use vos_utils::{Bitmap, HashMap, Lazy};

use crate::syscall::errno;
use crate::task::{Pid, Task};

pub struct ProcessGroup {
    pub pgid: Pid,
    pub sid: Pid,
    pub leader_pid: Pid,
    pub members: IrqSafeLock<Vec<Pid>>,
}

pub struct Session {
    pub sid: Pid,
    pub pgid_leader: Pid,
    pgid_bitmap: IrqSafeLock<Bitmap>,
    groups: IrqSafeLock<HashMap<Pid, Arc<ProcessGroup>>>,
}

static SESSION_TABLE: Lazy<IrqSafeLock<HashMap<Pid, Arc<Session>>>> =
    Lazy::new(|| IrqSafeLock::new(HashMap::new()));
static SID_BITMAP: Lazy<IrqSafeLock<Bitmap>> = Lazy::new(|| IrqSafeLock::new(Bitmap::new()));

pub fn find_session(sid: Pid) -> Option<Arc<Session>> {
    SESSION_TABLE.lock().get(&sid).cloned()
}

pub fn find_group(sid: Pid, pgid: Pid) -> Option<Arc<ProcessGroup>> {
    find_session(sid)?.groups.lock().get(&pgid).cloned()
}

fn unlink_member(task: &Task) {
    if let Some(group) = find_group(
        task.sid.load(Ordering::Acquire),
        task.pgid.load(Ordering::Acquire),
    ) {
        group.members.lock().retain(|pid| *pid != task.pid());
    }
}

/// Group-pointer invalidation on exit: the dying pid must not linger
/// in any member list.
pub fn leave_group(task: &Task) {
    unlink_member(task);
}

/// setsid: refuse for a current group leader, otherwise put the
/// caller at the head of a brand-new session and group.
pub fn create_session(task: &Arc<Task>) -> Result<Pid, i32> {
    let pid = task.pid();
    if let Some(group) = find_group(
        task.sid.load(Ordering::Acquire),
        task.pgid.load(Ordering::Acquire),
    ) && group.leader_pid == pid
    {
        return Err(errno::EPERM);
    }

    unlink_member(task);

    let sid = SID_BITMAP.lock().alloc() as Pid;
    let mut pgid_bitmap = Bitmap::new();
    let pgid = pgid_bitmap.alloc() as Pid;

    let group = Arc::new(ProcessGroup {
        pgid,
        sid,
        leader_pid: pid,
        members: IrqSafeLock::new(alloc::vec![pid]),
    });

    let session = Arc::new(Session {
        sid,
        pgid_leader: pgid,
        pgid_bitmap: IrqSafeLock::new(pgid_bitmap),
        groups: IrqSafeLock::new(HashMap::new()),
    });
    session.groups.lock().insert(pgid, group);
    SESSION_TABLE.lock().insert(sid, session);

    task.sid.store(sid, Ordering::Release);
    task.pgid.store(pgid, Ordering::Release);

    log::trace!("[SESSION] pid {pid} now leads session {sid} (pgid {pgid})");
    Ok(sid)
}

/// setpgid: move `target` into group `pgid` of its own session,
/// creating the group on first use.
pub fn set_pgid(caller: &Task, target: &Arc<Task>, pgid: Pid) -> Result<(), i32> {
    if pgid < 0 {
        return Err(errno::EINVAL);
    }
    let target_sid = target.sid.load(Ordering::Acquire);
    if target.pgid.load(Ordering::Acquire) == pgid {
        return Ok(());
    }

    let is_leader = find_group(target_sid, target.pgid.load(Ordering::Acquire))
        .is_some_and(|g| g.leader_pid == target.pid());
    if caller.sid.load(Ordering::Acquire) != target_sid
        || is_leader
        || target.has_execved.load(Ordering::Acquire)
    {
        return Err(errno::EPERM);
    }

    let session = find_session(target_sid).ok_or(errno::EPERM)?;

    unlink_member(target);

    let known = session.pgid_bitmap.lock().test(pgid as usize);
    if known {
        let group = session
            .groups
            .lock()
            .get(&pgid)
            .cloned()
            .ok_or(errno::EPERM)?;
        group.members.lock().push(target.pid());
    } else {
        session.pgid_bitmap.lock().set(pgid as usize);
        let group = Arc::new(ProcessGroup {
            pgid,
            sid: target_sid,
            leader_pid: target.pid(),
            members: IrqSafeLock::new(alloc::vec![target.pid()]),
        });
        session.groups.lock().insert(pgid, group);
    }

    target.pgid.store(pgid, Ordering::Release);
    Ok(())
}

#[cfg(all(test, feature = "std"))]
pub(crate) fn reset_tables() {
    SESSION_TABLE.lock().clear();
    *SID_BITMAP.lock() = Bitmap::new();
}
