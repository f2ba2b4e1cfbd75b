//! Shared wait-list protocol
//!
//! Every blocking operation on a sync object uses the same machinery: a
//! FIFO list of blocked TCBs threaded through their wait links, plus the
//! release helpers that hand a waiter back to the scheduler. The caller
//! side of the protocol (fast path, deadline bookkeeping, the retry loop)
//! lives in each object; the list manipulation lives here.

use core::ptr::NonNull;

use crate::critical::critical_section;
use crate::error::{KernelError, KernelResult};
use crate::kernel;
use crate::sched;
use crate::task::Tcb;
use crate::time;
use crate::types::{Prio, TaskState, Tick, WakeReason, PRIO_NONE, WAIT_FOREVER};

/// FIFO list of tasks blocked on one sync object.
///
/// Intrusive over the TCB wait links; arrival order is release order.
pub struct WaitList {
    head: Option<NonNull<Tcb>>,
    tail: Option<NonNull<Tcb>>,
}

impl WaitList {
    /// Create a new empty wait-list
    pub const fn new() -> Self {
        WaitList {
            head: None,
            tail: None,
        }
    }

    /// Check if the list is empty
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// First waiter in arrival order
    #[inline(always)]
    pub fn head(&self) -> Option<NonNull<Tcb>> {
        self.head
    }

    /// Append a TCB at the tail.
    ///
    /// # Safety
    /// Caller holds the kernel critical section; `tcb` must not already
    /// be on a wait-list.
    pub unsafe fn push_back(&mut self, tcb: NonNull<Tcb>) {
        let tcb_ref = unsafe { &mut *tcb.as_ptr() };

        tcb_ref.wait_next = None;
        tcb_ref.wait_prev = self.tail;

        match self.tail {
            Some(tail) => {
                unsafe { (*tail.as_ptr()).wait_next = Some(tcb) };
            }
            None => {
                self.head = Some(tcb);
            }
        }

        self.tail = Some(tcb);
    }

    /// Remove and return the first waiter.
    ///
    /// # Safety
    /// Caller holds the kernel critical section.
    pub unsafe fn pop_front(&mut self) -> Option<NonNull<Tcb>> {
        let head = self.head?;
        unsafe { self.remove(head) };
        Some(head)
    }

    /// Unlink a specific TCB from the list.
    ///
    /// # Safety
    /// Caller holds the kernel critical section; `tcb` must be on this
    /// list.
    pub unsafe fn remove(&mut self, tcb: NonNull<Tcb>) {
        let tcb_ref = unsafe { &mut *tcb.as_ptr() };

        match tcb_ref.wait_prev {
            Some(prev) => {
                unsafe { (*prev.as_ptr()).wait_next = tcb_ref.wait_next };
            }
            None => {
                self.head = tcb_ref.wait_next;
            }
        }

        match tcb_ref.wait_next {
            Some(next) => {
                unsafe { (*next.as_ptr()).wait_prev = tcb_ref.wait_prev };
            }
            None => {
                self.tail = tcb_ref.wait_prev;
            }
        }

        tcb_ref.wait_prev = None;
        tcb_ref.wait_next = None;
    }

    /// Highest (numerically lowest) effective priority among the waiters,
    /// or `PRIO_NONE` when the list is empty.
    pub fn highest_priority(&self) -> Prio {
        let mut highest = PRIO_NONE;
        let mut cursor = self.head;
        while let Some(tcb) = cursor {
            let tcb_ref = unsafe { tcb.as_ref() };
            if tcb_ref.effective_priority < highest {
                highest = tcb_ref.effective_priority;
            }
            cursor = tcb_ref.wait_next;
        }
        highest
    }
}

impl Default for WaitList {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for WaitList {}
unsafe impl Sync for WaitList {}

// ============ Blocking side ============

/// Put the current task to sleep on `list`, optionally arming a wake tick.
///
/// The task leaves the Running state, records the list it waits on, and
/// joins the list tail. The caller leaves the critical section afterwards
/// and yields; the task resumes when a release, a timeout, or a deletion
/// wakes it.
///
/// # Safety
/// Caller holds the kernel critical section and a current task exists.
pub(crate) unsafe fn block_current(list: *mut WaitList, wake_tick: Option<Tick>) {
    let Some(cur) = kernel::current_tcb() else {
        return;
    };

    let cur_ref = unsafe { &mut *cur.as_ptr() };

    // A retry after a spurious wake re-enters with waiting_on cleared by
    // the waker; a second call while still linked would corrupt the list.
    if cur_ref.waiting_on == list {
        return;
    }

    cur_ref.waiting_on = list;
    cur_ref.wake_reason = WakeReason::None;
    unsafe { (*list).push_back(cur) };

    if let Some(tick) = wake_tick {
        unsafe { sched::set_timeout(cur, tick) };
    }

    cur_ref.state = TaskState::Blocked;
}

// ============ Release side ============

/// Release the first waiter, recording `reason` for it.
///
/// Cancels any pending timeout and hands the task back to the scheduler.
/// Exactly one waiter is released per call.
///
/// # Safety
/// Caller holds the kernel critical section.
pub(crate) unsafe fn wake_one(list: &mut WaitList, reason: WakeReason) -> Option<NonNull<Tcb>> {
    let tcb = unsafe { list.pop_front() }?;

    let tcb_ref = unsafe { &mut *tcb.as_ptr() };
    tcb_ref.waiting_on = core::ptr::null_mut();
    tcb_ref.wake_reason = reason;

    unsafe {
        sched::cancel_timeout(tcb);
        sched::add_task(tcb);
    }

    Some(tcb)
}

/// Release every waiter with `reason`. Used when an object is deleted.
///
/// # Safety
/// Caller holds the kernel critical section.
pub(crate) unsafe fn wake_all(list: &mut WaitList, reason: WakeReason) {
    while unsafe { wake_one(list, reason) }.is_some() {}
}

// ============ Deadline bookkeeping ============

/// Outcome of the per-iteration deadline check in a blocking loop.
pub(crate) enum Armed {
    /// `WAIT_FOREVER`: block with no wake tick
    Forever,
    /// Block with a wake armed at this absolute tick
    At(Tick),
}

/// Shared remaining-time check for the blocking loops.
///
/// `WAIT_FOREVER` never arms a wake tick; any other timeout fails with
/// `Timeout` once the deadline has passed, so a retry after a spurious
/// wake re-blocks only for the time actually left.
pub(crate) fn arm_deadline(timeout: Tick, deadline: Tick) -> KernelResult<Armed> {
    if timeout == WAIT_FOREVER {
        return Ok(Armed::Forever);
    }

    let now = time::now();
    let remaining = time::ticks_until(deadline, now);
    if remaining == 0 {
        return Err(KernelError::Timeout);
    }

    Ok(Armed::At(now.wrapping_add(remaining)))
}

/// Wake reason of the current task, read under a critical section.
pub(crate) fn current_wake_reason() -> WakeReason {
    critical_section(|_cs| {
        kernel::current_tcb()
            .map(|tcb| unsafe { tcb.as_ref().wake_reason })
            .unwrap_or(WakeReason::None)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut a = Tcb::new();
        let mut b = Tcb::new();
        let mut c = Tcb::new();
        let mut list = WaitList::new();

        unsafe {
            list.push_back(NonNull::from(&mut a));
            list.push_back(NonNull::from(&mut b));
            list.push_back(NonNull::from(&mut c));

            assert_eq!(list.pop_front(), Some(NonNull::from(&mut a)));
            assert_eq!(list.pop_front(), Some(NonNull::from(&mut b)));
            assert_eq!(list.pop_front(), Some(NonNull::from(&mut c)));
            assert!(list.pop_front().is_none());
        }
    }

    #[test]
    fn test_remove_middle() {
        let mut a = Tcb::new();
        let mut b = Tcb::new();
        let mut c = Tcb::new();
        let mut list = WaitList::new();

        unsafe {
            list.push_back(NonNull::from(&mut a));
            list.push_back(NonNull::from(&mut b));
            list.push_back(NonNull::from(&mut c));

            list.remove(NonNull::from(&mut b));
            assert!(b.wait_next.is_none() && b.wait_prev.is_none());

            assert_eq!(list.pop_front(), Some(NonNull::from(&mut a)));
            assert_eq!(list.pop_front(), Some(NonNull::from(&mut c)));
            assert!(list.is_empty());
        }
    }

    #[test]
    fn test_highest_priority() {
        let mut a = Tcb::new();
        let mut b = Tcb::new();
        a.effective_priority = 5;
        b.effective_priority = 2;

        let mut list = WaitList::new();
        assert_eq!(list.highest_priority(), PRIO_NONE);

        unsafe {
            list.push_back(NonNull::from(&mut a));
            assert_eq!(list.highest_priority(), 5);
            list.push_back(NonNull::from(&mut b));
            assert_eq!(list.highest_priority(), 2);
        }
    }
}
