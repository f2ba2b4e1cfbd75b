//! Scheduler core
//!
//! Fixed-priority preemptive scheduling with round-robin inside a band.
//! The scheduler owns the ready queues, the two delayed lists, and the
//! choice of the next task; the actual register swap is requested from
//! the port and happens in its context-switch handler.
//!
//! Exactly one task is Running at any time and a Running task is on no
//! ready queue. A task that comes back from Running (yield, preemption)
//! re-enters its band at the tail, which rotates the band round-robin.

mod delay_list;
mod ready_queue;

pub use delay_list::DelayList;
pub use ready_queue::ReadyQueue;

use core::ptr::NonNull;

use crate::config::PRIO_COUNT;
use crate::critical::{critical_section, CriticalSection};
use crate::cs_cell::CsCell;
use crate::kernel::{self, KERNEL};
use crate::port;
use crate::prio::PrioTable;
use crate::task::tcb::DELAY_HOME_NONE;
use crate::task::Tcb;
use crate::time;
use crate::types::{Prio, TaskState, Tick, WakeReason};

/// Scheduler state
pub(crate) struct SchedState {
    pub(crate) prio_tbl: PrioTable,
    pub(crate) ready: [ReadyQueue; PRIO_COUNT],
    /// Two wake-time-sorted lists; `delayed_current` indexes the one for
    /// the running tick epoch, the other collects wakes past the wrap.
    pub(crate) delayed: [DelayList; 2],
    pub(crate) delayed_current: usize,
}

impl SchedState {
    const fn new() -> Self {
        SchedState {
            prio_tbl: PrioTable::new(),
            ready: [const { ReadyQueue::new() }; PRIO_COUNT],
            delayed: [const { DelayList::new() }; 2],
            delayed_current: 0,
        }
    }

    fn reset(&mut self) {
        self.prio_tbl.init();
        for queue in self.ready.iter_mut() {
            queue.init();
        }
        for list in self.delayed.iter_mut() {
            list.init();
        }
        self.delayed_current = 0;
    }
}

/// Global scheduler state instance
static SCHED: CsCell<SchedState> = CsCell::new(SchedState::new());

/// Scheduler state accessor.
///
/// # Safety
/// Caller must hold the kernel critical section.
#[inline(always)]
pub(crate) unsafe fn state() -> &'static mut SchedState {
    unsafe { SCHED.get_unchecked() }
}

/// Empty all scheduler lists and reset the epoch index.
pub(crate) fn init() {
    critical_section(|cs| SCHED.get(cs).reset());
}

// ============ Ready queue management ============

/// Make a task ready and enqueue it at the tail of its band.
///
/// # Safety
/// Caller holds the kernel critical section; the task must not already
/// be on a ready queue.
pub(crate) unsafe fn add_task(tcb: NonNull<Tcb>) {
    let tcb_ref = unsafe { &mut *tcb.as_ptr() };
    tcb_ref.state = TaskState::Ready;

    let prio = tcb_ref.effective_priority;
    let s = unsafe { state() };
    unsafe { s.ready[prio as usize].insert_tail(tcb) };
    s.prio_tbl.insert(prio);
}

/// Detach a task from the ready queue and delayed list it may be on.
///
/// Wait-list membership is owned by the sync object and deliberately not
/// touched here.
///
/// # Safety
/// Caller holds the kernel critical section.
pub(crate) unsafe fn remove_task(tcb: NonNull<Tcb>) {
    let tcb_ref = unsafe { &mut *tcb.as_ptr() };
    let s = unsafe { state() };

    if tcb_ref.state == TaskState::Ready {
        let prio = tcb_ref.effective_priority;
        unsafe { s.ready[prio as usize].remove(tcb) };
        if s.ready[prio as usize].is_empty() {
            s.prio_tbl.remove(prio);
        }
    }

    if tcb_ref.delay_home != DELAY_HOME_NONE {
        unsafe { s.delayed[tcb_ref.delay_home as usize].remove(tcb) };
        tcb_ref.delay_home = DELAY_HOME_NONE;
    }
}

/// Pop the head of the highest non-empty priority band.
///
/// The chosen task leaves its queue; the caller marks it Running.
///
/// # Safety
/// Caller holds the kernel critical section.
pub(crate) unsafe fn get_next_task() -> Option<NonNull<Tcb>> {
    let s = unsafe { state() };
    let prio = s.prio_tbl.get_highest();

    let task = unsafe { s.ready[prio as usize].pop_head() };
    if s.ready[prio as usize].is_empty() {
        s.prio_tbl.remove(prio);
    }

    task
}

/// Highest priority with any ready task, or the idle band when none.
///
/// # Safety
/// Caller holds the kernel critical section.
#[inline]
pub(crate) unsafe fn highest_ready_priority() -> Prio {
    unsafe { state() }.prio_tbl.get_highest()
}

/// True when no task at all is ready.
///
/// # Safety
/// Caller holds the kernel critical section.
#[inline]
pub(crate) unsafe fn no_ready_tasks() -> bool {
    unsafe { state() }.prio_tbl.is_empty()
}

// ============ Scheduling points ============

/// Pick the next task and request a context switch if it differs from
/// the current one.
///
/// The caller has already put the current task where it belongs (tail of
/// its band for a yield, a wait-list or delayed list for a block, nowhere
/// for a self-delete). When every queue is empty the idle task is chosen.
pub(crate) fn schedule() {
    if KERNEL.sched_lock_nesting() > 0 {
        return;
    }

    let _cs = CriticalSection::enter();
    unsafe {
        let Some(next) = get_next_task().or_else(kernel::idle_tcb) else {
            return;
        };

        let next_ref = &mut *next.as_ptr();
        next_ref.state = TaskState::Running;
        next_ref.run_count = next_ref.run_count.wrapping_add(1);

        kernel::set_next_tcb(Some(next));

        if kernel::current_tcb() != Some(next) {
            port::trigger_context_switch();
        }
    }
}

/// Block the current task for `ticks` and hand the CPU away.
///
/// The wake tick wraps naturally; epoch placement in [`set_timeout`]
/// keeps it correct across the counter wrap.
pub(crate) fn delay_current(ticks: Tick) {
    {
        let _cs = CriticalSection::enter();
        unsafe {
            if let Some(cur) = kernel::current_tcb() {
                let cur_ref = &mut *cur.as_ptr();
                cur_ref.state = TaskState::Blocked;
                cur_ref.wake_reason = WakeReason::None;
                set_timeout(cur, KERNEL.tick_get().wrapping_add(ticks));
            }
        }
    }

    schedule();
}

// ============ Timeouts ============

/// Arm a wake tick for a task and file it on the proper delayed list.
///
/// A wake tick numerically below the current count can only be reached
/// after the counter wraps, so it goes to the overflow-epoch list.
///
/// # Safety
/// Caller holds the kernel critical section; the task must not already
/// be on a delayed list.
pub(crate) unsafe fn set_timeout(tcb: NonNull<Tcb>, wake_tick: Tick) {
    let tcb_ref = unsafe { &mut *tcb.as_ptr() };
    tcb_ref.wake_tick = wake_tick;

    let s = unsafe { state() };
    let index = if wake_tick >= KERNEL.tick_get() {
        s.delayed_current
    } else {
        s.delayed_current ^ 1
    };

    tcb_ref.delay_home = index as u8;
    unsafe { s.delayed[index].insert_sorted(tcb) };
}

/// Disarm a pending wake tick, if any.
///
/// # Safety
/// Caller holds the kernel critical section.
pub(crate) unsafe fn cancel_timeout(tcb: NonNull<Tcb>) {
    let tcb_ref = unsafe { &mut *tcb.as_ptr() };
    if tcb_ref.delay_home != DELAY_HOME_NONE {
        let s = unsafe { state() };
        unsafe { s.delayed[tcb_ref.delay_home as usize].remove(tcb) };
        tcb_ref.delay_home = DELAY_HOME_NONE;
    }
}

/// Resolve an expired wake tick.
///
/// A task still on a sync object's wait-list lost the race against its
/// deadline: it is pulled off the wait-list with reason Timeout. A plain
/// delay just becomes ready again.
///
/// # Safety
/// Caller holds the kernel critical section; the task has already been
/// unlinked from its delayed list.
pub(crate) unsafe fn expire_timeout(tcb: NonNull<Tcb>) {
    let tcb_ref = unsafe { &mut *tcb.as_ptr() };

    if !tcb_ref.waiting_on.is_null() {
        unsafe { (*tcb_ref.waiting_on).remove(tcb) };
        tcb_ref.waiting_on = core::ptr::null_mut();
        tcb_ref.wake_reason = WakeReason::Timeout;
    }

    unsafe { add_task(tcb) };
}

// ============ Tick processing ============

/// Wake every task on the current-epoch list whose wake tick has passed.
///
/// # Safety
/// Caller holds the kernel critical section.
unsafe fn drain_expired(now: Tick) {
    loop {
        let head = {
            let s = unsafe { state() };
            match s.delayed[s.delayed_current].head() {
                Some(head) if time::lte(unsafe { head.as_ref() }.wake_tick, now) => head,
                _ => break,
            }
        };

        {
            let s = unsafe { state() };
            unsafe { s.delayed[s.delayed_current].remove(head) };
        }
        unsafe { (*head.as_ptr()).delay_home = DELAY_HOME_NONE };

        unsafe { expire_timeout(head) };
    }
}

/// Tick processing, called from the timer interrupt.
///
/// Advances the counter, expires due delays and timeouts, swaps the
/// epoch lists at the wrap to zero, and preempts the current task when a
/// higher band became ready.
pub(crate) fn tick() {
    let _cs = CriticalSection::enter();

    let now = KERNEL.tick_increment();

    unsafe {
        if let Some(cur) = kernel::current_tcb() {
            let cur_ref = &mut *cur.as_ptr();
            cur_ref.total_runtime = cur_ref.total_runtime.wrapping_add(1);
        }

        drain_expired(now);

        if now == 0 {
            // Counter wrapped: the overflow epoch becomes the current one
            state().delayed_current ^= 1;
            drain_expired(now);
        }

        if KERNEL.sched_lock_nesting() > 0 {
            return;
        }

        if let Some(cur) = kernel::current_tcb() {
            let (cur_state, cur_prio) = {
                let cur_ref = cur.as_ref();
                (cur_ref.state, cur_ref.effective_priority)
            };

            if cur_state == TaskState::Running && highest_ready_priority() < cur_prio {
                add_task(cur);

                let next = get_next_task().unwrap_or(cur);
                let next_ref = &mut *next.as_ptr();
                next_ref.state = TaskState::Running;
                next_ref.run_count = next_ref.run_count.wrapping_add(1);

                kernel::set_next_tcb(Some(next));

                if next != cur {
                    port::trigger_context_switch();
                }
            }
        }
    }
}

// ============ Priority adjustment ============

/// Move a task to a new effective priority, relinking its ready queue
/// when it is Ready.
///
/// # Safety
/// Caller holds the kernel critical section.
pub(crate) unsafe fn change_effective_priority(tcb: NonNull<Tcb>, new_prio: Prio) {
    let tcb_ref = unsafe { &mut *tcb.as_ptr() };
    let old_prio = tcb_ref.effective_priority;

    if old_prio == new_prio {
        return;
    }

    if tcb_ref.state == TaskState::Ready {
        let s = unsafe { state() };
        unsafe { s.ready[old_prio as usize].remove(tcb) };
        if s.ready[old_prio as usize].is_empty() {
            s.prio_tbl.remove(old_prio);
        }

        tcb_ref.effective_priority = new_prio;

        unsafe { s.ready[new_prio as usize].insert_tail(tcb) };
        s.prio_tbl.insert(new_prio);
    } else {
        tcb_ref.effective_priority = new_prio;
    }
}

/// Raise a task's effective priority (priority inheritance).
///
/// # Safety
/// Caller holds the kernel critical section; `new_prio` must be higher
/// (numerically lower) than the task's current effective priority.
pub(crate) unsafe fn boost_priority(tcb: NonNull<Tcb>, new_prio: Prio) {
    debug_assert!(new_prio < unsafe { tcb.as_ref() }.effective_priority);
    unsafe { change_effective_priority(tcb, new_prio) };
}

/// Revert a boosted task to its saved priority.
///
/// # Safety
/// Caller holds the kernel critical section.
pub(crate) unsafe fn restore_priority(tcb: NonNull<Tcb>, prio: Prio) {
    unsafe { change_effective_priority(tcb, prio) };
}
