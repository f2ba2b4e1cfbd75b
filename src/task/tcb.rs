//! Task Control Block (TCB) definition
//!
//! The TCB is the bookkeeping record of one schedulable flow of control.
//! It carries three independent intrusive link pairs so a task can sit on
//! a ready queue, a delayed list, and a sync object's wait-list without
//! any of those lists owning it.

use core::ptr::NonNull;

use crate::config::TASK_NAME_LEN;
use crate::sync::wait::WaitList;
use crate::types::{Prio, TaskState, Tick, WakeReason};

/// Task entry point function type
pub type TaskFn = fn(*mut ()) -> !;

/// `delay_home` value meaning "not on a delayed list".
pub(crate) const DELAY_HOME_NONE: u8 = u8::MAX;

/// Task Control Block
#[repr(C)]
pub struct Tcb {
    // ============ CPU context ============
    /// Saved top-of-stack while the task is suspended. Written by the
    /// context-switch handler for the outgoing task; read for the incoming
    /// one. For a newly created task it points at the synthesized frame.
    pub(crate) stack_pointer: *mut u32,

    // ============ Stack bounds ============
    /// Base (lowest address) of the task's stack slot
    pub(crate) stack_base: *mut u32,
    /// Stack slot size in bytes
    pub(crate) stack_size: usize,

    // ============ Identification ============
    /// NUL-terminated ASCII name, for debugging only
    pub(crate) name: [u8; TASK_NAME_LEN],

    // ============ Priority ============
    /// Priority assigned at creation
    pub(crate) base_priority: Prio,
    /// Current scheduling priority; differs from `base_priority` only
    /// while boosted by priority inheritance
    pub(crate) effective_priority: Prio,

    // ============ Scheduling state ============
    pub(crate) state: TaskState,
    /// Absolute tick at which a delay or timeout expires; meaningful only
    /// while on a delayed list
    pub(crate) wake_tick: Tick,
    /// Cause recorded by whoever made this task ready again
    pub(crate) wake_reason: WakeReason,
    /// Wait-list of the sync object this task is blocked on; null when
    /// not blocked on an object
    pub(crate) waiting_on: *mut WaitList,

    // ============ Ready queue links ============
    pub(crate) ready_next: Option<NonNull<Tcb>>,
    pub(crate) ready_prev: Option<NonNull<Tcb>>,

    // ============ Delayed list links ============
    pub(crate) delay_next: Option<NonNull<Tcb>>,
    pub(crate) delay_prev: Option<NonNull<Tcb>>,
    /// Index of the delayed list holding this task, or `DELAY_HOME_NONE`
    pub(crate) delay_home: u8,

    // ============ Wait-list links ============
    pub(crate) wait_next: Option<NonNull<Tcb>>,
    pub(crate) wait_prev: Option<NonNull<Tcb>>,

    // ============ Statistics ============
    /// Number of times this task was scheduled in
    pub(crate) run_count: u32,
    /// Ticks charged to this task while running
    pub(crate) total_runtime: u32,
}

impl Tcb {
    /// Create a new, unlinked TCB
    pub const fn new() -> Self {
        Tcb {
            stack_pointer: core::ptr::null_mut(),
            stack_base: core::ptr::null_mut(),
            stack_size: 0,

            name: [0; TASK_NAME_LEN],

            base_priority: 0,
            effective_priority: 0,

            state: TaskState::Ready,
            wake_tick: 0,
            wake_reason: WakeReason::None,
            waiting_on: core::ptr::null_mut(),

            ready_next: None,
            ready_prev: None,

            delay_next: None,
            delay_prev: None,
            delay_home: DELAY_HOME_NONE,

            wait_next: None,
            wait_prev: None,

            run_count: 0,
            total_runtime: 0,
        }
    }

    /// Copy a task name, truncating to the buffer and NUL-terminating.
    pub(crate) fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let len = bytes.len().min(TASK_NAME_LEN - 1);
        self.name[..len].copy_from_slice(&bytes[..len]);
        self.name[len..].fill(0);
    }

    /// Task name as a string slice
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    /// Current task state
    #[inline]
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Priority assigned at creation
    #[inline]
    pub fn base_priority(&self) -> Prio {
        self.base_priority
    }

    /// Current scheduling priority
    #[inline]
    pub fn effective_priority(&self) -> Prio {
        self.effective_priority
    }

    /// Why the task was last woken
    #[inline]
    pub fn wake_reason(&self) -> WakeReason {
        self.wake_reason
    }

    /// Number of times the task was scheduled in
    #[inline]
    pub fn run_count(&self) -> u32 {
        self.run_count
    }

    /// Ticks spent running
    #[inline]
    pub fn total_runtime(&self) -> u32 {
        self.total_runtime
    }

    /// Check if the task is ready to run
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state == TaskState::Ready
    }

    /// Check if the task is blocked on a sync object
    #[inline]
    pub(crate) fn is_waiting_on_object(&self) -> bool {
        !self.waiting_on.is_null()
    }
}

impl Default for Tcb {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for Tcb {}
unsafe impl Sync for Tcb {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_truncation() {
        let mut tcb = Tcb::new();
        tcb.set_name("a-task-name-longer-than-the-buffer");
        assert_eq!(tcb.name().len(), TASK_NAME_LEN - 1);
        assert_eq!(tcb.name(), "a-task-name-lon");

        tcb.set_name("short");
        assert_eq!(tcb.name(), "short");
    }

    #[test]
    fn test_fresh_tcb_is_unlinked() {
        let tcb = Tcb::new();
        assert!(tcb.ready_next.is_none());
        assert!(tcb.delay_prev.is_none());
        assert!(tcb.wait_next.is_none());
        assert_eq!(tcb.delay_home, DELAY_HOME_NONE);
        assert!(!tcb.is_waiting_on_object());
    }
}
