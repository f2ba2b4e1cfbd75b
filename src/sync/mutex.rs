//! Mutex with priority inheritance
//!
//! Ownership-tracked mutual exclusion. While a high-priority task waits
//! on a mutex held by a lower-priority one, the holder runs at the
//! highest waiter priority and reverts to its base priority on release.
//! Inheritance is a single step; a boosted owner blocked on a second
//! mutex does not propagate the boost further. Recursive locking by the
//! owner is rejected.

use core::ptr::NonNull;

use crate::config::TASK_NAME_LEN;
use crate::critical::{is_isr_context, CriticalSection};
use crate::error::{KernelError, KernelResult};
use crate::kernel::{self, KERNEL};
use crate::mem;
use crate::sched;
use crate::sync::wait::{self, Armed, WaitList};
use crate::task::{Tcb, TaskHandle};
use crate::time;
use crate::types::{Prio, Tick, WakeReason, NO_WAIT, PRIO_NONE};

/// Mutex control block
#[repr(C)]
pub struct MutexCb {
    /// Task holding the mutex, or null
    pub(crate) owner: *mut Tcb,
    pub(crate) waiting_tasks: WaitList,
    /// Owner's base priority snapshot from the first boost;
    /// `PRIO_NONE` while no inheritance is in effect
    pub(crate) saved_priority: Prio,
    name: [u8; TASK_NAME_LEN],
}

impl MutexCb {
    pub const fn new() -> Self {
        MutexCb {
            owner: core::ptr::null_mut(),
            waiting_tasks: WaitList::new(),
            saved_priority: PRIO_NONE,
            name: [0; TASK_NAME_LEN],
        }
    }

    /// Mutex name as a string slice
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}

/// Opaque mutex handle
pub type MutexHandle = NonNull<MutexCb>;

/// Create an unlocked mutex.
pub fn mutex_create(name: &str) -> Option<MutexHandle> {
    if is_isr_context() {
        return None;
    }

    let mcb = mem::alloc_mcb()?;

    unsafe {
        mcb.as_ptr().write(MutexCb::new());

        let mcb_ref = &mut *mcb.as_ptr();
        let bytes = name.as_bytes();
        let len = bytes.len().min(TASK_NAME_LEN - 1);
        mcb_ref.name[..len].copy_from_slice(&bytes[..len]);
    }

    Some(mcb)
}

/// Delete a mutex.
///
/// Any inheritance boost on the owner is reverted first, then every
/// waiter wakes with `ObjectDeleted` and the slot returns to the pool.
pub fn mutex_delete(mutex: MutexHandle) -> KernelResult<()> {
    if is_isr_context() {
        return Err(KernelError::IsrContext);
    }

    {
        let _cs = CriticalSection::enter();
        let mcb = unsafe { &mut *mutex.as_ptr() };

        unsafe {
            restore_inherited_priority(mcb);
            wait::wake_all(&mut mcb.waiting_tasks, WakeReason::Signal);
        }
        mcb.owner = core::ptr::null_mut();
    }

    mem::free_mcb(mutex);

    Ok(())
}

/// Acquire the mutex, blocking up to `timeout` ticks.
///
/// Blocking evaluates priority inheritance: the owner is boosted to the
/// highest waiter priority if that is above its own. Release does not
/// transfer ownership; a woken waiter re-acquires through the free fast
/// path.
///
/// # Errors
/// * `Recursive` - the caller already owns the mutex
/// * `Timeout` - not acquired within the deadline (or `NO_WAIT` and held)
/// * `ObjectDeleted` - the mutex was deleted while blocked
pub fn mutex_lock(mutex: MutexHandle, timeout: Tick) -> KernelResult<()> {
    if timeout != NO_WAIT {
        if is_isr_context() {
            return Err(KernelError::IsrContext);
        }
        if !KERNEL.is_running() {
            return Err(KernelError::NotRunning);
        }
    }

    let deadline = time::now().wrapping_add(timeout);

    loop {
        {
            let _cs = CriticalSection::enter();
            let mcb = unsafe { &mut *mutex.as_ptr() };

            let Some(cur) = kernel::current_tcb() else {
                return Err(KernelError::NotRunning);
            };

            if mcb.owner.is_null() {
                mcb.owner = cur.as_ptr();
                return Ok(());
            }

            if mcb.owner == cur.as_ptr() {
                return Err(KernelError::Recursive);
            }

            if timeout == NO_WAIT {
                return Err(KernelError::Timeout);
            }

            if KERNEL.sched_lock_nesting() > 0 {
                return Err(KernelError::SchedulerLocked);
            }

            let wake_tick = match wait::arm_deadline(timeout, deadline)? {
                Armed::Forever => None,
                Armed::At(tick) => Some(tick),
            };

            unsafe {
                wait::block_current(&mut mcb.waiting_tasks, wake_tick);
                apply_priority_inheritance(mcb);
            }
        }

        sched::schedule();

        match wait::current_wake_reason() {
            WakeReason::Timeout => return Err(KernelError::Timeout),
            WakeReason::Signal => return Err(KernelError::ObjectDeleted),
            // Owner released: retry, the free fast path acquires
            _ => {}
        }
    }
}

/// `mutex_lock` with no blocking.
pub fn mutex_try_lock(mutex: MutexHandle) -> KernelResult<()> {
    mutex_lock(mutex, NO_WAIT)
}

/// Release the mutex.
///
/// Reverts any inheritance boost, clears ownership, and wakes the first
/// waiter; that task becomes the prospective next owner when it
/// re-enters `mutex_lock`.
///
/// # Errors
/// * `NotOwner` - the caller does not hold the mutex
pub fn mutex_unlock(mutex: MutexHandle) -> KernelResult<()> {
    if is_isr_context() {
        return Err(KernelError::IsrContext);
    }

    let _cs = CriticalSection::enter();
    let mcb = unsafe { &mut *mutex.as_ptr() };

    let Some(cur) = kernel::current_tcb() else {
        return Err(KernelError::NotRunning);
    };

    if mcb.owner != cur.as_ptr() {
        return Err(KernelError::NotOwner);
    }

    unsafe { restore_inherited_priority(mcb) };
    mcb.owner = core::ptr::null_mut();

    unsafe { wait::wake_one(&mut mcb.waiting_tasks, WakeReason::DataAvailable) };

    Ok(())
}

/// Task currently holding the mutex
pub fn mutex_get_owner(mutex: MutexHandle) -> Option<TaskHandle> {
    let _cs = CriticalSection::enter();
    NonNull::new(unsafe { mutex.as_ref() }.owner)
}

/// Check if the mutex is held
pub fn mutex_is_locked(mutex: MutexHandle) -> bool {
    let _cs = CriticalSection::enter();
    !unsafe { mutex.as_ref() }.owner.is_null()
}

/// Check if any task is blocked on the mutex
pub fn mutex_has_waiting_tasks(mutex: MutexHandle) -> bool {
    let _cs = CriticalSection::enter();
    !unsafe { mutex.as_ref() }.waiting_tasks.is_empty()
}

// ============ Priority inheritance ============

/// Boost the owner to the highest waiter priority when a waiter outranks
/// it, snapshotting the owner's base priority on the first boost.
///
/// # Safety
/// Caller holds the kernel critical section.
pub(crate) unsafe fn apply_priority_inheritance(mcb: &mut MutexCb) {
    let Some(owner) = NonNull::new(mcb.owner) else {
        return;
    };

    let highest = mcb.waiting_tasks.highest_priority();
    if highest == PRIO_NONE {
        return;
    }

    let owner_ref = unsafe { &mut *owner.as_ptr() };
    if highest < owner_ref.effective_priority {
        if mcb.saved_priority == PRIO_NONE {
            mcb.saved_priority = owner_ref.base_priority;
        }
        unsafe { sched::boost_priority(owner, highest) };
    }
}

/// Revert the owner to the priority saved at the first boost.
///
/// # Safety
/// Caller holds the kernel critical section.
unsafe fn restore_inherited_priority(mcb: &mut MutexCb) {
    if mcb.saved_priority == PRIO_NONE {
        return;
    }

    if let Some(owner) = NonNull::new(mcb.owner) {
        unsafe { sched::restore_priority(owner, mcb.saved_priority) };
    }

    mcb.saved_priority = PRIO_NONE;
}
