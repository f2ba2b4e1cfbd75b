//! Task management
//!
//! Task creation, deletion, delays, and yielding. TCBs and stacks come
//! from the kernel pools; a stack request is rounded up to the smallest
//! size class that fits. Deletion of the running task is deferred: the
//! task cannot free the stack it is executing on, so the idle task
//! reclaims the slots afterwards.

pub(crate) mod tcb;

pub use tcb::{TaskFn, Tcb};

use core::ptr::NonNull;

use crate::config::{DEFAULT_STACK_SIZE, MAX_PRIORITY, MAX_TASKS};
use crate::critical::{critical_section, is_isr_context, CriticalSection};
use crate::error::{KernelError, KernelResult};
use crate::kernel::{self, KERNEL};
use crate::mem;
use crate::port;
use crate::sched;
use crate::time;
use crate::types::{Prio, TaskState, Tick};

/// Opaque task handle
pub type TaskHandle = NonNull<Tcb>;

/// Create a task and make it ready.
///
/// `stack_size` is in bytes and is rounded up to the smallest stack
/// class that fits; 0 selects the default class. Returns `None` when
/// validation fails or a pool is exhausted.
pub fn task_create(
    function: TaskFn,
    name: &str,
    stack_size: usize,
    param: *mut (),
    priority: Prio,
) -> Option<TaskHandle> {
    if name.is_empty() || priority > MAX_PRIORITY {
        return None;
    }

    if !KERNEL.is_initialized() || is_isr_context() {
        return None;
    }

    let stack_size = if stack_size == 0 {
        DEFAULT_STACK_SIZE
    } else {
        stack_size
    };

    create_internal(function, name, stack_size, param, priority)
}

/// Pool-backed task construction, shared with the idle task.
pub(crate) fn create_internal(
    function: TaskFn,
    name: &str,
    stack_size: usize,
    param: *mut (),
    priority: Prio,
) -> Option<NonNull<Tcb>> {
    let tcb = mem::alloc_tcb()?;

    let Some((stack_base, actual_size)) = mem::alloc_stack(stack_size) else {
        mem::free_tcb(tcb);
        return None;
    };

    unsafe {
        tcb.as_ptr().write(Tcb::new());

        let tcb_ref = &mut *tcb.as_ptr();
        tcb_ref.set_name(name);
        tcb_ref.base_priority = priority;
        tcb_ref.effective_priority = priority;
        tcb_ref.stack_base = stack_base.as_ptr();
        tcb_ref.stack_size = actual_size;
        tcb_ref.stack_pointer =
            port::task_stack_init(function, param, stack_base.as_ptr(), actual_size / 4);
    }

    critical_section(|_cs| unsafe { sched::add_task(tcb) });

    crate::trace!("task created at prio {}", priority);

    Some(tcb)
}

/// Delete a task and return its slots to the pools.
///
/// Deleting the idle task is a no-op. A task still blocked on a sync
/// object is refused; resolve the wait (or delete the object) first.
/// When a task deletes itself the stack and TCB are reclaimed later by
/// the idle task.
pub fn task_delete(task: TaskHandle) -> KernelResult<()> {
    if is_isr_context() {
        return Err(KernelError::IsrContext);
    }

    if kernel::idle_tcb() == Some(task) {
        return Ok(());
    }

    let deleting_self = {
        let _cs = CriticalSection::enter();

        let tcb_ref = unsafe { &mut *task.as_ptr() };

        if tcb_ref.is_waiting_on_object() {
            return Err(KernelError::TaskBlocked);
        }

        let is_current = kernel::current_tcb() == Some(task);
        if is_current && KERNEL.sched_lock_nesting() > 0 {
            return Err(KernelError::SchedulerLocked);
        }

        unsafe { sched::remove_task(task) };
        tcb_ref.state = TaskState::Deleted;

        if !is_current {
            if !tcb_ref.stack_base.is_null() {
                mem::free_stack(tcb_ref.stack_base);
                tcb_ref.stack_base = core::ptr::null_mut();
            }
            mem::free_tcb(task);
        }

        is_current
    };

    if deleting_self {
        // Slots are reclaimed by the idle task; this never runs again
        sched::schedule();
    }

    Ok(())
}

/// Delay the calling task for `ticks` system ticks.
pub fn task_delay(ticks: Tick) -> KernelResult<()> {
    time::delay(ticks)
}

/// Give up the CPU, re-queueing at the tail of the current band.
pub fn task_yield() -> KernelResult<()> {
    if !KERNEL.is_running() {
        return Err(KernelError::NotRunning);
    }

    if is_isr_context() {
        return Err(KernelError::IsrContext);
    }

    if KERNEL.sched_lock_nesting() > 0 {
        return Err(KernelError::SchedulerLocked);
    }

    {
        let _cs = CriticalSection::enter();
        if let Some(cur) = kernel::current_tcb() {
            let cur_ref = unsafe { cur.as_ref() };
            if cur_ref.state == TaskState::Running {
                unsafe { sched::add_task(cur) };
            }
        }
    }

    sched::schedule();

    Ok(())
}

/// Handle of the currently running task
#[inline]
pub fn task_current() -> Option<TaskHandle> {
    kernel::current_tcb()
}

/// Bytes of the task's stack below its saved stack pointer.
pub fn task_stack_used_bytes(task: TaskHandle) -> usize {
    critical_section(|_cs| {
        let tcb_ref = unsafe { task.as_ref() };
        if tcb_ref.stack_base.is_null() || tcb_ref.stack_pointer.is_null() {
            return 0;
        }

        let top = tcb_ref.stack_base as usize + tcb_ref.stack_size;
        top.saturating_sub(tcb_ref.stack_pointer as usize)
    })
}

/// Check that the task's saved stack pointer is still within bounds.
pub fn task_stack_check(task: TaskHandle) -> bool {
    let used = task_stack_used_bytes(task);
    critical_section(|_cs| {
        let tcb_ref = unsafe { task.as_ref() };
        used <= tcb_ref.stack_size
            && (tcb_ref.stack_pointer as usize) >= (tcb_ref.stack_base as usize)
    })
}

/// Return the stack and TCB slots of self-deleted tasks to their pools.
///
/// Called by the idle task. Skips the current task: a task that just
/// deleted itself remains current until the context switch completes.
pub(crate) fn reap_deleted_tasks() {
    for index in 0..MAX_TASKS {
        let _cs = CriticalSection::enter();

        unsafe {
            if !mem::tcb_slot_in_use(index) {
                continue;
            }

            let tcb = mem::tcb_slot_ptr(index);
            if (*tcb).state != TaskState::Deleted {
                continue;
            }

            if kernel::current_tcb().map(|cur| cur.as_ptr()) == Some(tcb) {
                continue;
            }

            if !(*tcb).stack_base.is_null() {
                mem::free_stack((*tcb).stack_base);
                (*tcb).stack_base = core::ptr::null_mut();
            }

            mem::free_tcb(NonNull::new_unchecked(tcb));
        }
    }
}
