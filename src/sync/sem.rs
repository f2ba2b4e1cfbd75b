//! Counting semaphore
//!
//! Tokens are handed to waiters directly: a post that finds a waiter
//! releases exactly one task and leaves the count untouched, so
//! `count + waiters <= max` holds at all times and a stale count can
//! never shadow a live waiter.

use core::ptr::NonNull;

use crate::config::TASK_NAME_LEN;
use crate::critical::{is_isr_context, CriticalSection};
use crate::error::{KernelError, KernelResult};
use crate::kernel::KERNEL;
use crate::mem;
use crate::sync::wait::{self, Armed, WaitList};
use crate::time;
use crate::types::{Tick, WakeReason, NO_WAIT};

/// Semaphore control block
#[repr(C)]
pub struct SemCb {
    pub(crate) count: u32,
    pub(crate) max_count: u32,
    pub(crate) waiting_tasks: WaitList,
    name: [u8; TASK_NAME_LEN],
}

impl SemCb {
    pub const fn new() -> Self {
        SemCb {
            count: 0,
            max_count: 0,
            waiting_tasks: WaitList::new(),
            name: [0; TASK_NAME_LEN],
        }
    }

    /// Semaphore name as a string slice
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}

/// Opaque semaphore handle
pub type SemHandle = NonNull<SemCb>;

/// Create a counting semaphore.
///
/// Rejects `max == 0` and `initial > max`. Returns `None` on invalid
/// parameters or pool exhaustion.
pub fn sem_create(initial: u32, max: u32, name: &str) -> Option<SemHandle> {
    if max == 0 || initial > max {
        return None;
    }

    if is_isr_context() {
        return None;
    }

    let scb = mem::alloc_scb()?;

    unsafe {
        scb.as_ptr().write(SemCb::new());

        let scb_ref = &mut *scb.as_ptr();
        scb_ref.count = initial;
        scb_ref.max_count = max;

        let bytes = name.as_bytes();
        let len = bytes.len().min(TASK_NAME_LEN - 1);
        scb_ref.name[..len].copy_from_slice(&bytes[..len]);
    }

    Some(scb)
}

/// Binary semaphore: one token, initially available.
pub fn sem_create_binary(name: &str) -> Option<SemHandle> {
    sem_create(1, 1, name)
}

/// Counting semaphore with no tokens initially available.
pub fn sem_create_counting(max: u32, name: &str) -> Option<SemHandle> {
    sem_create(0, max, name)
}

/// Delete a semaphore, waking every waiter with `ObjectDeleted`.
pub fn sem_delete(sem: SemHandle) -> KernelResult<()> {
    if is_isr_context() {
        return Err(KernelError::IsrContext);
    }

    {
        let _cs = CriticalSection::enter();
        let scb = unsafe { &mut *sem.as_ptr() };
        unsafe { wait::wake_all(&mut scb.waiting_tasks, WakeReason::Signal) };
    }

    mem::free_scb(sem);

    Ok(())
}

/// Take one token, blocking up to `timeout` ticks while none is
/// available.
///
/// # Errors
/// * `Timeout` - no token within the deadline (or `NO_WAIT` and count 0)
/// * `ObjectDeleted` - the semaphore was deleted while blocked
pub fn sem_wait(sem: SemHandle, timeout: Tick) -> KernelResult<()> {
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
            let scb = unsafe { &mut *sem.as_ptr() };

            if scb.count > 0 {
                scb.count -= 1;
                return Ok(());
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

            unsafe { wait::block_current(&mut scb.waiting_tasks, wake_tick) };
        }

        crate::sched::schedule();

        match wait::current_wake_reason() {
            // The posting task handed its token over directly
            WakeReason::DataAvailable => return Ok(()),
            WakeReason::Timeout => return Err(KernelError::Timeout),
            WakeReason::Signal => return Err(KernelError::ObjectDeleted),
            WakeReason::None => {}
        }
    }
}

/// `sem_wait` with no blocking.
pub fn sem_try_wait(sem: SemHandle) -> KernelResult<()> {
    sem_wait(sem, NO_WAIT)
}

/// Release one token.
///
/// With waiters present, the first one receives the token directly and
/// the count stays unchanged. Otherwise the count increments up to the
/// maximum.
///
/// # Errors
/// * `Overflow` - count already at maximum with no waiters
pub fn sem_post(sem: SemHandle) -> KernelResult<()> {
    let _cs = CriticalSection::enter();
    let scb = unsafe { &mut *sem.as_ptr() };

    if unsafe { wait::wake_one(&mut scb.waiting_tasks, WakeReason::DataAvailable) }.is_some() {
        return Ok(());
    }

    if scb.count < scb.max_count {
        scb.count += 1;
        return Ok(());
    }

    Err(KernelError::Overflow)
}

/// Current token count
pub fn sem_get_count(sem: SemHandle) -> u32 {
    let _cs = CriticalSection::enter();
    unsafe { sem.as_ref() }.count
}

/// Check if any task is blocked on the semaphore
pub fn sem_has_waiting_tasks(sem: SemHandle) -> bool {
    let _cs = CriticalSection::enter();
    !unsafe { sem.as_ref() }.waiting_tasks.is_empty()
}
