//! Message queue
//!
//! Bounded FIFO of fixed-size items with blocking send and receive. The
//! control block and the item buffer both come from kernel pools; the
//! buffer class is the smallest one fitting the rounded ring capacity.
//!
//! Items are strictly FIFO and so are blocked peers: if two senders are
//! waiting on a full queue, the one that blocked first is released
//! first when a slot frees.

use core::ptr::NonNull;

use crate::critical::{is_isr_context, CriticalSection};
use crate::error::{KernelError, KernelResult};
use crate::kernel::KERNEL;
use crate::mem;
use crate::sync::ringbuf::RingBuffer;
use crate::sync::wait::{self, Armed, WaitList};
use crate::time;
use crate::types::{Tick, WakeReason, NO_WAIT};

/// Queue control block
#[repr(C)]
pub struct QueueCb {
    pub(crate) ring: RingBuffer,
    pub(crate) waiting_senders: WaitList,
    pub(crate) waiting_receivers: WaitList,
}

impl QueueCb {
    pub const fn new() -> Self {
        QueueCb {
            ring: RingBuffer::new(),
            waiting_senders: WaitList::new(),
            waiting_receivers: WaitList::new(),
        }
    }
}

/// Opaque queue handle
pub type QueueHandle = NonNull<QueueCb>;

/// Create a queue of `length` items of `item_size` bytes each.
///
/// The capacity is rounded up to a power of two; the backing buffer is
/// taken from the smallest buffer class that holds the rounded capacity.
/// Returns `None` on invalid parameters, pool exhaustion, or a buffer
/// request beyond the largest class.
pub fn queue_create(length: usize, item_size: usize) -> Option<QueueHandle> {
    if length == 0 || item_size == 0 {
        return None;
    }

    if is_isr_context() {
        return None;
    }

    let qcb = mem::alloc_qcb()?;

    let Some(buffer) = mem::alloc_queue_buffer(RingBuffer::storage_bytes(length, item_size))
    else {
        mem::free_qcb(qcb);
        return None;
    };

    unsafe {
        qcb.as_ptr().write(QueueCb::new());
        (*qcb.as_ptr()).ring.init(buffer, length, item_size);
    }

    Some(qcb)
}

/// Delete a queue, waking every blocked sender and receiver.
///
/// Woken waiters see `ObjectDeleted`. The buffer and the control block
/// go back to their pools; the handle must not be used afterwards.
pub fn queue_delete(queue: QueueHandle) -> KernelResult<()> {
    if is_isr_context() {
        return Err(KernelError::IsrContext);
    }

    let buffer = {
        let _cs = CriticalSection::enter();
        let qcb = unsafe { &mut *queue.as_ptr() };

        unsafe {
            wait::wake_all(&mut qcb.waiting_senders, WakeReason::Signal);
            wait::wake_all(&mut qcb.waiting_receivers, WakeReason::Signal);
        }

        qcb.ring.storage()
    };

    mem::free_queue_buffer(buffer);
    mem::free_qcb(queue);

    Ok(())
}

/// Send one item, blocking up to `timeout` ticks while the queue is full.
///
/// `item` must be exactly the queue's item size. A waiting receiver is
/// released when the copy lands.
///
/// # Errors
/// * `Full` - queue full and `timeout` was `NO_WAIT`
/// * `Timeout` - the deadline passed before a slot freed
/// * `ObjectDeleted` - the queue was deleted while blocked
/// * `Null` - item slice of the wrong size
pub fn queue_send(queue: QueueHandle, item: &[u8], timeout: Tick) -> KernelResult<()> {
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
            let qcb = unsafe { &mut *queue.as_ptr() };

            if item.len() != qcb.ring.element_size() {
                return Err(KernelError::Null);
            }

            if qcb.ring.put(item) {
                unsafe { wait::wake_one(&mut qcb.waiting_receivers, WakeReason::DataAvailable) };
                return Ok(());
            }

            if timeout == NO_WAIT {
                return Err(KernelError::Full);
            }

            if KERNEL.sched_lock_nesting() > 0 {
                return Err(KernelError::SchedulerLocked);
            }

            let wake_tick = match wait::arm_deadline(timeout, deadline)? {
                Armed::Forever => None,
                Armed::At(tick) => Some(tick),
            };

            unsafe { wait::block_current(&mut qcb.waiting_senders, wake_tick) };
        }

        crate::sched::schedule();

        match wait::current_wake_reason() {
            WakeReason::Timeout => return Err(KernelError::Timeout),
            WakeReason::Signal => return Err(KernelError::ObjectDeleted),
            // Slot freed: retry the fast path, another sender may have
            // taken it first
            _ => {}
        }
    }
}

/// Receive one item, blocking up to `timeout` ticks while the queue is
/// empty.
///
/// A waiting sender is released once the slot frees.
///
/// # Errors
/// * `Empty` - queue empty and `timeout` was `NO_WAIT`
/// * `Timeout` - the deadline passed before an item arrived
/// * `ObjectDeleted` - the queue was deleted while blocked
/// * `Null` - item slice of the wrong size
pub fn queue_receive(queue: QueueHandle, item: &mut [u8], timeout: Tick) -> KernelResult<()> {
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
            let qcb = unsafe { &mut *queue.as_ptr() };

            if item.len() != qcb.ring.element_size() {
                return Err(KernelError::Null);
            }

            if qcb.ring.get(item) {
                unsafe { wait::wake_one(&mut qcb.waiting_senders, WakeReason::DataAvailable) };
                return Ok(());
            }

            if timeout == NO_WAIT {
                return Err(KernelError::Empty);
            }

            if KERNEL.sched_lock_nesting() > 0 {
                return Err(KernelError::SchedulerLocked);
            }

            let wake_tick = match wait::arm_deadline(timeout, deadline)? {
                Armed::Forever => None,
                Armed::At(tick) => Some(tick),
            };

            unsafe { wait::block_current(&mut qcb.waiting_receivers, wake_tick) };
        }

        crate::sched::schedule();

        match wait::current_wake_reason() {
            WakeReason::Timeout => return Err(KernelError::Timeout),
            WakeReason::Signal => return Err(KernelError::ObjectDeleted),
            // Item arrived: retry the fast path, another receiver may
            // have taken it first
            _ => {}
        }
    }
}

/// `queue_send` with no blocking.
pub fn queue_send_immediate(queue: QueueHandle, item: &[u8]) -> KernelResult<()> {
    queue_send(queue, item, NO_WAIT)
}

/// `queue_receive` with no blocking.
pub fn queue_receive_immediate(queue: QueueHandle, item: &mut [u8]) -> KernelResult<()> {
    queue_receive(queue, item, NO_WAIT)
}

/// Check if the queue holds no items
pub fn queue_is_empty(queue: QueueHandle) -> bool {
    let _cs = CriticalSection::enter();
    unsafe { queue.as_ref() }.ring.is_empty()
}

/// Check if the queue is at capacity
pub fn queue_is_full(queue: QueueHandle) -> bool {
    let _cs = CriticalSection::enter();
    unsafe { queue.as_ref() }.ring.is_full()
}

/// Number of items currently queued
pub fn queue_messages_waiting(queue: QueueHandle) -> usize {
    let _cs = CriticalSection::enter();
    unsafe { queue.as_ref() }.ring.len()
}

