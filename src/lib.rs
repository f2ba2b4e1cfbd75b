//! osprey — a preemptive, priority-based real-time kernel for ARM Cortex-M
//!
//! The kernel provides:
//! - Fixed-priority preemptive scheduling with round-robin within a band
//! - Counting/binary semaphores and mutexes with priority inheritance
//! - Bounded message queues backed by a power-of-two ring buffer
//! - Tick-based delays and timeouts that survive counter wrap
//! - Fixed-size pool allocators for every kernel object; no heap
//!
//! The scheduler core is portable. The `port` module supplies the
//! Cortex-M context switch (PendSV), SysTick programming, and the
//! first-task launch; host builds get stub ports so the full test
//! suite runs with `cargo test`.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(test)]
extern crate std;

// ============ Critical Section ============

#[cfg(target_arch = "arm")]
mod cs_impl {
    use cortex_m::interrupt;
    use cortex_m::register::primask;
    use critical_section::{set_impl, Impl, RawRestoreState};

    struct SingleCoreCriticalSection;
    set_impl!(SingleCoreCriticalSection);

    unsafe impl Impl for SingleCoreCriticalSection {
        unsafe fn acquire() -> RawRestoreState {
            let was_active = primask::read().is_active();
            interrupt::disable();
            was_active
        }

        unsafe fn release(was_active: RawRestoreState) {
            if was_active {
                unsafe { interrupt::enable() }
            }
        }
    }
}

// ============ Modules ============

pub mod log;
mod lang_items;

pub mod config;
pub mod critical;
pub mod cs_cell;
pub mod error;
pub mod kernel;
pub mod mem;
pub mod port;
pub mod prio;
pub mod sched;
pub mod sync;
pub mod task;
pub mod time;
pub mod types;

#[cfg(test)]
mod kernel_tests;

// ============ Re-exports ============

pub use error::{KernelError, KernelResult};
pub use types::*;

pub use kernel::{kernel_init, kernel_start, sched_lock, sched_unlock};
pub use task::{
    task_create, task_current, task_delay, task_delete, task_stack_check,
    task_stack_used_bytes, task_yield, TaskFn, TaskHandle, Tcb,
};
pub use time::tick_handler;

pub use sync::queue::{
    queue_create, queue_delete, queue_is_empty, queue_is_full, queue_messages_waiting,
    queue_receive, queue_receive_immediate, queue_send, queue_send_immediate, QueueHandle,
};
pub use sync::sem::{
    sem_create, sem_create_binary, sem_create_counting, sem_delete, sem_get_count,
    sem_has_waiting_tasks, sem_post, sem_try_wait, sem_wait, SemHandle,
};
pub use sync::mutex::{
    mutex_create, mutex_delete, mutex_get_owner, mutex_has_waiting_tasks, mutex_is_locked,
    mutex_lock, mutex_try_lock, mutex_unlock, MutexHandle,
};
