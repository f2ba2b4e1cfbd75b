//! Compile-time configuration
//!
//! These constants fix the resource envelope of the kernel. Everything the
//! kernel hands out at runtime comes from pools sized here; there is no
//! dynamic allocation after `kernel_init`.

use crate::types::Prio;

/// Lowest (numerically largest) task priority. 0 is the highest priority.
pub const MAX_PRIORITY: Prio = 7;

/// Number of priority bands.
pub const PRIO_COUNT: usize = MAX_PRIORITY as usize + 1;

/// Priority of the idle task.
pub const IDLE_PRIO: Prio = MAX_PRIORITY;

/// System tick rate in Hz.
pub const TICK_RATE_HZ: u32 = 1_000;

/// Core clock used to derive the SysTick reload value.
pub const CPU_CLOCK_HZ: u32 = 16_000_000;

/// Task name buffer size (15 characters plus NUL).
pub const TASK_NAME_LEN: usize = 16;

// ============ Pool sizing ============

/// Maximum number of tasks, including the idle task.
pub const MAX_TASKS: usize = 8;

/// Stack size classes in bytes.
pub const SMALL_STACK_SIZE: usize = 512;
pub const DEFAULT_STACK_SIZE: usize = 1024;
pub const LARGE_STACK_SIZE: usize = 2048;

/// Slots per stack size class.
pub const MAX_SMALL_STACKS: usize = 4;
pub const MAX_DEFAULT_STACKS: usize = 6;
pub const MAX_LARGE_STACKS: usize = 2;

/// Maximum number of message queues.
pub const MAX_QUEUES: usize = 4;

/// Queue buffer size classes in bytes.
pub const SMALL_BUFFER_SIZE: usize = 64;
pub const MEDIUM_BUFFER_SIZE: usize = 256;
pub const LARGE_BUFFER_SIZE: usize = 1024;

/// Slots per buffer size class.
pub const MAX_SMALL_BUFFERS: usize = 8;
pub const MAX_MEDIUM_BUFFERS: usize = 4;
pub const MAX_LARGE_BUFFERS: usize = 2;

/// Maximum number of semaphores.
pub const MAX_SEMAPHORES: usize = 8;

/// Maximum number of mutexes.
pub const MAX_MUTEXES: usize = 4;
