//! Kernel error types
//!
//! Every fallible entry point returns a typed error; the kernel never
//! panics on bad input. Creation APIs return `Option` handles instead
//! (allocation-style nil), matching the pool allocator underneath.

/// Kernel error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Nil handle or an item buffer of the wrong size
    Null,
    /// Deadline exceeded, or a non-blocking operation could not complete
    Timeout,
    /// Queue full with non-blocking intent
    Full,
    /// Queue empty with non-blocking intent
    Empty,
    /// Semaphore post at max count with no waiters, or a nesting counter
    /// at its limit
    Overflow,
    /// Mutex unlock by a task that does not own it
    NotOwner,
    /// Mutex lock by the task that already owns it
    Recursive,
    /// A blocked wait was woken because the object was deleted
    ObjectDeleted,
    /// Pool exhaustion or a request larger than the largest size class
    AllocationFailed,
    /// The kernel has not been started yet
    NotRunning,
    /// The operation is not allowed from interrupt context
    IsrContext,
    /// The operation would block or reschedule while the scheduler is locked
    SchedulerLocked,
    /// Scheduler unlock without a matching lock
    NotLocked,
    /// A delay of zero ticks was requested
    ZeroDelay,
    /// The task is still blocked on a sync object and cannot be deleted
    TaskBlocked,
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;
