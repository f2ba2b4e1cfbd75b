//! Core type definitions
//!
//! Primitive aliases and the small state enums shared by the scheduler and
//! the synchronization objects.

/// Task priority (0 = highest priority).
pub type Prio = u8;

/// Tick counter type. Counts system ticks since boot modulo 2^32.
pub type Tick = u32;

/// Non-blocking timeout: fail immediately instead of waiting.
pub const NO_WAIT: Tick = 0;

/// Block without a deadline.
pub const WAIT_FOREVER: Tick = 0xFFFF_FFFF;

/// Priority sentinel meaning "no priority recorded". Never a legal
/// scheduling priority.
pub const PRIO_NONE: Prio = 0xFF;

/// Task state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// On the ready queue of its effective priority
    Ready = 0,
    /// The one task currently executing; off all ready queues
    Running = 1,
    /// On a wait-list, a delayed list, or both
    Blocked = 2,
    /// Withheld from scheduling
    Suspended = 3,
    /// Awaiting slot reclamation
    Deleted = 4,
}

/// Why a blocked task was made ready again.
///
/// Written by whoever releases the task, read by the task when it resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WakeReason {
    None = 0,
    /// The peer operation handed over data, a token, or a freed slot
    DataAvailable = 1,
    /// The armed deadline expired first
    Timeout = 2,
    /// The object the task was waiting on was deleted
    Signal = 3,
}
