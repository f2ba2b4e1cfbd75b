//! Port layer - CPU-specific implementations
//!
//! Everything the scheduler needs from the hardware: the context-switch
//! trigger, the first-task launch, the tick source, the stack frame a
//! fresh task starts from, and the idle low-power hint.

#[cfg(target_arch = "arm")]
pub mod cortex_m4;

#[cfg(target_arch = "arm")]
pub use cortex_m4::*;

// Stub implementations for non-ARM targets (for host testing)
#[cfg(not(target_arch = "arm"))]
pub mod stub {
    use crate::task::TaskFn;

    /// Program the tick source. No-op on the host; tests drive
    /// [`tick_handler`](crate::time::tick_handler) directly.
    pub fn tick_init(_hz: u32) {}

    /// Request a context switch. No-op on the host: tests observe the
    /// scheduler's next-task choice instead of switching.
    pub fn trigger_context_switch() {}

    /// Hand the CPU to the first task. Not available on the host.
    pub fn start_first_task() -> ! {
        panic!("start_first_task is not available on this platform");
    }

    /// Synthesize the initial stack frame.
    ///
    /// The host runs no task code, so the saved stack pointer is simply
    /// the (empty) top of stack.
    ///
    /// # Safety
    /// `stack_base` must point at `stack_words` writable words.
    pub unsafe fn task_stack_init(
        _entry: TaskFn,
        _param: *mut (),
        stack_base: *mut u32,
        stack_words: usize,
    ) -> *mut u32 {
        unsafe { stack_base.add(stack_words) }
    }

    /// Low-power hint for the idle task. No-op on the host.
    pub fn wait_for_interrupt() {}
}

#[cfg(not(target_arch = "arm"))]
pub use stub::*;
