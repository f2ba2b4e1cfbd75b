//! Global kernel state and entry points
//!
//! Owns the kernel flags (initialized/running, tick counter, scheduler
//! lock), the current/next task pointers shared with the context-switch
//! handler, and the idle task. `kernel_init` wires everything up;
//! `kernel_start` hands the CPU to the first task and never returns.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use crate::config::{IDLE_PRIO, SMALL_STACK_SIZE, TICK_RATE_HZ};
use crate::critical::{critical_section, is_isr_context, CriticalSection};
use crate::cs_cell::CsCell;
use crate::error::{KernelError, KernelResult};
use crate::port;
use crate::sched;
use crate::task::{self, Tcb};
use crate::types::{TaskState, Tick};

// ============ Kernel flags ============

/// Atomic kernel flags
pub struct KernelFlags {
    initialized: AtomicBool,
    running: AtomicBool,
    int_nesting: AtomicU8,
    sched_lock_nesting: AtomicU8,
    tick_counter: AtomicU32,
}

impl KernelFlags {
    const fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
            int_nesting: AtomicU8::new(0),
            sched_lock_nesting: AtomicU8::new(0),
            tick_counter: AtomicU32::new(0),
        }
    }

    pub(crate) fn reset(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.int_nesting.store(0, Ordering::SeqCst);
        self.sched_lock_nesting.store(0, Ordering::SeqCst);
        self.tick_counter.store(0, Ordering::SeqCst);
    }

    /// Check if the kernel is running
    #[inline(always)]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Check if the kernel is initialized
    #[inline(always)]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Current tick count
    #[inline(always)]
    pub fn tick_get(&self) -> Tick {
        self.tick_counter.load(Ordering::Relaxed)
    }

    /// Advance the tick counter and return the new value
    #[inline(always)]
    pub(crate) fn tick_increment(&self) -> Tick {
        self.tick_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    #[cfg(test)]
    pub(crate) fn tick_set(&self, tick: Tick) {
        self.tick_counter.store(tick, Ordering::Relaxed);
    }

    /// Interrupt nesting depth
    #[inline(always)]
    pub fn int_nesting(&self) -> u8 {
        self.int_nesting.load(Ordering::Relaxed)
    }

    /// Note ISR entry
    #[inline(always)]
    pub(crate) fn int_enter(&self) {
        let nesting = self.int_nesting.load(Ordering::Relaxed);
        self.int_nesting.store(nesting.saturating_add(1), Ordering::Relaxed);
    }

    /// Note ISR exit
    #[inline(always)]
    pub(crate) fn int_exit(&self) {
        let nesting = self.int_nesting.load(Ordering::Relaxed);
        self.int_nesting.store(nesting.saturating_sub(1), Ordering::Relaxed);
    }

    /// Scheduler lock nesting depth
    #[inline(always)]
    pub fn sched_lock_nesting(&self) -> u8 {
        self.sched_lock_nesting.load(Ordering::SeqCst)
    }

    pub(crate) fn try_sched_lock(&self) -> KernelResult<()> {
        let nesting = self.sched_lock_nesting.load(Ordering::SeqCst);
        if nesting == u8::MAX {
            return Err(KernelError::Overflow);
        }
        self.sched_lock_nesting.store(nesting + 1, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn try_sched_unlock(&self) -> KernelResult<()> {
        let nesting = self.sched_lock_nesting.load(Ordering::SeqCst);
        if nesting == 0 {
            return Err(KernelError::NotLocked);
        }
        self.sched_lock_nesting.store(nesting - 1, Ordering::SeqCst);
        Ok(())
    }

    #[inline(always)]
    pub(crate) fn set_initialized(&self, val: bool) {
        self.initialized.store(val, Ordering::SeqCst);
    }

    #[inline(always)]
    pub(crate) fn set_running(&self, val: bool) {
        self.running.store(val, Ordering::SeqCst);
    }
}

/// Global kernel flags instance
pub(crate) static KERNEL: KernelFlags = KernelFlags::new();

// ============ CPU hand-off state ============

/// Current/next task pointers shared with the context-switch handler.
///
/// The port's switch handler saves the outgoing stack pointer through
/// `tcb_cur`, copies `tcb_next` into it, and restores from the new TCB.
#[repr(C)]
pub struct CpuState {
    /// TCB of the task owning the CPU; null before the first switch
    pub tcb_cur: *mut Tcb,
    /// TCB the scheduler wants on the CPU next
    pub tcb_next: *mut Tcb,
}

impl CpuState {
    pub const fn new() -> Self {
        Self {
            tcb_cur: core::ptr::null_mut(),
            tcb_next: core::ptr::null_mut(),
        }
    }
}

/// Global CPU hand-off state, referenced by the PendSV handler
#[no_mangle]
#[used]
pub static mut CPU_STATE: CpuState = CpuState::new();

/// TCB of the currently running task
#[inline]
pub(crate) fn current_tcb() -> Option<NonNull<Tcb>> {
    unsafe { NonNull::new((*(&raw mut CPU_STATE)).tcb_cur) }
}

/// Set the current-task pointer
#[inline]
pub(crate) fn set_current_tcb(tcb: Option<NonNull<Tcb>>) {
    unsafe {
        (*(&raw mut CPU_STATE)).tcb_cur = tcb.map_or(core::ptr::null_mut(), |p| p.as_ptr());
    }
}

/// TCB the scheduler picked to run next
#[cfg(test)]
#[inline]
pub(crate) fn next_tcb() -> Option<NonNull<Tcb>> {
    unsafe { NonNull::new((*(&raw mut CPU_STATE)).tcb_next) }
}

/// Set the next-task pointer
#[inline]
pub(crate) fn set_next_tcb(tcb: Option<NonNull<Tcb>>) {
    unsafe {
        (*(&raw mut CPU_STATE)).tcb_next = tcb.map_or(core::ptr::null_mut(), |p| p.as_ptr());
    }
}

// ============ Idle task ============

static IDLE: CsCell<*mut Tcb> = CsCell::new(core::ptr::null_mut());

/// TCB of the idle task, once created
#[inline]
pub(crate) fn idle_tcb() -> Option<NonNull<Tcb>> {
    unsafe { NonNull::new(*IDLE.get_unchecked()) }
}

/// Idle task body.
///
/// Reclaims the slots of self-deleted tasks, naps when nothing else is
/// ready, and otherwise gets out of the way. Never blocks on a sync
/// object and is never deleted, so the scheduler always has a ready
/// task to fall back on.
fn idle_task(_arg: *mut ()) -> ! {
    loop {
        task::reap_deleted_tasks();

        {
            let _cs = CriticalSection::enter();
            if unsafe { sched::no_ready_tasks() } {
                port::wait_for_interrupt();
            }
        }

        let _ = task::task_yield();
    }
}

// ============ Public API ============

/// Initialize the kernel: pools, scheduler, idle task.
///
/// Must be called before any other kernel function. Idempotent; repeated
/// calls after the first are no-ops. Failing to create the idle task is
/// unrecoverable and falls into a fault loop.
pub fn kernel_init() {
    if KERNEL.is_initialized() {
        return;
    }

    crate::mem::pools_init();
    sched::init();

    critical_section(|_cs| {
        set_current_tcb(None);
        set_next_tcb(None);
    });

    let Some(idle) =
        task::create_internal(idle_task, "idle", SMALL_STACK_SIZE, core::ptr::null_mut(), IDLE_PRIO)
    else {
        fault_loop();
    };

    critical_section(|cs| {
        *IDLE.get(cs) = idle.as_ptr();
    });

    KERNEL.set_initialized(true);
    crate::info!("kernel initialized");
}

/// Start multitasking. Never returns.
///
/// Programs the tick source, picks the highest-priority ready task, and
/// hands the CPU over through the port. Calling without `kernel_init`
/// first is unrecoverable.
pub fn kernel_start() -> ! {
    if !KERNEL.is_initialized() || KERNEL.is_running() {
        fault_loop();
    }

    critical_section(|_cs| unsafe {
        let Some(first) = sched::get_next_task().or_else(idle_tcb) else {
            fault_loop();
        };

        let first_ref = &mut *first.as_ptr();
        first_ref.state = TaskState::Running;
        first_ref.run_count = first_ref.run_count.wrapping_add(1);

        // The switch handler skips the save half when tcb_cur is null,
        // so the first restore lands directly in the first task.
        set_current_tcb(None);
        set_next_tcb(Some(first));
    });

    KERNEL.set_running(true);
    crate::info!("kernel starting");

    port::tick_init(TICK_RATE_HZ);
    port::start_first_task()
}

/// Lock the scheduler, keeping the current task on the CPU.
///
/// Nests; preemption and yields resume once every lock is released.
pub fn sched_lock() -> KernelResult<()> {
    if !KERNEL.is_running() {
        return Err(KernelError::NotRunning);
    }

    if is_isr_context() {
        return Err(KernelError::IsrContext);
    }

    critical_section(|_cs| KERNEL.try_sched_lock())
}

/// Release one scheduler lock level.
pub fn sched_unlock() -> KernelResult<()> {
    if !KERNEL.is_running() {
        return Err(KernelError::NotRunning);
    }

    if is_isr_context() {
        return Err(KernelError::IsrContext);
    }

    critical_section(|_cs| KERNEL.try_sched_unlock())
}

/// Unrecoverable kernel fault: park the CPU.
fn fault_loop() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

// ============ Test support ============

/// Tear the kernel down to its pre-`kernel_init` state.
#[cfg(test)]
pub(crate) fn reset_for_tests() {
    KERNEL.reset();
    sched::init();
    critical_section(|cs| {
        set_current_tcb(None);
        set_next_tcb(None);
        *IDLE.get(cs) = core::ptr::null_mut();
    });
}
