//! Cortex-M4 port implementation
//!
//! Context switching runs in the PendSV exception at the lowest
//! interrupt priority, so a switch request from task code or an ISR is
//! deferred until no other interrupt is active. SysTick drives the
//! kernel tick.

#![allow(named_asm_labels)]

use core::arch::{asm, naked_asm};

use cortex_m::peripheral::scb::SystemHandler;
use cortex_m::peripheral::syst::SystClkSource;

use crate::config::CPU_CLOCK_HZ;
use crate::task::TaskFn;

/// Interrupt stack for MSP
#[no_mangle]
static mut INTERRUPT_STACK: [u64; 256] = [0xDEADBEEF_DEADBEEF; 256];

/// Program SysTick to fire `hz` times per second.
pub fn tick_init(hz: u32) {
    let reload = CPU_CLOCK_HZ / hz;

    let mut p = unsafe { cortex_m::Peripherals::steal() };
    p.SYST.set_reload(reload - 1);
    p.SYST.clear_current();
    p.SYST.set_clock_source(SystClkSource::Core);
    p.SYST.enable_interrupt();
    p.SYST.enable_counter();
}

/// Request a context switch at the next interrupt-priority opportunity.
#[inline(always)]
pub fn trigger_context_switch() {
    cortex_m::peripheral::SCB::set_pendsv();
}

/// Hand the CPU to the task in `CPU_STATE.tcb_next`. Never returns.
///
/// PendSV and SysTick drop to the lowest interrupt priority, the MSP
/// moves to the dedicated interrupt stack, and the pended PendSV
/// performs the first restore. `tcb_cur` is null at this point, so the
/// handler skips the save half and the abandoned main stack is never
/// touched again.
pub fn start_first_task() -> ! {
    unsafe {
        let mut scb = cortex_m::Peripherals::steal().SCB;
        scb.set_priority(SystemHandler::PendSV, 0xF0);
        scb.set_priority(SystemHandler::SysTick, 0xF0);

        let msp_top = (&raw const INTERRUPT_STACK) as u32
            + core::mem::size_of::<[u64; 256]>() as u32;

        asm!("msr msp, {0}", in(reg) msp_top);
        asm!("msr psp, {0}", in(reg) 0);

        cortex_m::interrupt::enable();
        cortex_m::peripheral::SCB::set_pendsv();
    }

    loop {
        cortex_m::asm::nop();
    }
}

/// Low-power hint used by the idle task.
#[inline(always)]
pub fn wait_for_interrupt() {
    cortex_m::asm::wfi();
}

/// Register frame a suspended task restores from.
///
/// The lower half (R4-R11 plus the EXC_RETURN word) is saved by the
/// PendSV handler; the upper half matches what the CPU pushes on
/// exception entry.
#[repr(C, align(4))]
struct TaskFrame {
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    exc_return: u32,
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
}

const FRAME_WORDS: usize = 17;

/// Pre-push a register frame so the first restore lands the CPU at
/// `entry(param)` in thread mode.
///
/// # Safety
/// `stack_base` must point at `stack_words` writable words that stay
/// alive for the task's lifetime.
pub unsafe fn task_stack_init(
    entry: TaskFn,
    param: *mut (),
    stack_base: *mut u32,
    stack_words: usize,
) -> *mut u32 {
    unsafe {
        let stack_top = stack_base.add(stack_words);
        let aligned = ((stack_top as usize) & !7) as *mut u32;

        let frame = aligned.sub(FRAME_WORDS) as *mut TaskFrame;
        (*frame) = TaskFrame {
            r4: 0,
            r5: 0,
            r6: 0,
            r7: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            exc_return: 0xFFFF_FFFD,
            r0: param as u32,
            r1: 0,
            r2: 0,
            r3: 0,
            r12: 0,
            lr: 0,
            pc: (entry as usize as u32) | 1,
            xpsr: 0x0100_0000,
        };

        // One word below the frame, matching the save/restore offset in
        // the PendSV handler
        (frame as *mut u32).sub(1)
    }
}

/// Swap the current/next TCB pointers and return the stack pointer to
/// restore from. Called from the PendSV handler.
#[inline(never)]
#[no_mangle]
unsafe extern "C" fn pendsv_switch_context(cur_sp: *mut u32) -> *mut u32 {
    unsafe {
        let cpu = &raw mut crate::kernel::CPU_STATE;

        let cur_tcb = (*cpu).tcb_cur;
        if !cur_tcb.is_null() {
            (*cur_tcb).stack_pointer = cur_sp;
        }

        (*cpu).tcb_cur = (*cpu).tcb_next;

        let new_tcb = (*cpu).tcb_cur;
        if new_tcb.is_null() {
            core::ptr::null_mut()
        } else {
            (*new_tcb).stack_pointer
        }
    }
}

/// PendSV exception handler - performs the full context switch
///
/// 1. Save R4-R11, LR to the outgoing task's PSP (skipped for the first
///    switch, when `tcb_cur` is null)
/// 2. Swap the TCB pointers in `pendsv_switch_context`
/// 3. Restore R4-R11, LR from the incoming task's stack
/// 4. Exception return into the new task
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    use crate::kernel::CPU_STATE;

    naked_asm!(
        "cpsid i",
        "dsb",
        "isb",

        "mrs r0, psp",

        "ldr r1, ={cpu_state}",
        "ldr r1, [r1]",
        "cbz r1, 1f",

        "stmdb r0!, {{r4-r11, lr}}",

        "sub r0, r0, #4",

        "1:",
        "bl pendsv_switch_context",

        "cbz r0, 2f",
        "add r0, r0, #4",
        "ldmia r0!, {{r4-r11, lr}}",

        "msr psp, r0",

        "2:",
        "cpsie i",
        "dsb",
        "isb",

        "bx lr",

        cpu_state = sym CPU_STATE,
    );
}
