//! Time management
//!
//! Wrap-safe tick arithmetic, the tick interrupt entry point, and task
//! delays. All deadline comparisons go through the signed-difference
//! helpers here, which stay correct across a single wrap of the 32-bit
//! tick counter as long as no wait exceeds half the counter range.

use crate::config::TICK_RATE_HZ;
use crate::critical::is_isr_context;
use crate::error::{KernelError, KernelResult};
use crate::kernel::KERNEL;
use crate::sched;
use crate::types::Tick;

// ============ Wrap-safe comparisons ============

/// `a <= b` under wrap-safe ordering
#[inline(always)]
pub fn lte(a: Tick, b: Tick) -> bool {
    a.wrapping_sub(b) as i32 <= 0
}

/// `a < b` under wrap-safe ordering
#[inline(always)]
pub fn lt(a: Tick, b: Tick) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a >= b` under wrap-safe ordering
#[inline(always)]
pub fn gte(a: Tick, b: Tick) -> bool {
    !lt(a, b)
}

/// `a > b` under wrap-safe ordering
#[inline(always)]
pub fn gt(a: Tick, b: Tick) -> bool {
    !lte(a, b)
}

/// Ticks remaining until `deadline`, saturating at zero once passed.
#[inline]
pub fn ticks_until(deadline: Tick, now: Tick) -> Tick {
    let dt = deadline.wrapping_sub(now) as i32;
    if dt <= 0 {
        0
    } else {
        dt as Tick
    }
}

// ============ Tick counter ============

/// Current tick count
#[inline]
pub fn now() -> Tick {
    KERNEL.tick_get()
}

// ============ Delays ============

/// Delay the calling task for `ticks` system ticks.
///
/// The task leaves the ready queue and is placed on a delayed list; the
/// tick handler makes it ready again once the wake tick is reached.
///
/// # Errors
/// * `ZeroDelay` - a delay of 0 ticks was requested
/// * `NotRunning` / `IsrContext` / `SchedulerLocked` - wrong context
pub fn delay(ticks: Tick) -> KernelResult<()> {
    if !KERNEL.is_running() {
        return Err(KernelError::NotRunning);
    }

    if is_isr_context() {
        return Err(KernelError::IsrContext);
    }

    if KERNEL.sched_lock_nesting() > 0 {
        return Err(KernelError::SchedulerLocked);
    }

    if ticks == 0 {
        return Err(KernelError::ZeroDelay);
    }

    sched::delay_current(ticks);

    Ok(())
}

/// Delay the calling task for (at least) `ms` milliseconds.
pub fn delay_ms(ms: u32) -> KernelResult<()> {
    let ticks = ((ms as u64 * TICK_RATE_HZ as u64) / 1000) as Tick;
    delay(ticks.max(1))
}

// ============ Tick interrupt ============

/// Tick entry point, called from the timer ISR.
///
/// Advances the tick counter, wakes expired delays and timeouts, and
/// requests preemption when a higher-priority task became ready.
pub fn tick_handler() {
    if !KERNEL.is_running() {
        return;
    }

    KERNEL.int_enter();
    sched::tick();
    KERNEL.int_exit();
}

/// SysTick interrupt handler
#[no_mangle]
pub extern "C" fn SysTick() {
    tick_handler();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_no_wrap() {
        assert!(lte(5, 5));
        assert!(lte(4, 5));
        assert!(!lte(6, 5));
        assert!(lt(4, 5));
        assert!(!lt(5, 5));
        assert!(gte(5, 5));
        assert!(gt(6, 5));
    }

    #[test]
    fn test_compare_across_wrap() {
        // 3 comes "after" 0xFFFF_FFFE once the counter wraps
        assert!(lt(0xFFFF_FFFE, 3));
        assert!(gt(3, 0xFFFF_FFFE));
        assert!(lte(0xFFFF_FFFF, 0));
        assert!(gte(0, 0xFFFF_FFFF));
    }

    #[test]
    fn test_ticks_until() {
        assert_eq!(ticks_until(10, 4), 6);
        assert_eq!(ticks_until(10, 10), 0);
        assert_eq!(ticks_until(10, 12), 0);
        // Deadline 3 armed at 0xFFFF_FFFE is 5 ticks away
        assert_eq!(ticks_until(3, 0xFFFF_FFFE), 5);
        assert_eq!(ticks_until(3, 0xFFFF_FFFF), 4);
        assert_eq!(ticks_until(3, 0), 3);
    }

    #[test]
    fn test_max_half_range_wait() {
        let deadline = 100u32.wrapping_add(i32::MAX as u32);
        assert_eq!(ticks_until(deadline, 100), i32::MAX as u32);
        assert!(gt(deadline, 100));
    }
}
