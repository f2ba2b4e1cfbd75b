//! Critical section handling
//!
//! Mutual exclusion between task code and ISRs on a single core is
//! interrupt masking. The guard saves the previous PRIMASK state so
//! critical sections nest correctly.

/// RAII guard for critical sections.
///
/// Creating the guard disables interrupts; dropping it restores the
/// interrupt mask that was in effect when the guard was created.
pub struct CriticalSection {
    was_active: bool,
}

impl CriticalSection {
    /// Enter a critical section by masking interrupts.
    #[inline(always)]
    pub fn enter() -> Self {
        #[cfg(target_arch = "arm")]
        {
            let was_active = cortex_m::register::primask::read().is_active();
            cortex_m::interrupt::disable();
            CriticalSection { was_active }
        }

        #[cfg(not(target_arch = "arm"))]
        {
            CriticalSection { was_active: false }
        }
    }
}

impl Drop for CriticalSection {
    #[inline(always)]
    fn drop(&mut self) {
        if self.was_active {
            #[cfg(target_arch = "arm")]
            unsafe {
                cortex_m::interrupt::enable()
            };
        }
    }
}

/// Execute a closure with interrupts masked.
///
/// The closure receives a reference to the guard, which gates access to
/// [`CsCell`](crate::cs_cell::CsCell) protected data.
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(&CriticalSection) -> R,
{
    let cs = CriticalSection::enter();
    f(&cs)
}

/// Check if currently executing in an ISR context
#[inline]
pub fn is_isr_context() -> bool {
    #[cfg(target_arch = "arm")]
    {
        let ipsr: u32;
        unsafe {
            core::arch::asm!(
                "mrs {}, IPSR",
                out(reg) ipsr,
                options(nomem, nostack, preserves_flags)
            );
        }
        ipsr != 0
    }

    #[cfg(not(target_arch = "arm"))]
    {
        false
    }
}
