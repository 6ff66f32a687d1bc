//! # Architecture Abstraction Layer
//!
//! The [`Port`] trait is the boundary between the scheduler and the CPU.
//! The kernel decides *which* thread runs; a port knows *how* to build an
//! initial stack frame, switch stacks and query the interrupt state.
//!
//! - [`cortex_m4`]: ARM Cortex-M4, context switch deferred to PendSV.
//! - [`sim`]: hosted port for tests. Records switches instead of
//!   performing them.

#[cfg(all(feature = "cortex-m4", target_arch = "arm"))]
pub mod cortex_m4;
pub mod sim;

use crate::thread::ThreadEntry;

/// CPU-specific half of the scheduler.
pub trait Port {
    /// Lay out the initial frame of a thread that starts in `entry(arg)`.
    /// Returns the stack pointer to save in the thread's control block.
    fn init_stack(&self, stack: &mut [u8], entry: ThreadEntry, arg: usize) -> usize;

    /// Switch from the current thread to the one whose saved stack pointer
    /// is `next_sp`, saving the outgoing pointer through `prev_sp`.
    ///
    /// A port may defer the switch until interrupts are re-enabled.
    ///
    /// # Safety
    /// `prev_sp` must stay valid until the switch has completed.
    unsafe fn switch_context(&self, prev_sp: *mut usize, next_sp: usize);

    /// Launch the first thread. Does not return on real hardware.
    fn start_first(&self, sp: usize);

    /// Whether interrupts are currently enabled.
    fn irqs_enabled(&self) -> bool;

    /// Whether the caller runs in interrupt context.
    fn in_interrupt(&self) -> bool;

    /// Body of the idle thread.
    fn idle_entry(&self) -> ThreadEntry {
        idle_spin
    }
}

extern "C" fn idle_spin(_arg: usize) {
    loop {
        core::hint::spin_loop();
    }
}
