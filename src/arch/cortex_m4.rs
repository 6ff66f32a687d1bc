//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4F (Thumb-2) processor.
//! Implements the deferred context switch via PendSV, SysTick timer
//! configuration and the initial thread frame.
//!
//! ## Context Switch Mechanism
//!
//! The Cortex-M4 uses a split-stack model:
//! - **MSP** (Main Stack Pointer): used by the kernel's exception handlers
//! - **PSP** (Process Stack Pointer): used by threads in Thread mode
//!
//! On exception entry, the hardware stacks R0–R3, R12, LR, PC and xPSR
//! (plus S0–S15 and FPSCR when the thread used the FPU) onto the process
//! stack. PendSV saves R4–R11 and the EXC_RETURN value, and S16–S31 when
//! the extended frame is in use.
//!
//! [`Port::switch_context`] only records the switch and pends PendSV. A
//! switch requested in thread context happens as soon as interrupts are
//! re-enabled; one requested from SysTick happens when the handler returns.
//! Several switches decided before PendSV runs collapse into one: the
//! outgoing thread is the one that was really running.
//!
//! ## Interrupt Priorities
//!
//! - SysTick: priority 0xFF (lowest)
//! - PendSV: priority 0xFF (lowest), runs only when no other ISR is active

use core::arch::{asm, global_asm};
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use cortex_m::peripheral::scb::VectActive;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::SCB;
use cortex_m::register::primask;

use super::Port;
use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::thread::ThreadEntry;

/// Software-saved words: R4–R11 and EXC_RETURN.
const SW_FRAME_WORDS: usize = 9;
/// Hardware-saved words of a basic frame: R0–R3, R12, LR, PC, xPSR.
const HW_FRAME_WORDS: usize = 8;
/// Return to Thread mode on PSP, basic frame.
const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;
/// Thumb state bit of xPSR.
const XPSR_THUMB: u32 = 0x0100_0000;

static PENDING_PREV: AtomicPtr<usize> = AtomicPtr::new(ptr::null_mut());
static PENDING_NEXT: AtomicUsize = AtomicUsize::new(0);

/// The Cortex-M4 port.
#[derive(Debug, Default, Clone, Copy)]
pub struct CortexM4;

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Configure SysTick to fire at `TICK_HZ` from the processor clock.
pub fn configure_systick(syst: &mut cortex_m::peripheral::SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

// ---------------------------------------------------------------------------
// PendSV trigger
// ---------------------------------------------------------------------------

/// Pend a PendSV exception: sets PENDSVSET in the ICSR.
#[inline]
pub fn trigger_pendsv() {
    SCB::set_pendsv();
}

// ---------------------------------------------------------------------------
// Interrupt priority configuration
// ---------------------------------------------------------------------------

/// Set PendSV and SysTick to the lowest interrupt priority.
pub fn set_interrupt_priorities() {
    // System Handler Priority Register 3 (SHPR3): 0xE000_ED20
    // Bits [23:16] = PendSV priority
    // Bits [31:24] = SysTick priority
    const SHPR3: *mut u32 = 0xE000_ED20 as *mut u32;
    // SAFETY: SHPR3 is an always-present, word-accessible SCB register.
    unsafe {
        let val = ptr::read_volatile(SHPR3);
        ptr::write_volatile(SHPR3, val | (0xFF << 16) | (0xFF << 24));
    }
}

// ---------------------------------------------------------------------------
// Thread exit trampoline
// ---------------------------------------------------------------------------

/// Return address of every thread entry: a thread that returns exits.
extern "C" fn thread_exit() -> ! {
    crate::kernel::exit();
    loop {
        cortex_m::asm::wfi();
    }
}

extern "C" fn idle_wfi(_arg: usize) {
    loop {
        cortex_m::asm::wfi();
    }
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

impl Port for CortexM4 {
    /// Build the frame PendSV restores from:
    ///
    /// ```text
    /// high  ┌──────────────┐ ← top (8-byte aligned)
    ///       │ xPSR (T bit) │
    ///       │ PC = entry   │
    ///       │ LR = exit    │
    ///       │ R12, R3..R1  │
    ///       │ R0 = arg     │
    ///       ├──────────────┤
    ///       │ EXC_RETURN   │
    ///       │ R11..R4      │
    /// low   └──────────────┘ ← returned stack pointer
    /// ```
    fn init_stack(&self, stack: &mut [u8], entry: ThreadEntry, arg: usize) -> usize {
        let base = stack.as_mut_ptr() as usize;
        let top = (base + stack.len()) & !7;
        let sp = top - (SW_FRAME_WORDS + HW_FRAME_WORDS) * 4;
        assert!(sp >= base, "thread stack too small for the initial frame");

        let mut frame = [0u32; SW_FRAME_WORDS + HW_FRAME_WORDS];
        frame[8] = EXC_RETURN_THREAD_PSP;
        let hw = &mut frame[SW_FRAME_WORDS..];
        hw[0] = arg as u32;
        hw[5] = thread_exit as usize as u32;
        hw[6] = (entry as usize as u32) & !1;
        hw[7] = XPSR_THUMB;

        let words = sp as *mut u32;
        for (i, word) in frame.iter().enumerate() {
            // SAFETY: [sp, top) lies inside `stack`, checked above.
            unsafe { words.add(i).write(*word) };
        }
        sp
    }

    unsafe fn switch_context(&self, prev_sp: *mut usize, next_sp: usize) {
        let pending = PENDING_PREV.load(Ordering::Acquire);
        if pending.is_null() {
            PENDING_PREV.store(prev_sp, Ordering::Release);
        } else if *pending == next_sp {
            // Back to the thread that never left the CPU.
            PENDING_PREV.store(ptr::null_mut(), Ordering::Release);
            PENDING_NEXT.store(0, Ordering::Release);
            return;
        }
        PENDING_NEXT.store(next_sp, Ordering::Release);
        trigger_pendsv();
    }

    fn start_first(&self, sp: usize) {
        let frame = (sp + SW_FRAME_WORDS * 4) as *const u32;
        // SAFETY: `sp` was built by `init_stack`; the thread never ran.
        unsafe {
            let arg = *frame;
            let pc = *frame.add(6) | 1;
            let psp = frame.add(HW_FRAME_WORDS) as usize;
            asm!(
                "msr psp, r2",
                // Thread mode on PSP (CONTROL.SPSEL = 1)
                "movs r2, #2",
                "msr control, r2",
                "isb",
                "mov lr, r3",
                "cpsie i",
                "bx r1",
                in("r0") arg,
                in("r1") pc,
                in("r2") psp,
                in("r3") thread_exit as usize,
                options(noreturn)
            );
        }
    }

    fn irqs_enabled(&self) -> bool {
        primask::read().is_active()
    }

    fn in_interrupt(&self) -> bool {
        !matches!(SCB::vect_active(), VectActive::ThreadMode)
    }

    fn idle_entry(&self) -> ThreadEntry {
        idle_wfi
    }
}

// ---------------------------------------------------------------------------
// PendSV handler (context switch)
// ---------------------------------------------------------------------------

/// Store the outgoing stack pointer and hand back the incoming one.
/// Called from PendSV with interrupts masked.
#[no_mangle]
unsafe extern "C" fn etaos_pendsv_swap(sp: usize) -> usize {
    let prev = PENDING_PREV.swap(ptr::null_mut(), Ordering::AcqRel);
    let next = PENDING_NEXT.swap(0, Ordering::AcqRel);
    if prev.is_null() || next == 0 {
        return sp;
    }
    *prev = sp;
    next
}

// Save R4–R11, EXC_RETURN and, for an FPU frame, S16–S31 on the outgoing
// process stack; restore the same from the incoming one.
global_asm!(
    ".section .text.PendSV,\"ax\",%progbits",
    ".global PendSV",
    ".type PendSV,%function",
    ".thumb_func",
    "PendSV:",
    "    cpsid i",
    "    mrs r0, psp",
    "    tst lr, #0x10",
    "    it eq",
    "    vstmdbeq r0!, {{s16-s31}}",
    "    stmdb r0!, {{r4-r11, lr}}",
    "    bl etaos_pendsv_swap",
    "    ldmia r0!, {{r4-r11, lr}}",
    "    tst lr, #0x10",
    "    it eq",
    "    vldmiaeq r0!, {{s16-s31}}",
    "    msr psp, r0",
    "    cpsie i",
    "    bx lr",
    ".size PendSV, . - PendSV",
);

// ---------------------------------------------------------------------------
// SysTick handler
// ---------------------------------------------------------------------------

/// Scheduler tick, at `TICK_HZ`.
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    crate::kernel::global().timer_interrupt();
}
