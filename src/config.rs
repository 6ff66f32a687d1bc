//! # ETA/OS Configuration
//!
//! Compile-time constants governing the scheduler and system behavior.
//! The scheduling class itself is picked through Cargo features, see
//! [`crate::sched::DefaultClass`].

/// System tick frequency in Hz. Determines scheduler tick granularity and
/// the millisecond-to-tick conversion of every timer.
pub const TICK_HZ: u32 = 1000;

/// Default time slice in ticks. A thread runs for this many ticks before
/// it is flagged for preemption.
pub const DEFAULT_TIME_SLICE: u32 = 10;

/// Stack size used when a thread asks the kernel to allocate its stack.
/// Must be large enough for the deepest call chain plus the initial
/// exception frame (64 bytes on Cortex-M4).
pub const DEFAULT_STACK_SIZE: usize = 1024;

/// Stack size of the idle thread.
pub const IDLE_STACK_SIZE: usize = 256;

/// Nice value of the idle thread. Always the least favorable priority.
pub const IDLE_PRIO: u8 = 255;

/// Nice value handed to threads that do not ask for anything specific.
pub const DEFAULT_PRIO: u8 = 120;

/// Number of tickets minted when the lottery class is created.
pub const LOTTERY_POOL_SIZE: u16 = 20;

/// Number of tickets minted each time the lottery pool runs dry.
pub const LOTTERY_RESIZE_SIZE: u16 = 5;

/// Hard upper bound on minted lottery tickets.
pub const LOTTERY_MAX_TICKETS: u16 = 1024;

/// How far the idle thread's EDF deadline is pushed into the future, in days.
/// Converted to ticks with the clock frequency the EDF class is built with.
pub const EDF_IDLE_BIAS_DAYS: u64 = 500;

/// System clock frequency in Hz (default for STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

/// Heap handed to the global allocator on the Cortex-M4 build.
pub const HEAP_SIZE: usize = 32 * 1024;
