//! # ETA/OS: preemptible multi-policy RTOS kernel
//!
//! A small real-time kernel for resource-constrained, single-core
//! microcontrollers without an MMU. Its core is the thread scheduler: a run
//! queue bound to one pluggable scheduling class, timer-driven sleeps and
//! timeouts, thread queues for blocking synchronization, and a reschedule
//! protocol shared by voluntary yields, wake-ups and interrupt preemption.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                  Application Threads                    │
//! ├────────────────────────────────────────────────────────┤
//! │               Kernel API (kernel.rs)                    │
//! │   spawn · sleep · yield_now · kill · set_priority       │
//! ├──────────────┬─────────────────────┬───────────────────┤
//! │  Run queue   │  Thread queues      │  Clock source     │
//! │  sched/rq.rs │  event.rs mutex.rs  │  clocksource.rs   │
//! │  preempt.rs  │  semaphore.rs       │  timer.rs         │
//! │              │  condition.rs ipm.rs│                   │
//! ├──────────────┴─────────────────────┴───────────────────┤
//! │     Scheduling classes (sched/): EDF · RR · FIFO ·      │
//! │     lottery, selected by Cargo feature                  │
//! ├────────────────────────────────────────────────────────┤
//! │   Thread model (thread.rs): TCB arena, typed handles    │
//! ├────────────────────────────────────────────────────────┤
//! │   Arch port (arch/): Cortex-M4 PendSV/SysTick · sim     │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Scheduling model
//!
//! Priorities are nice values: lower is more favorable, `255` belongs to
//! the idle thread. The running thread stays on its class's ready set while
//! it is runnable. A wake-up requests a reschedule unless the running thread
//! clearly outranks the woken one; the request is honored at the next
//! preemption point (end of a kernel call, interrupt exit) unless preemption
//! is disabled.
//!
//! ## Memory Model
//!
//! - `alloc` for thread control blocks, kernel-allocated stacks, timers and
//!   thread queues; allocation failure is reported, never aborted on
//! - Threads are addressed through generation-checked [`ThreadId`] handles
//! - Shared kernel state sits behind interrupt-masking spin locks
//!   ([`sync::IrqSpinLock`])

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod clocksource;
pub mod condition;
pub mod config;
pub mod error;
pub mod event;
pub mod ipm;
pub mod kernel;
pub mod mutex;
pub mod sched;
pub mod semaphore;
pub mod sync;
pub mod thread;
pub mod timer;

pub use condition::Condition;
pub use error::{Error, Result};
pub use event::Event;
pub use ipm::Ipm;
pub use kernel::Kernel;
pub use mutex::Mutex;
pub use semaphore::Semaphore;
pub use thread::{ThreadId, ThreadStack, ThreadState, WakeReason};
pub use timer::{TimerId, TimerMode};
