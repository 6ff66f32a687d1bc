//! # Kernel Errors
//!
//! Recoverable conditions surfaced to callers. Contract violations
//! (unlocking a mutex owned by someone else, recursive acquisition of a
//! kernel lock) are not represented here: they panic.

use core::fmt;

/// Errors returned by kernel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The allocator could not satisfy a thread, stack, timer or queue
    /// allocation. Nothing was created.
    OutOfMemory,
    /// A timed wait expired before the queue was notified.
    TimedOut,
    /// The caller was switched out and the port returned before the caller
    /// was resumed. Only hosted ports do this; the eventual outcome is
    /// reported by [`crate::kernel::Kernel::wake_reason`].
    Suspended,
    /// The handle refers to a thread, queue or timer that no longer exists.
    InvalidHandle,
    /// A non-blocking acquire found the resource taken, or a reset found
    /// threads still waiting.
    Busy,
    /// A bounded queue has no free slot.
    Full,
    /// A bounded queue has nothing to hand out.
    Empty,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::OutOfMemory => "out of memory",
            Error::TimedOut => "wait timed out",
            Error::Suspended => "caller suspended",
            Error::InvalidHandle => "stale or invalid handle",
            Error::Busy => "resource busy",
            Error::Full => "queue full",
            Error::Empty => "queue empty",
        };
        f.write_str(msg)
    }
}

/// Shorthand used throughout the kernel.
pub type Result<T> = core::result::Result<T, Error>;
