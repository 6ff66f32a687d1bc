//! # Thread Control Block
//!
//! Defines the unit of execution. Threads live in a [`Threads`] arena owned
//! by the run queue and are referred to everywhere else through a typed,
//! generation-checked [`ThreadId`]. The scheduling classes link threads into
//! their ready lists and wait queues through [`SchedEntity::next`], and the
//! run queue chains its wake and kill lists through [`Thread::rq_next`].
//!
//! A thread is on at most one ready list or one wait queue at any instant:
//! both are built from the same `se.next` link.

use alloc::alloc::{alloc, Layout};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ops::{Index, IndexMut};
use core::ptr::NonNull;

use bitflags::bitflags;

use crate::clocksource::Tick;
use crate::config::DEFAULT_TIME_SLICE;
use crate::error::{Error, Result};
use crate::event::QueueId;
use crate::timer::TimerId;

/// Entry point of a thread. Receives the argument given at creation.
/// Returning from it terminates the thread.
pub type ThreadEntry = extern "C" fn(usize);

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Handle to a thread in the [`Threads`] arena.
///
/// The generation makes handles of reaped threads stale instead of letting
/// them alias whichever thread reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId {
    index: u16,
    generation: u16,
}

impl ThreadId {
    /// Slot index, stable for the lifetime of the thread.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

// ---------------------------------------------------------------------------
// Thread state machine
// ---------------------------------------------------------------------------

/// Life-cycle state of a thread.
///
/// ```text
///            start()                 schedule()
///   New ─────────────► Ready ◄─────────────────► Running
///                        ▲                          │
///                        │ timer / notify           │ sleep() / wait()
///                        │                          ▼
///                        └──────────────── Sleeping | Waiting
///
///   any ──── kill() ───► ExitPending ── next reschedule ──► reaped
/// ```
///
/// A reaped thread has left the arena; its handle no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created, never inserted into a run queue.
    New,
    /// On the run queue, waiting for the CPU.
    Ready,
    /// Current thread of its run queue.
    Running,
    /// Parked on a sleep timer.
    Sleeping,
    /// Blocked on a thread queue (event, mutex, semaphore, condition).
    Waiting,
    /// Killed. Never selected again; reaped at the next reschedule.
    ExitPending,
}

bitflags! {
    /// Scheduler flags of a thread.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u8 {
        /// Runnable: policies only hand out threads with this bit set.
        const RUNNING = 1 << 0;
        /// The idle thread. Chosen only when nothing else is runnable.
        const IDLE = 1 << 1;
        /// A wake-up or state change asks for a reschedule.
        const NEED_RESCHED = 1 << 2;
        /// The time slice ran out on the tick.
        const SLICE_EXPIRED = 1 << 3;
    }
}

/// Why a blocked thread was released from a thread queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    Notified,
    TimedOut,
}

/// The timer a thread is parked on.
///
/// `Expired` is the "signaled" marker left behind by a timeout so a woken
/// waiter can tell a timeout from a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerSlot {
    None,
    Armed(TimerId),
    Expired,
}

// ---------------------------------------------------------------------------
// Scheduling entity
// ---------------------------------------------------------------------------

/// Maximum number of lottery tickets a single thread holds.
pub const MAX_THREAD_TICKETS: usize = 10;

/// Policy-specific scheduling data.
#[derive(Debug, Clone, Default)]
pub struct SchedEntity {
    /// Next thread in the ready list or thread queue this thread is on.
    pub next: Option<ThreadId>,
    /// Absolute EDF deadline, in clock ticks.
    pub deadline: Tick,
    /// Lottery tickets drawn from the class's pool.
    pub tickets: heapless::Vec<u16, MAX_THREAD_TICKETS>,
}

// ---------------------------------------------------------------------------
// Stack
// ---------------------------------------------------------------------------

/// Where a thread's stack comes from.
pub enum ThreadStack {
    /// The kernel allocates a zeroed stack of this many bytes and frees it
    /// when the thread is reaped.
    Alloc(usize),
    /// A caller-provided buffer. Never freed by the kernel.
    Static(&'static mut [u8]),
}

impl ThreadStack {
    /// Kernel-allocated stack of [`crate::config::DEFAULT_STACK_SIZE`] bytes.
    pub fn default_size() -> Self {
        ThreadStack::Alloc(crate::config::DEFAULT_STACK_SIZE)
    }
}

pub(crate) enum Stack {
    Owned(Box<[u8]>),
    Borrowed(&'static mut [u8]),
}

impl Stack {
    pub(crate) fn new(kind: ThreadStack) -> Result<Self> {
        match kind {
            ThreadStack::Alloc(size) => {
                let mut buf = Vec::new();
                buf.try_reserve_exact(size)
                    .map_err(|_| Error::OutOfMemory)?;
                buf.resize(size, 0u8);
                Ok(Stack::Owned(buf.into_boxed_slice()))
            }
            ThreadStack::Static(buf) => Ok(Stack::Borrowed(buf)),
        }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Stack::Owned(buf) => &mut buf[..],
            Stack::Borrowed(buf) => &mut buf[..],
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Stack::Owned(buf) => buf.len(),
            Stack::Borrowed(buf) => buf.len(),
        }
    }

    pub(crate) fn is_kernel_allocated(&self) -> bool {
        matches!(self, Stack::Owned(_))
    }
}

// ---------------------------------------------------------------------------
// Thread
// ---------------------------------------------------------------------------

/// Thread control block.
pub struct Thread {
    pub name: &'static str,
    /// Static nice value. Lower is more favorable.
    pub prio: u8,
    /// Dynamic priority bonus, aged while the thread waits for the CPU.
    pub dprio: u8,
    pub flags: ThreadFlags,
    pub state: ThreadState,
    /// True iff the thread is reachable from the run queue's ready list.
    pub on_rq: bool,
    /// Nesting depth of `preempt_disable`.
    pub preempt_count: u32,
    /// Ticks left in the current time slice.
    pub slice: u32,
    /// Saved stack pointer. Written by the port on every switch away.
    pub sp: usize,
    pub(crate) stack: Stack,
    pub timer: TimerSlot,
    /// Thread queue this thread is blocked on.
    pub queue: Option<QueueId>,
    /// Mutex to re-acquire once released from `queue` (condition waits).
    pub relock: Option<QueueId>,
    /// Notifications posted from interrupt context, not yet delivered.
    pub event_count: u8,
    /// Link in the run queue's wake or kill list.
    pub rq_next: Option<ThreadId>,
    pub se: SchedEntity,
    pub entry: ThreadEntry,
    pub arg: usize,
}

impl Thread {
    pub(crate) fn new(
        name: &'static str,
        entry: ThreadEntry,
        arg: usize,
        stack: Stack,
        prio: u8,
    ) -> Self {
        Self {
            name,
            prio,
            dprio: 0,
            flags: ThreadFlags::empty(),
            state: ThreadState::New,
            on_rq: false,
            preempt_count: 0,
            slice: DEFAULT_TIME_SLICE,
            sp: 0,
            stack,
            timer: TimerSlot::None,
            queue: None,
            relock: None,
            event_count: 0,
            rq_next: None,
            se: SchedEntity::default(),
            entry,
            arg,
        }
    }

    /// Effective priority: the static priority minus the aged bonus,
    /// never below zero.
    #[inline]
    pub fn effective_prio(&self) -> u8 {
        self.prio - self.dprio.min(self.prio)
    }

    #[inline]
    pub fn is_runnable(&self) -> bool {
        self.flags.contains(ThreadFlags::RUNNING)
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.flags.contains(ThreadFlags::IDLE)
    }

    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }
}

/// Move a TCB to the heap, reporting allocation failure instead of aborting.
pub(crate) fn try_box(tcb: Thread) -> Result<Box<Thread>> {
    let layout = Layout::new::<Thread>();
    // SAFETY: `Thread` is not zero-sized; the pointer is checked for null,
    // initialized with `write` and then owned by exactly one `Box`.
    unsafe {
        let ptr = NonNull::new(alloc(layout) as *mut Thread).ok_or(Error::OutOfMemory)?;
        ptr.as_ptr().write(tcb);
        Ok(Box::from_raw(ptr.as_ptr()))
    }
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

struct Slot {
    generation: u16,
    tcb: Option<Box<Thread>>,
}

/// Arena of thread control blocks.
///
/// TCBs are boxed so the saved stack pointer of a thread stays at a fixed
/// address while a deferred context switch still refers to it.
pub struct Threads {
    slots: Vec<Slot>,
    len: usize,
}

impl Threads {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            len: 0,
        }
    }

    pub(crate) fn insert(&mut self, tcb: Box<Thread>) -> Result<ThreadId> {
        let index = match self.slots.iter().position(|s| s.tcb.is_none()) {
            Some(i) => i,
            None => {
                if self.slots.len() >= u16::MAX as usize {
                    return Err(Error::OutOfMemory);
                }
                self.slots.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
                self.slots.push(Slot {
                    generation: 0,
                    tcb: None,
                });
                self.slots.len() - 1
            }
        };

        let slot = &mut self.slots[index];
        slot.tcb = Some(tcb);
        self.len += 1;
        Ok(ThreadId {
            index: index as u16,
            generation: slot.generation,
        })
    }

    pub(crate) fn remove(&mut self, id: ThreadId) -> Option<Box<Thread>> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        let tcb = slot.tcb.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.len -= 1;
        Some(tcb)
    }

    pub fn get(&self, id: ThreadId) -> Option<&Thread> {
        self.slots
            .get(id.index())
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.tcb.as_deref())
    }

    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.slots
            .get_mut(id.index())
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.tcb.as_deref_mut())
    }

    pub fn contains(&self, id: ThreadId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live threads.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Handles of all live threads, in slot order.
    pub fn ids(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.tcb.as_ref().map(|_| ThreadId {
                index: i as u16,
                generation: s.generation,
            })
        })
    }
}

impl Default for Threads {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<ThreadId> for Threads {
    type Output = Thread;

    fn index(&self, id: ThreadId) -> &Thread {
        self.get(id).expect("stale thread handle")
    }
}

impl IndexMut<ThreadId> for Threads {
    fn index_mut(&mut self, id: ThreadId) -> &mut Thread {
        self.get_mut(id).expect("stale thread handle")
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) extern "C" fn nop_entry(_arg: usize) {}

    /// Insert a bare, runnable-looking thread for policy tests.
    pub(crate) fn add(threads: &mut Threads, name: &'static str, prio: u8) -> ThreadId {
        let stack = Stack::new(ThreadStack::Alloc(64)).unwrap();
        let mut tcb = Thread::new(name, nop_entry, 0, stack, prio);
        tcb.flags.insert(ThreadFlags::RUNNING);
        threads.insert(try_box(tcb).unwrap()).unwrap()
    }

    #[test]
    fn test_thread_initialization() {
        let stack = Stack::new(ThreadStack::Alloc(128)).unwrap();
        let tcb = Thread::new("worker", nop_entry, 7, stack, 5);

        assert_eq!(tcb.state, ThreadState::New);
        assert_eq!(tcb.prio, 5);
        assert_eq!(tcb.arg, 7);
        assert_eq!(tcb.slice, DEFAULT_TIME_SLICE);
        assert_eq!(tcb.stack_size(), 128);
        assert!(tcb.stack.is_kernel_allocated());
        assert!(!tcb.is_runnable());
        assert_eq!(tcb.timer, TimerSlot::None);
    }

    #[test]
    fn test_effective_priority() {
        let stack = Stack::new(ThreadStack::Alloc(16)).unwrap();
        let mut tcb = Thread::new("t", nop_entry, 0, stack, 20);

        tcb.dprio = 5;
        assert_eq!(tcb.effective_prio(), 15);

        // Bonus never pushes below zero
        tcb.dprio = 200;
        assert_eq!(tcb.effective_prio(), 0);
    }

    #[test]
    fn test_stack_allocation_failure() {
        assert_eq!(
            Stack::new(ThreadStack::Alloc(usize::MAX)).err(),
            Some(Error::OutOfMemory)
        );
    }

    #[test]
    fn test_static_stack_is_not_kernel_allocated() {
        let buf: &'static mut [u8] = Box::leak(alloc::vec![0u8; 32].into_boxed_slice());
        let stack = Stack::new(ThreadStack::Static(buf)).unwrap();
        assert!(!stack.is_kernel_allocated());
        assert_eq!(stack.len(), 32);
    }

    #[test]
    fn test_arena_generations() {
        let mut threads = Threads::new();
        let a = add(&mut threads, "a", 1);
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[a].name, "a");

        assert!(threads.remove(a).is_some());
        assert!(!threads.contains(a));
        assert!(threads.remove(a).is_none());

        // Slot is reused, the old handle stays stale
        let b = add(&mut threads, "b", 2);
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert!(threads.get(a).is_none());
        assert_eq!(threads[b].name, "b");
    }
}
