//! # Scheduling Classes
//!
//! A scheduling class decides the order of the ready set and which thread
//! takes the CPU next. The run queue and the thread-queue code only ever
//! call through [`SchedClass`]; no policy is special-cased anywhere else.
//!
//! ## Policies
//!
//! | Class       | Ready-set order                         | Preempts on wake |
//! |-------------|-----------------------------------------|------------------|
//! | [`RoundRobin`] | effective priority, arrival on ties  | strictly better priority |
//! | [`Fifo`]    | effective priority, no slice rotation   | strictly better priority |
//! | [`Edf`]     | absolute deadline, arrival on ties      | earlier deadline |
//! | [`Lottery`] | priority, selection by weighted draw   | never            |
//!
//! The class compiled in by default is [`DefaultClass`], picked by Cargo
//! feature with precedence `sched-edf` > `sched-lottery` > `sched-fifo` >
//! `sched-rr`.
//!
//! ## Lists
//!
//! Ready lists and thread queues are singly linked through
//! [`SchedEntity::next`](crate::thread::SchedEntity::next). A thread is on
//! at most one of them at a time, so one link suffices.

pub mod edf;
pub mod fifo;
pub mod lottery;
pub mod preempt;
pub mod rq;
pub mod rr;

pub use edf::Edf;
pub use fifo::Fifo;
pub use lottery::Lottery;
pub use rq::{RunQueue, SchedStats};
pub use rr::RoundRobin;

use crate::clocksource::Tick;
use crate::thread::{Thread, ThreadId, Threads};

// ---------------------------------------------------------------------------
// Build-time policy selection
// ---------------------------------------------------------------------------

/// Scheduling class selected by Cargo features.
#[cfg(feature = "sched-edf")]
pub type DefaultClass = Edf;

/// Scheduling class selected by Cargo features.
#[cfg(all(feature = "sched-lottery", not(feature = "sched-edf")))]
pub type DefaultClass = Lottery;

/// Scheduling class selected by Cargo features.
#[cfg(all(
    feature = "sched-fifo",
    not(any(feature = "sched-edf", feature = "sched-lottery"))
))]
pub type DefaultClass = Fifo;

/// Scheduling class selected by Cargo features. Round-robin is also the
/// fallback when no policy feature is enabled.
#[cfg(not(any(
    feature = "sched-edf",
    feature = "sched-lottery",
    feature = "sched-fifo"
)))]
pub type DefaultClass = RoundRobin;

/// A fresh instance of [`DefaultClass`], usable in a `static` initializer.
pub const fn default_class() -> DefaultClass {
    #[cfg(feature = "sched-edf")]
    {
        Edf::new(crate::config::TICK_HZ)
    }
    #[cfg(all(feature = "sched-lottery", not(feature = "sched-edf")))]
    {
        Lottery::new()
    }
    #[cfg(all(
        feature = "sched-fifo",
        not(any(feature = "sched-edf", feature = "sched-lottery"))
    ))]
    {
        Fifo::new()
    }
    #[cfg(not(any(
        feature = "sched-edf",
        feature = "sched-lottery",
        feature = "sched-fifo"
    )))]
    {
        RoundRobin::new()
    }
}

// ---------------------------------------------------------------------------
// Thread queue head
// ---------------------------------------------------------------------------

/// Head of a thread (wait) queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueHead {
    /// No waiters; the next wait blocks.
    #[default]
    Empty,
    /// No waiters; a notification arrived and the next wait returns at once.
    Signaled,
    /// First thread of the ordered waiter chain.
    Waiters(ThreadId),
}

impl QueueHead {
    #[inline]
    pub fn first(&self) -> Option<ThreadId> {
        match *self {
            QueueHead::Waiters(tid) => Some(tid),
            _ => None,
        }
    }

    #[inline]
    pub fn has_waiters(&self) -> bool {
        matches!(self, QueueHead::Waiters(_))
    }

    fn from_link(link: Option<ThreadId>) -> Self {
        link.map_or(QueueHead::Empty, QueueHead::Waiters)
    }
}

// ---------------------------------------------------------------------------
// Intrusive list helpers
// ---------------------------------------------------------------------------

/// Iterate a list starting at `head`.
pub fn iter(threads: &Threads, head: Option<ThreadId>) -> impl Iterator<Item = ThreadId> + '_ {
    core::iter::successors(head, move |&tid| threads[tid].se.next)
}

/// Insert `tid` before the first entry it `precedes`, or at the tail.
pub(crate) fn insert_by<F>(threads: &mut Threads, head: &mut Option<ThreadId>, tid: ThreadId, precedes: F)
where
    F: Fn(&Thread, &Thread) -> bool,
{
    let mut prev: Option<ThreadId> = None;
    let mut cursor = *head;
    while let Some(cur) = cursor {
        if precedes(&threads[tid], &threads[cur]) {
            break;
        }
        prev = Some(cur);
        cursor = threads[cur].se.next;
    }

    threads[tid].se.next = cursor;
    match prev {
        Some(p) => threads[p].se.next = Some(tid),
        None => *head = Some(tid),
    }
}

/// Unlink `tid`. Returns `false` when it is not on the list.
pub(crate) fn remove(threads: &mut Threads, head: &mut Option<ThreadId>, tid: ThreadId) -> bool {
    let mut prev: Option<ThreadId> = None;
    let mut cursor = *head;
    while let Some(cur) = cursor {
        let next = threads[cur].se.next;
        if cur == tid {
            match prev {
                Some(p) => threads[p].se.next = next,
                None => *head = next,
            }
            threads[tid].se.next = None;
            return true;
        }
        prev = Some(cur);
        cursor = next;
    }
    false
}

/// Re-sort a list in place after keys changed. Stable, no allocation.
pub(crate) fn resort<F>(threads: &mut Threads, head: &mut Option<ThreadId>, precedes: F)
where
    F: Fn(&Thread, &Thread) -> bool,
{
    let mut pending = head.take();
    while let Some(tid) = pending {
        pending = threads[tid].se.next.take();
        insert_by(threads, head, tid, &precedes);
    }
}

// ---------------------------------------------------------------------------
// Ready list
// ---------------------------------------------------------------------------

/// Ready set of a scheduling class.
///
/// Holds every runnable thread of the run queue, the current thread
/// included while it stays runnable.
#[derive(Debug, Default)]
pub struct ReadyList {
    head: Option<ThreadId>,
    len: usize,
}

impl ReadyList {
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    pub fn head(&self) -> Option<ThreadId> {
        self.head
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter<'a>(&self, threads: &'a Threads) -> impl Iterator<Item = ThreadId> + 'a {
        iter(threads, self.head)
    }

    pub(crate) fn insert_by<F>(&mut self, threads: &mut Threads, tid: ThreadId, precedes: F)
    where
        F: Fn(&Thread, &Thread) -> bool,
    {
        insert_by(threads, &mut self.head, tid, precedes);
        threads[tid].on_rq = true;
        self.len += 1;
    }

    pub(crate) fn remove(&mut self, threads: &mut Threads, tid: ThreadId) -> bool {
        if !threads[tid].on_rq || !remove(threads, &mut self.head, tid) {
            return false;
        }
        threads[tid].on_rq = false;
        self.len -= 1;
        true
    }

    pub(crate) fn resort<F>(&mut self, threads: &mut Threads, precedes: F)
    where
        F: Fn(&Thread, &Thread) -> bool,
    {
        resort(threads, &mut self.head, precedes);
    }

    /// First thread with the RUNNING flag set. The idle thread is only
    /// returned when nothing else is runnable.
    pub fn first_runnable(&self, threads: &Threads) -> Option<ThreadId> {
        let mut idle = None;
        for tid in self.iter(threads) {
            let t = &threads[tid];
            if !t.is_runnable() {
                continue;
            }
            if !t.is_idle() {
                return Some(tid);
            }
            idle.get_or_insert(tid);
        }
        idle
    }
}

/// Strict effective-priority order: ties go behind existing entries.
#[inline]
pub fn prio_precedes(new: &Thread, existing: &Thread) -> bool {
    new.effective_prio() < existing.effective_prio()
}

// ---------------------------------------------------------------------------
// Scheduling class interface
// ---------------------------------------------------------------------------

/// A scheduling policy.
///
/// Implementations own their ready set. Thread queues are owned by whoever
/// blocks on them and are passed in by head.
pub trait SchedClass: Sized {
    /// Human readable policy name.
    const NAME: &'static str;

    /// Whether an expired time slice hands the CPU to the next ready thread.
    const TIME_SLICED: bool = true;

    fn ready(&self) -> &ReadyList;

    fn ready_mut(&mut self) -> &mut ReadyList;

    /// True when `new` goes in front of `existing` in this class's order.
    fn precedes(new: &Thread, existing: &Thread) -> bool;

    /// Insert a thread into the ready set. Never fails.
    fn add_thread(&mut self, threads: &mut Threads, tid: ThreadId, _now: Tick) {
        self.ready_mut().insert_by(threads, tid, Self::precedes);
    }

    /// Remove a thread from the ready set. Returns `false` when it was not
    /// on it, which callers use to detect already-removed threads.
    fn rm_thread(&mut self, threads: &mut Threads, tid: ThreadId) -> bool {
        self.ready_mut().remove(threads, tid)
    }

    /// The best runnable thread, left on the ready set.
    fn next_runnable(&mut self, threads: &Threads) -> Option<ThreadId> {
        self.ready().first_runnable(threads)
    }

    /// True when `candidate` should take the CPU from `current` before the
    /// slice of `current` runs out.
    fn preempt_check(&self, threads: &Threads, current: ThreadId, candidate: ThreadId) -> bool;

    /// Enqueue a blocked thread on a thread queue. A signaled head is
    /// consumed: the thread is queued and gets an event to drain on the
    /// next reschedule.
    fn queue_add(&mut self, threads: &mut Threads, head: &mut QueueHead, tid: ThreadId) {
        if *head == QueueHead::Signaled {
            threads[tid].event_count = threads[tid].event_count.saturating_add(1);
        }
        let mut link = head.first();
        insert_by(threads, &mut link, tid, Self::precedes);
        *head = QueueHead::from_link(link);
    }

    /// Remove a thread from a thread queue. Returns `false` when absent.
    fn queue_rm(&mut self, threads: &mut Threads, head: &mut QueueHead, tid: ThreadId) -> bool {
        let mut link = match head.first() {
            Some(first) => Some(first),
            None => return false,
        };
        let found = remove(threads, &mut link, tid);
        *head = QueueHead::from_link(link);
        found
    }

    /// Age every ready thread by `delta` and restore the class order.
    fn dyn_prio_update(&mut self, threads: &mut Threads, delta: u8) {
        let mut cursor = self.ready().head();
        while let Some(tid) = cursor {
            let t = &mut threads[tid];
            if !t.is_idle() {
                t.dprio = t.dprio.saturating_add(delta);
            }
            cursor = t.se.next;
        }
        self.reorder(threads);
    }

    /// Restore the class order after the aging bonus of a ready thread
    /// changed outside [`dyn_prio_update`](Self::dyn_prio_update).
    fn reorder(&mut self, threads: &mut Threads) {
        self.ready_mut().resort(threads, Self::precedes);
    }

    /// A thread is about to be reaped. Release per-thread class state.
    fn kill(&mut self, _threads: &mut Threads, _tid: ThreadId) {}

    /// Number of threads on the ready set.
    fn nr_ready(&self) -> usize {
        self.ready().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::tests::add;
    use alloc::vec::Vec;

    #[test]
    fn test_insert_by_priority_keeps_arrival_on_ties() {
        let mut threads = Threads::new();
        let a = add(&mut threads, "a", 10);
        let b = add(&mut threads, "b", 5);
        let c = add(&mut threads, "c", 10);
        let d = add(&mut threads, "d", 5);

        let mut head = None;
        for tid in [a, b, c, d] {
            insert_by(&mut threads, &mut head, tid, prio_precedes);
        }
        let order: Vec<ThreadId> = iter(&threads, head).collect();
        assert_eq!(order, [b, d, a, c]);
    }

    #[test]
    fn test_remove_middle_and_missing() {
        let mut threads = Threads::new();
        let a = add(&mut threads, "a", 1);
        let b = add(&mut threads, "b", 2);
        let c = add(&mut threads, "c", 3);

        let mut head = None;
        for tid in [a, b, c] {
            insert_by(&mut threads, &mut head, tid, prio_precedes);
        }
        assert!(remove(&mut threads, &mut head, b));
        assert!(!remove(&mut threads, &mut head, b));
        let order: Vec<ThreadId> = iter(&threads, head).collect();
        assert_eq!(order, [a, c]);
        assert_eq!(threads[b].se.next, None);
    }

    #[test]
    fn test_resort_after_aging() {
        let mut threads = Threads::new();
        let a = add(&mut threads, "a", 10);
        let b = add(&mut threads, "b", 20);

        let mut ready = ReadyList::new();
        ready.insert_by(&mut threads, a, prio_precedes);
        ready.insert_by(&mut threads, b, prio_precedes);
        assert_eq!(ready.head(), Some(a));

        threads[b].dprio = 15;
        ready.resort(&mut threads, prio_precedes);
        assert_eq!(ready.iter(&threads).collect::<Vec<_>>(), [b, a]);
        assert_eq!(ready.len(), 2);
    }

    #[test]
    fn test_ready_list_tracks_on_rq() {
        let mut threads = Threads::new();
        let a = add(&mut threads, "a", 1);
        let mut ready = ReadyList::new();

        ready.insert_by(&mut threads, a, prio_precedes);
        assert!(threads[a].on_rq);
        assert!(ready.remove(&mut threads, a));
        assert!(!threads[a].on_rq);
        assert!(!ready.remove(&mut threads, a));
        assert!(ready.is_empty());
    }

    #[test]
    fn test_first_runnable_skips_blocked() {
        let mut threads = Threads::new();
        let a = add(&mut threads, "a", 1);
        let b = add(&mut threads, "b", 2);
        let mut ready = ReadyList::new();
        ready.insert_by(&mut threads, a, prio_precedes);
        ready.insert_by(&mut threads, b, prio_precedes);

        threads[a].flags.remove(crate::thread::ThreadFlags::RUNNING);
        assert_eq!(ready.first_runnable(&threads), Some(b));
    }
}
