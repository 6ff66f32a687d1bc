//! First-in first-out class.
//!
//! Ordered by effective priority like round-robin, but a running thread
//! keeps the CPU when its slice runs out. It only gives way when it blocks,
//! sleeps, yields or a strictly more favorable thread wakes up. Threads of
//! one priority level run in arrival order.

use super::{prio_precedes, ReadyList, SchedClass};
use crate::thread::{Thread, ThreadId, Threads};

#[derive(Debug, Default)]
pub struct Fifo {
    ready: ReadyList,
}

impl Fifo {
    pub const fn new() -> Self {
        Self {
            ready: ReadyList::new(),
        }
    }
}

impl SchedClass for Fifo {
    const NAME: &'static str = "fifo";
    const TIME_SLICED: bool = false;

    fn ready(&self) -> &ReadyList {
        &self.ready
    }

    fn ready_mut(&mut self) -> &mut ReadyList {
        &mut self.ready
    }

    fn precedes(new: &Thread, existing: &Thread) -> bool {
        prio_precedes(new, existing)
    }

    fn preempt_check(&self, threads: &Threads, current: ThreadId, candidate: ThreadId) -> bool {
        threads[candidate].effective_prio() < threads[current].effective_prio()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::QueueHead;
    use crate::thread::tests::add;
    use crate::thread::ThreadFlags;

    #[test]
    fn test_priority_then_arrival() {
        let mut threads = Threads::new();
        let mut fifo = Fifo::new();
        let a = add(&mut threads, "a", 40);
        let b = add(&mut threads, "b", 40);
        let c = add(&mut threads, "c", 7);

        fifo.add_thread(&mut threads, a, 0);
        fifo.add_thread(&mut threads, b, 0);
        assert_eq!(fifo.next_runnable(&threads), Some(a));

        fifo.add_thread(&mut threads, c, 0);
        assert_eq!(fifo.next_runnable(&threads), Some(c));
        assert!(fifo.preempt_check(&threads, a, c));
        assert!(!fifo.preempt_check(&threads, a, b));
    }

    #[test]
    fn test_idle_runs_last() {
        let mut threads = Threads::new();
        let mut fifo = Fifo::new();
        let idle = add(&mut threads, "idle", 255);
        threads[idle].flags.insert(ThreadFlags::IDLE);
        let a = add(&mut threads, "a", 255);

        fifo.add_thread(&mut threads, idle, 0);
        fifo.add_thread(&mut threads, a, 0);
        assert_eq!(fifo.next_runnable(&threads), Some(a));

        fifo.rm_thread(&mut threads, a);
        assert_eq!(fifo.next_runnable(&threads), Some(idle));
    }

    #[test]
    fn test_not_time_sliced() {
        assert!(!Fifo::TIME_SLICED);
        assert!(crate::sched::RoundRobin::TIME_SLICED);
    }

    #[test]
    fn test_queue_waiters_by_priority() {
        let mut threads = Threads::new();
        let mut fifo = Fifo::new();
        let a = add(&mut threads, "a", 90);
        let b = add(&mut threads, "b", 10);

        let mut head = QueueHead::Empty;
        fifo.queue_add(&mut threads, &mut head, a);
        fifo.queue_add(&mut threads, &mut head, b);
        assert_eq!(head.first(), Some(b));
    }
}
