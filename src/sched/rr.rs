//! Round-robin class.
//!
//! The ready set is ordered by effective priority. Threads of equal priority
//! take turns: a thread re-entering the set goes behind every thread that is
//! at least as favorable, so the slice expiry of one hands the CPU to the
//! next of its level.

use super::{prio_precedes, ReadyList, SchedClass};
use crate::thread::{Thread, ThreadId, Threads};

#[derive(Debug, Default)]
pub struct RoundRobin {
    ready: ReadyList,
}

impl RoundRobin {
    pub const fn new() -> Self {
        Self {
            ready: ReadyList::new(),
        }
    }
}

impl SchedClass for RoundRobin {
    const NAME: &'static str = "rr";

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
    use alloc::vec::Vec;

    #[test]
    fn test_next_runnable_is_most_favorable() {
        let mut threads = Threads::new();
        let mut rr = RoundRobin::new();
        let low = add(&mut threads, "low", 200);
        let high = add(&mut threads, "high", 3);

        rr.add_thread(&mut threads, low, 0);
        rr.add_thread(&mut threads, high, 0);
        assert_eq!(rr.next_runnable(&threads), Some(high));
        assert_eq!(rr.nr_ready(), 2);
    }

    #[test]
    fn test_equal_priority_rotates() {
        let mut threads = Threads::new();
        let mut rr = RoundRobin::new();
        let a = add(&mut threads, "a", 50);
        let b = add(&mut threads, "b", 50);
        rr.add_thread(&mut threads, a, 0);
        rr.add_thread(&mut threads, b, 0);
        assert_eq!(rr.next_runnable(&threads), Some(a));

        // Slice of `a` ends: it is requeued behind `b`
        assert!(rr.rm_thread(&mut threads, a));
        rr.add_thread(&mut threads, a, 0);
        assert_eq!(rr.next_runnable(&threads), Some(b));
    }

    #[test]
    fn test_preempt_check_needs_strictly_better() {
        let mut threads = Threads::new();
        let rr = RoundRobin::new();
        let a = add(&mut threads, "a", 10);
        let b = add(&mut threads, "b", 10);
        let c = add(&mut threads, "c", 9);

        assert!(!rr.preempt_check(&threads, a, b));
        assert!(rr.preempt_check(&threads, a, c));
        assert!(!rr.preempt_check(&threads, c, a));
    }

    #[test]
    fn test_dyn_prio_aging_reorders() {
        let mut threads = Threads::new();
        let mut rr = RoundRobin::new();
        let a = add(&mut threads, "a", 10);
        let b = add(&mut threads, "b", 12);
        rr.add_thread(&mut threads, a, 0);
        rr.add_thread(&mut threads, b, 0);

        threads[a].dprio = 0;
        rr.dyn_prio_update(&mut threads, 1);
        assert_eq!(rr.next_runnable(&threads), Some(a));

        // `a` runs and loses its bonus; `b` keeps aging past it
        threads[a].dprio = 0;
        rr.dyn_prio_update(&mut threads, 2);
        threads[a].dprio = 0;
        rr.ready_mut().resort(&mut threads, RoundRobin::precedes);
        assert_eq!(rr.next_runnable(&threads), Some(b));
    }

    #[test]
    fn test_queue_orders_waiters_by_priority() {
        let mut threads = Threads::new();
        let mut rr = RoundRobin::new();
        let a = add(&mut threads, "a", 30);
        let b = add(&mut threads, "b", 10);
        let c = add(&mut threads, "c", 30);

        let mut head = QueueHead::Empty;
        for tid in [a, b, c] {
            rr.queue_add(&mut threads, &mut head, tid);
        }
        assert_eq!(head, QueueHead::Waiters(b));
        let order: Vec<_> = crate::sched::iter(&threads, head.first()).collect();
        assert_eq!(order, [b, a, c]);

        assert!(rr.queue_rm(&mut threads, &mut head, b));
        assert_eq!(head, QueueHead::Waiters(a));
        assert!(rr.queue_rm(&mut threads, &mut head, a));
        assert!(rr.queue_rm(&mut threads, &mut head, c));
        assert_eq!(head, QueueHead::Empty);
        assert!(!rr.queue_rm(&mut threads, &mut head, c));
    }

    #[test]
    fn test_queue_add_consumes_signal() {
        let mut threads = Threads::new();
        let mut rr = RoundRobin::new();
        let a = add(&mut threads, "a", 30);

        let mut head = QueueHead::Signaled;
        rr.queue_add(&mut threads, &mut head, a);
        assert_eq!(head, QueueHead::Waiters(a));
        assert_eq!(threads[a].event_count, 1);
    }
}
