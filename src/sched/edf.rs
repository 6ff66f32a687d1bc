//! Earliest-deadline-first class.
//!
//! Every time a thread enters the ready set it receives an absolute deadline
//! of `now + ratio(prio)`. The thread with the earliest deadline runs; equal
//! deadlines keep arrival order.
//!
//! The idle thread's deadline is pushed [`EDF_IDLE_BIAS_DAYS`] days into the
//! future, converted with the tick rate the class was built for, so it only
//! runs when nothing else is ready.

use super::{ReadyList, SchedClass};
use crate::clocksource::Tick;
use crate::config::{EDF_IDLE_BIAS_DAYS, TICK_HZ};
use crate::thread::{Thread, ThreadId, Threads};

const fn build_ratio_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut p = 0;
    while p < 256 {
        table[p] = (13 * p / 24 + 10) as u8;
        p += 1;
    }
    table
}

static RATIO: [u8; 256] = build_ratio_table();

/// Relative deadline budget, in ticks, of a thread with nice value `prio`.
#[inline]
pub fn ratio(prio: u8) -> Tick {
    RATIO[prio as usize] as Tick
}

#[derive(Debug)]
pub struct Edf {
    ready: ReadyList,
    idle_bias: Tick,
}

impl Edf {
    /// EDF class for a clock running at `tick_hz`.
    pub const fn new(tick_hz: u32) -> Self {
        Self {
            ready: ReadyList::new(),
            idle_bias: EDF_IDLE_BIAS_DAYS * 86_400 * tick_hz as u64,
        }
    }

    /// Ticks the idle thread's deadline is pushed out by.
    pub fn idle_bias(&self) -> Tick {
        self.idle_bias
    }
}

impl Default for Edf {
    fn default() -> Self {
        Self::new(TICK_HZ)
    }
}

impl SchedClass for Edf {
    const NAME: &'static str = "edf";

    fn ready(&self) -> &ReadyList {
        &self.ready
    }

    fn ready_mut(&mut self) -> &mut ReadyList {
        &mut self.ready
    }

    fn precedes(new: &Thread, existing: &Thread) -> bool {
        new.se.deadline < existing.se.deadline
    }

    fn add_thread(&mut self, threads: &mut Threads, tid: ThreadId, now: Tick) {
        let t = &mut threads[tid];
        t.se.deadline = if t.is_idle() {
            now.saturating_add(self.idle_bias)
        } else {
            now + ratio(t.effective_prio())
        };
        self.ready.insert_by(threads, tid, Self::precedes);
    }

    fn preempt_check(&self, threads: &Threads, current: ThreadId, candidate: ThreadId) -> bool {
        let (cur, cand) = (&threads[current], &threads[candidate]);
        if cand.se.deadline == cur.se.deadline {
            return cand.effective_prio() < cur.effective_prio();
        }
        cand.se.deadline < cur.se.deadline
    }

    /// Deadlines are fixed at insertion; aging only affects the budget of
    /// the next insertion.
    fn dyn_prio_update(&mut self, threads: &mut Threads, delta: u8) {
        let mut cursor = self.ready.head();
        while let Some(tid) = cursor {
            let t = &mut threads[tid];
            if !t.is_idle() {
                t.dprio = t.dprio.saturating_add(delta);
            }
            cursor = t.se.next;
        }
    }

    fn reorder(&mut self, _threads: &mut Threads) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::tests::add;
    use crate::thread::ThreadFlags;

    #[test]
    fn test_ratio_table() {
        assert_eq!(ratio(0), 10);
        assert_eq!(ratio(24), 23);
        assert_eq!(ratio(128), 79);
        assert_eq!(ratio(255), 148);
    }

    #[test]
    fn test_earliest_deadline_first() {
        let mut threads = Threads::new();
        let mut edf = Edf::new(1000);
        let nice0 = add(&mut threads, "nice0", 0);
        let nice128 = add(&mut threads, "nice128", 128);
        let nice255 = add(&mut threads, "nice255", 255);

        for tid in [nice255, nice128, nice0] {
            edf.add_thread(&mut threads, tid, 100);
        }
        assert_eq!(edf.next_runnable(&threads), Some(nice0));
        assert_eq!(threads[nice0].se.deadline, 110);
        assert_eq!(threads[nice255].se.deadline, 248);

        let order: alloc::vec::Vec<_> = edf.ready().iter(&threads).collect();
        assert_eq!(order, [nice0, nice128, nice255]);
    }

    #[test]
    fn test_later_arrival_loses_to_earlier_deadline() {
        let mut threads = Threads::new();
        let mut edf = Edf::new(1000);
        let slow = add(&mut threads, "slow", 200);
        let fast = add(&mut threads, "fast", 0);

        edf.add_thread(&mut threads, slow, 0);
        // deadline 0 + 118 vs 100 + 10
        edf.add_thread(&mut threads, fast, 100);
        assert_eq!(edf.next_runnable(&threads), Some(fast));
        assert!(edf.preempt_check(&threads, slow, fast));
        assert!(!edf.preempt_check(&threads, fast, slow));
    }

    #[test]
    fn test_deadline_tie_falls_back_to_priority() {
        let mut threads = Threads::new();
        let edf = Edf::new(1000);
        let a = add(&mut threads, "a", 50);
        let b = add(&mut threads, "b", 40);
        threads[a].se.deadline = 500;
        threads[b].se.deadline = 500;

        assert!(edf.preempt_check(&threads, a, b));
        assert!(!edf.preempt_check(&threads, b, a));
    }

    #[test]
    fn test_idle_bias_follows_tick_rate() {
        let mut threads = Threads::new();
        let mut edf = Edf::new(100);
        assert_eq!(edf.idle_bias(), 500 * 86_400 * 100);

        let idle = add(&mut threads, "idle", 255);
        threads[idle].flags.insert(ThreadFlags::IDLE);
        let a = add(&mut threads, "a", 255);

        edf.add_thread(&mut threads, idle, 0);
        edf.add_thread(&mut threads, a, 1_000_000);
        assert_eq!(threads[idle].se.deadline, edf.idle_bias());
        assert_eq!(edf.next_runnable(&threads), Some(a));
    }
}
