//! Lottery class.
//!
//! Each thread holds tickets drawn from a shared pool: up to ten for the
//! most favorable nice values, one for nice 250 and above. Selection draws a
//! random ticket among the runnable threads, so a thread's share of the CPU
//! is proportional to its ticket count.
//!
//! The pool starts with [`LOTTERY_POOL_SIZE`] tickets and grows by
//! [`LOTTERY_RESIZE_SIZE`] whenever it runs dry, up to
//! [`LOTTERY_MAX_TICKETS`]. Past that limit a thread simply gets fewer
//! tickets; a ticketless thread still draws with a weight of one. Tickets
//! go back to the pool when their thread is reaped.

use alloc::vec::Vec;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::{prio_precedes, ReadyList, SchedClass};
use crate::clocksource::Tick;
use crate::config::{LOTTERY_MAX_TICKETS, LOTTERY_POOL_SIZE, LOTTERY_RESIZE_SIZE};
use crate::thread::{Thread, ThreadId, Threads, MAX_THREAD_TICKETS};

const DEFAULT_SEED: u64 = 0x00e7_a05e;

/// Number of tickets a thread with nice value `prio` asks for.
pub fn tickets_for(prio: u8) -> usize {
    if prio >= 250 {
        return 1;
    }
    ((250 - prio as usize + 12) / 25).clamp(1, MAX_THREAD_TICKETS)
}

pub struct Lottery {
    ready: ReadyList,
    free: Vec<u16>,
    minted: u16,
    seed: u64,
    rng: Option<SmallRng>,
}

impl Lottery {
    pub const fn new() -> Self {
        Self::with_seed(DEFAULT_SEED)
    }

    /// Lottery class whose draws are reproducible from `seed`.
    pub const fn with_seed(seed: u64) -> Self {
        Self {
            ready: ReadyList::new(),
            free: Vec::new(),
            minted: 0,
            seed,
            rng: None,
        }
    }

    /// Tickets minted so far.
    pub fn minted(&self) -> u16 {
        self.minted
    }

    /// Tickets in the pool, not held by any thread.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    fn grow(&mut self) -> bool {
        let step = if self.minted == 0 {
            LOTTERY_POOL_SIZE
        } else {
            LOTTERY_RESIZE_SIZE
        };
        let step = step.min(LOTTERY_MAX_TICKETS - self.minted);
        // Room for every minted ticket, so returning tickets never allocates.
        let want = (self.minted + step) as usize - self.free.len();
        if step == 0 || self.free.try_reserve(want).is_err() {
            return false;
        }
        self.free.extend(self.minted..self.minted + step);
        self.minted += step;
        log::trace!("lottery pool grown to {} tickets", self.minted);
        true
    }

    fn take_ticket(&mut self) -> Option<u16> {
        if self.free.is_empty() && !self.grow() {
            return None;
        }
        self.free.pop()
    }

    fn hand_out(&mut self, t: &mut Thread) {
        let want = tickets_for(t.prio);
        while t.se.tickets.len() < want {
            let Some(ticket) = self.take_ticket() else {
                break;
            };
            // Capacity is MAX_THREAD_TICKETS and `want` never exceeds it.
            let _ = t.se.tickets.push(ticket);
        }
    }

    fn rng(&mut self) -> &mut SmallRng {
        let seed = self.seed;
        self.rng.get_or_insert_with(|| SmallRng::seed_from_u64(seed))
    }
}

impl Default for Lottery {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn weight(t: &Thread) -> u32 {
    t.se.tickets.len().max(1) as u32
}

impl SchedClass for Lottery {
    const NAME: &'static str = "lottery";

    fn ready(&self) -> &ReadyList {
        &self.ready
    }

    fn ready_mut(&mut self) -> &mut ReadyList {
        &mut self.ready
    }

    fn precedes(new: &Thread, existing: &Thread) -> bool {
        prio_precedes(new, existing)
    }

    fn add_thread(&mut self, threads: &mut Threads, tid: ThreadId, _now: Tick) {
        if threads[tid].se.tickets.is_empty() {
            self.hand_out(&mut threads[tid]);
        }
        self.ready.insert_by(threads, tid, Self::precedes);
    }

    /// One pass to total the outstanding tickets, one pass to find the
    /// owner of the winning ticket. The idle thread never takes part unless
    /// it is the only runnable thread.
    fn next_runnable(&mut self, threads: &Threads) -> Option<ThreadId> {
        let contenders = || {
            self.ready
                .iter(threads)
                .filter(|&tid| threads[tid].is_runnable() && !threads[tid].is_idle())
        };

        let total: u32 = contenders().map(|tid| weight(&threads[tid])).sum();
        if total == 0 {
            return self.ready.first_runnable(threads);
        }

        let head = self.ready.head();
        let mut winner = self.rng().gen_range(0..total);
        for tid in super::iter(threads, head) {
            let t = &threads[tid];
            if !t.is_runnable() || t.is_idle() {
                continue;
            }
            let w = weight(t);
            if winner < w {
                return Some(tid);
            }
            winner -= w;
        }
        None
    }

    fn preempt_check(&self, _threads: &Threads, _current: ThreadId, _candidate: ThreadId) -> bool {
        false
    }

    fn kill(&mut self, threads: &mut Threads, tid: ThreadId) {
        let tickets = core::mem::take(&mut threads[tid].se.tickets);
        self.free.extend(tickets);
    }
}
