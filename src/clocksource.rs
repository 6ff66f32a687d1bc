//! # Clock Source
//!
//! Monotonic hardware tick counter feeding every timing decision, and owner
//! of the ordered list of pending timers anchored to it.
//!
//! ```text
//!   timer IRQ ──► tick() ── count += 1
//!
//!   schedule() ──► process() ── fire every timer with expire_at <= now
//!                                 ├─ one-shot: dropped
//!                                 └─ periodic: re-inserted at expire_at + interval
//! ```
//!
//! Timers are kept in non-decreasing `expire_at` order; timers with equal
//! expiry keep their insertion order. Insertion is O(n), which is fine for
//! the handful of timers an embedded system runs.

use alloc::vec::Vec;
use core::cell::Cell;
use core::cmp::Ordering;

use crate::error::{Error, Result};
use crate::sync::IrqSpinLock;
use crate::timer::{Timer, TimerId};

/// Clock ticks since the source started.
pub type Tick = u64;

pub(crate) struct TimerList<A> {
    pub(crate) timers: Vec<Timer<A>>,
    pub(crate) next_id: u32,
}

/// A tick counter with the timers that run off it.
///
/// `A` is the action a timer carries; the owner of the clock source decides
/// what firing a timer means.
pub struct ClockSource<A> {
    name: &'static str,
    freq: u32,
    count: critical_section::Mutex<Cell<Tick>>,
    pub(crate) list: IrqSpinLock<TimerList<A>>,
    #[cfg(test)]
    fail_next_insert: core::sync::atomic::AtomicBool,
}

impl<A: Copy> ClockSource<A> {
    /// Create a clock source ticking at `freq` Hz.
    pub const fn new(name: &'static str, freq: u32) -> Self {
        Self {
            name,
            freq,
            count: critical_section::Mutex::new(Cell::new(0)),
            list: IrqSpinLock::new(TimerList {
                timers: Vec::new(),
                next_id: 0,
            }),
            #[cfg(test)]
            fail_next_insert: core::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Tick frequency in Hz.
    pub fn freq(&self) -> u32 {
        self.freq
    }

    /// Advance the counter by one tick. Called from the timer IRQ only.
    #[inline]
    pub fn tick(&self) {
        critical_section::with(|cs| {
            let count = self.count.borrow(cs);
            count.set(count.get().wrapping_add(1));
        });
    }

    /// Current tick count. Safe with interrupts enabled: the 64-bit read
    /// happens with interrupts masked so it cannot tear.
    #[inline]
    pub fn get_tick(&self) -> Tick {
        critical_section::with(|cs| self.count.borrow(cs).get())
    }

    /// Convert milliseconds to ticks of this source.
    pub fn ms_to_ticks(&self, ms: u32) -> Tick {
        (ms as u64 * self.freq as u64) / 1000
    }

    /// Insert a timer, keeping the list sorted by expiration tick.
    pub fn insert_timer(&self, timer: Timer<A>) -> Result<()> {
        self.insert_timer_by(timer, |a, b| a.expire_at.cmp(&b.expire_at))
    }

    /// Insert a timer after every entry that does not compare greater
    /// than it under `cmp`.
    pub fn insert_timer_by<F>(&self, timer: Timer<A>, cmp: F) -> Result<()>
    where
        F: Fn(&Timer<A>, &Timer<A>) -> Ordering,
    {
        #[cfg(test)]
        if self.fail_next_insert.swap(false, core::sync::atomic::Ordering::Relaxed) {
            return Err(Error::OutOfMemory);
        }
        let mut list = self.list.lock();
        list.timers.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        raw_insert(&mut list.timers, timer, cmp);
        Ok(())
    }

    /// Make the next timer insertion fail as if the allocator ran dry.
    #[cfg(test)]
    pub(crate) fn fail_next_insert(&self) {
        self.fail_next_insert
            .store(true, core::sync::atomic::Ordering::Relaxed);
    }

    /// Remove a pending timer. Returns `None` when it already fired
    /// (one-shot) or was never armed on this source.
    pub fn remove_timer(&self, id: TimerId) -> Option<Timer<A>> {
        let mut list = self.list.lock();
        let pos = list.timers.iter().position(|t| t.id == id)?;
        Some(list.timers.remove(pos))
    }

    /// Pop the earliest timer if it has expired at `now`.
    ///
    /// Periodic timers are re-armed one interval later before returning.
    /// The lock is dropped before the caller acts on the returned action, so
    /// handlers may arm or stop timers themselves.
    pub fn next_expired(&self, now: Tick) -> Option<(TimerId, A)> {
        let mut list = self.list.lock();
        if list.timers.first()?.expire_at > now {
            return None;
        }

        let mut timer = list.timers.remove(0);
        let fired = (timer.id, timer.action);
        if timer.interval > 0 {
            timer.expire_at += timer.interval;
            // Capacity is still there from the removal, no allocation.
            raw_insert(&mut list.timers, timer, |a, b| a.expire_at.cmp(&b.expire_at));
        }
        Some(fired)
    }

    /// Fire every timer that expired by the current tick.
    ///
    /// Returns the number of timers fired.
    pub fn process<F>(&self, mut fire: F) -> usize
    where
        F: FnMut(TimerId, A),
    {
        let now = self.get_tick();
        let mut fired = 0;
        while let Some((id, action)) = self.next_expired(now) {
            fire(id, action);
            fired += 1;
        }
        fired
    }

    /// Number of armed timers.
    pub fn pending(&self) -> usize {
        self.list.lock().timers.len()
    }

    /// Expiration tick of the earliest armed timer.
    pub fn next_expiry(&self) -> Option<Tick> {
        self.list.lock().timers.first().map(|t| t.expire_at)
    }
}

fn raw_insert<A, F>(timers: &mut Vec<Timer<A>>, timer: Timer<A>, cmp: F)
where
    F: Fn(&Timer<A>, &Timer<A>) -> Ordering,
{
    let pos = timers
        .iter()
        .position(|t| cmp(t, &timer) == Ordering::Greater)
        .unwrap_or(timers.len());
    timers.insert(pos, timer);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer(id: u32, expire_at: Tick, interval: Tick) -> Timer<u32> {
        Timer {
            id: TimerId(id),
            expire_at,
            interval,
            action: id,
        }
    }

    #[test]
    fn test_tick_counter() {
        let cs: ClockSource<u32> = ClockSource::new("sys", 1000);
        assert_eq!(cs.get_tick(), 0);
        for _ in 0..5 {
            cs.tick();
        }
        assert_eq!(cs.get_tick(), 5);
        assert_eq!(cs.name(), "sys");
    }

    #[test]
    fn test_ms_conversion() {
        let cs: ClockSource<u32> = ClockSource::new("fast", 4000);
        assert_eq!(cs.ms_to_ticks(10), 40);
        let slow: ClockSource<u32> = ClockSource::new("slow", 100);
        assert_eq!(slow.ms_to_ticks(25), 2);
    }

    #[test]
    fn test_sorted_insertion_is_stable() {
        let cs: ClockSource<u32> = ClockSource::new("sys", 1000);
        cs.insert_timer(timer(1, 30, 0)).unwrap();
        cs.insert_timer(timer(2, 10, 0)).unwrap();
        cs.insert_timer(timer(3, 30, 0)).unwrap();
        cs.insert_timer(timer(4, 20, 0)).unwrap();

        let order: Vec<u32> = cs.list.lock().timers.iter().map(|t| t.action).collect();
        assert_eq!(order, [2, 4, 1, 3]);
        assert_eq!(cs.next_expiry(), Some(10));
    }

    #[test]
    fn test_remove_timer() {
        let cs: ClockSource<u32> = ClockSource::new("sys", 1000);
        cs.insert_timer(timer(1, 5, 0)).unwrap();
        cs.insert_timer(timer(2, 6, 0)).unwrap();

        assert_eq!(cs.remove_timer(TimerId(1)).map(|t| t.action), Some(1));
        assert!(cs.remove_timer(TimerId(1)).is_none());
        assert_eq!(cs.pending(), 1);
    }

    #[test]
    fn test_process_fires_expired_only() {
        let cs: ClockSource<u32> = ClockSource::new("sys", 1000);
        cs.insert_timer(timer(1, 2, 0)).unwrap();
        cs.insert_timer(timer(2, 4, 0)).unwrap();

        cs.tick();
        cs.tick();
        let mut fired = Vec::new();
        assert_eq!(cs.process(|_, a| fired.push(a)), 1);
        assert_eq!(fired, [1]);
        assert_eq!(cs.pending(), 1);
    }

    #[test]
    fn test_periodic_timer_rearms() {
        let cs: ClockSource<u32> = ClockSource::new("sys", 1000);
        cs.insert_timer(timer(7, 3, 3)).unwrap();

        let mut fired = 0;
        for _ in 0..9 {
            cs.tick();
            cs.process(|id, _| {
                assert_eq!(id, TimerId(7));
                fired += 1;
            });
        }
        assert_eq!(fired, 3);
        assert_eq!(cs.pending(), 1);
        assert_eq!(cs.next_expiry(), Some(12));
    }
}
