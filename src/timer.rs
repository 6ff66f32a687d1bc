//! # Timers
//!
//! One-shot and periodic timers anchored to a [`ClockSource`]. A timer
//! carries an action of the clock source's choosing; the kernel uses it to
//! wake sleepers, expire timed waits and call user callbacks.

use crate::clocksource::{ClockSource, Tick};
use crate::error::Result;

/// Handle to an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u32);

/// Timer mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    /// Fires once, then is freed.
    OneShot,
    /// Fires every interval until stopped.
    Periodic,
}

/// A pending timer.
#[derive(Debug, Clone)]
pub struct Timer<A> {
    pub id: TimerId,
    /// Absolute tick at which the timer fires.
    pub expire_at: Tick,
    /// Re-arm interval in ticks. Zero for one-shot timers.
    pub interval: Tick,
    pub action: A,
}

impl<A> Timer<A> {
    #[inline]
    pub fn is_periodic(&self) -> bool {
        self.interval > 0
    }
}

impl<A: Copy> ClockSource<A> {
    /// Arm a timer that fires `ms` milliseconds from now.
    ///
    /// # Errors
    /// `OutOfMemory` when the timer list cannot grow; nothing is armed.
    pub fn timer_create(&self, ms: u32, mode: TimerMode, action: A) -> Result<TimerId> {
        let ticks = self.ms_to_ticks(ms);
        self.timer_create_ticks(ticks, mode, action)
    }

    /// Arm a timer that fires `ticks` clock ticks from now.
    pub fn timer_create_ticks(&self, ticks: Tick, mode: TimerMode, action: A) -> Result<TimerId> {
        let id = {
            let mut list = self.list.lock();
            let id = TimerId(list.next_id);
            list.next_id = list.next_id.wrapping_add(1);
            id
        };

        let interval = match mode {
            TimerMode::OneShot => 0,
            // A zero-length period would fire forever within one process().
            TimerMode::Periodic => ticks.max(1),
        };

        self.insert_timer(Timer {
            id,
            expire_at: self.get_tick() + ticks,
            interval,
            action,
        })?;
        log::trace!("timer {:?} armed, {} ticks", id, ticks);
        Ok(id)
    }

    /// Stop a pending timer.
    ///
    /// Returns `false` when the timer already fired or was stopped before.
    pub fn timer_stop(&self, id: TimerId) -> bool {
        self.remove_timer(id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Action {
        Ping,
        Pong,
    }

    #[test]
    fn test_oneshot_fires_once() {
        let cs: ClockSource<Action> = ClockSource::new("sys", 1000);
        let id = cs.timer_create(3, TimerMode::OneShot, Action::Ping).unwrap();

        let mut fired = Vec::new();
        for _ in 0..10 {
            cs.tick();
            cs.process(|tid, a| fired.push((tid, a)));
        }
        assert_eq!(fired, [(id, Action::Ping)]);
        assert_eq!(cs.pending(), 0);
        assert!(!cs.timer_stop(id));
    }

    #[test]
    fn test_periodic_fires_until_stopped() {
        let cs: ClockSource<Action> = ClockSource::new("sys", 1000);
        let id = cs.timer_create(2, TimerMode::Periodic, Action::Pong).unwrap();

        let mut count = 0;
        for _ in 0..6 {
            cs.tick();
            count += cs.process(|_, _| {});
        }
        assert_eq!(count, 3);
        assert!(cs.timer_stop(id));

        for _ in 0..6 {
            cs.tick();
            count += cs.process(|_, _| {});
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn test_zero_delay_fires_on_next_process() {
        let cs: ClockSource<Action> = ClockSource::new("sys", 1000);
        cs.timer_create(0, TimerMode::OneShot, Action::Ping).unwrap();
        assert_eq!(cs.process(|_, _| {}), 1);
    }

    #[test]
    fn test_stopped_timer_never_fires() {
        let cs: ClockSource<Action> = ClockSource::new("sys", 1000);
        let a = cs.timer_create(1, TimerMode::OneShot, Action::Ping).unwrap();
        let b = cs.timer_create(1, TimerMode::OneShot, Action::Pong).unwrap();
        assert_ne!(a, b);
        assert!(cs.timer_stop(a));

        cs.tick();
        let mut fired = Vec::new();
        cs.process(|_, act| fired.push(act));
        assert_eq!(fired, [Action::Pong]);
    }
}
