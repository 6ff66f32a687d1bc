//! Counting semaphore.
//!
//! `signal` with a waiter present hands the unit straight to the head
//! waiter; the count only grows when nobody waits.

use crate::arch::Port;
use crate::error::{Error, Result};
use crate::event::{QueueId, QueueKind};
use crate::kernel::Kernel;
use crate::sched::rq::KernelClock;
use crate::sched::{RunQueue, SchedClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Semaphore(pub(crate) QueueId);

impl<C: SchedClass> RunQueue<C> {
    fn sem_give(&mut self, s: QueueId, clock: &KernelClock) {
        match self.queue(s).head.first() {
            Some(next) => {
                self.release_waiter(next, clock);
                self.make_runnable(next, clock.get_tick());
            }
            None => {
                let q = self.queue_mut(s);
                q.count = q.count.saturating_add(1);
            }
        }
    }

    fn sem_try_take(&mut self, s: QueueId) -> bool {
        let q = self.queue_mut(s);
        if q.count == 0 {
            return false;
        }
        q.count -= 1;
        true
    }
}

impl<C: SchedClass, P: Port> Kernel<C, P> {
    /// Create a semaphore holding `initial` units.
    pub fn sem_create(&self, initial: u32) -> Result<Semaphore> {
        let mut rq = self.lock();
        let q = rq.queue_create(QueueKind::Semaphore)?;
        rq.queue_mut(q).count = initial;
        Ok(Semaphore(q))
    }

    /// Destroy a semaphore. Its handle must not be used afterwards.
    ///
    /// # Errors
    /// `Busy` while threads wait on it.
    pub fn sem_destroy(&self, s: Semaphore) -> Result<()> {
        self.lock().queue_destroy(s.0)
    }

    /// Take one unit, blocking until one is available.
    pub fn sem_wait(&self, s: &Semaphore) -> Result<()> {
        self.sem_wait_timeout(s, None)
    }

    /// Take one unit, waiting at most `timeout_ms` when given.
    pub fn sem_wait_timeout(&self, s: &Semaphore, timeout_ms: Option<u32>) -> Result<()> {
        let mut rq = self.lock();
        if rq.sem_try_take(s.0) {
            return Ok(());
        }
        self.block_current(rq, s.0, timeout_ms)
    }

    /// # Errors
    /// `Busy` when no unit is available.
    pub fn sem_try_wait(&self, s: &Semaphore) -> Result<()> {
        if self.lock().sem_try_take(s.0) {
            Ok(())
        } else {
            Err(Error::Busy)
        }
    }

    /// Release one unit. Thread context only.
    pub fn sem_signal(&self, s: &Semaphore) {
        self.lock().sem_give(s.0, self.clock());
        self.preempt_schedule();
    }

    /// Units currently available.
    pub fn sem_value(&self, s: &Semaphore) -> u32 {
        self.lock().queue(s.0).count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::{boot, spawn};
    use crate::thread::{ThreadState, WakeReason};

    #[test]
    fn test_destroy_frees_slot_for_reuse() {
        let k = boot();
        spawn(&k, "a", 10);
        let s = k.sem_create(3).unwrap();
        k.sem_destroy(s).unwrap();

        let t = k.sem_create(0).unwrap();
        assert_eq!(t, s);
        assert_eq!(k.sem_value(&t), 0);
        assert_eq!(k.sem_try_wait(&t), Err(Error::Busy));
    }

    #[test]
    fn test_counts_down_then_blocks() {
        let k = boot();
        let a = spawn(&k, "a", 10);
        let b = spawn(&k, "b", 20);
        let s = k.sem_create(2).unwrap();

        k.sem_wait(&s).unwrap();
        k.sem_wait(&s).unwrap();
        assert_eq!(k.sem_value(&s), 0);
        assert_eq!(k.sem_try_wait(&s), Err(Error::Busy));

        assert_eq!(k.sem_wait(&s), Err(Error::Suspended));
        assert_eq!(k.thread_state(a), Some(ThreadState::Waiting));
        assert_eq!(k.current(), Some(b));

        // Handed over, not counted
        k.sem_signal(&s);
        assert_eq!(k.current(), Some(a));
        assert_eq!(k.sem_value(&s), 0);
        assert_eq!(k.wake_reason(a), Some(WakeReason::Notified));
    }

    #[test]
    fn test_signal_without_waiters_counts_up() {
        let k = boot();
        spawn(&k, "a", 10);
        let s = k.sem_create(0).unwrap();
        k.sem_signal(&s);
        k.sem_signal(&s);
        assert_eq!(k.sem_value(&s), 2);
        assert_eq!(k.sem_try_wait(&s), Ok(()));
        assert_eq!(k.sem_value(&s), 1);
    }

    #[test]
    fn test_wait_timeout_expires() {
        let k = boot();
        let a = spawn(&k, "a", 10);
        let s = k.sem_create(0).unwrap();

        assert_eq!(k.sem_wait_timeout(&s, Some(3)), Err(Error::Suspended));
        for _ in 0..3 {
            k.timer_interrupt();
        }
        assert_eq!(k.current(), Some(a));
        assert_eq!(k.wake_reason(a), Some(WakeReason::TimedOut));

        // A later signal is counted, not lost to the timed-out waiter
        k.sem_signal(&s);
        assert_eq!(k.sem_value(&s), 1);
    }
}
