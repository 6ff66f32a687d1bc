//! # Condition Variables
//!
//! A condition variable bound to its own mutex. A waiter must hold the
//! mutex; waiting releases it (whatever its recursion depth) and blocks on
//! the condition queue in one step under the run-queue lock, so no signal
//! slips in between.
//!
//! A released waiter does not run until it owns the mutex again. If the
//! mutex is taken when the waiter is signaled or times out, the waiter is
//! moved over to the mutex queue and resumes when ownership is handed to
//! it, with a recursion depth of one.

use crate::arch::Port;
use crate::error::Result;
use crate::event::{QueueId, QueueKind};
use crate::kernel::Kernel;
use crate::mutex::Mutex;
use crate::sched::SchedClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Condition {
    queue: QueueId,
    mutex: Mutex,
}

impl Condition {
    /// The mutex guarding this condition.
    pub fn mutex(&self) -> &Mutex {
        &self.mutex
    }
}

impl<C: SchedClass, P: Port> Kernel<C, P> {
    pub fn cond_create(&self) -> Result<Condition> {
        let mut rq = self.lock();
        let mutex = Mutex(rq.queue_create(QueueKind::Mutex)?);
        let queue = match rq.queue_create(QueueKind::Condition) {
            Ok(queue) => queue,
            Err(e) => {
                rq.queue_destroy(mutex.0)?;
                return Err(e);
            }
        };
        Ok(Condition { queue, mutex })
    }

    /// Destroy a condition together with its mutex. The handle must not be
    /// used afterwards.
    ///
    /// # Errors
    /// `Busy` while the mutex is held or threads wait on either queue;
    /// nothing is destroyed then.
    pub fn cond_destroy(&self, c: Condition) -> Result<()> {
        let mut rq = self.lock();
        rq.queue_check_idle(c.queue)?;
        rq.queue_check_idle(c.mutex.0)?;
        rq.queue_destroy(c.queue)?;
        rq.queue_destroy(c.mutex.0)
    }

    pub fn cond_lock(&self, c: &Condition) -> Result<()> {
        self.mutex_lock(&c.mutex)
    }

    pub fn cond_unlock(&self, c: &Condition) {
        self.mutex_unlock(&c.mutex);
    }

    /// Wait until signaled. Returns with the mutex held.
    ///
    /// # Panics
    /// When the caller does not hold the mutex.
    pub fn cond_wait(&self, c: &Condition) -> Result<()> {
        self.cond_wait_for(c, None)
    }

    /// Wait until signaled or `timeout_ms` elapsed. Returns with the mutex
    /// held either way.
    ///
    /// # Errors
    /// - `TimedOut` when the timeout expired first.
    /// - `OutOfMemory` when the timeout cannot be armed. The caller keeps
    ///   the mutex at its recursion depth and never waited.
    pub fn cond_wait_for(&self, c: &Condition, timeout_ms: Option<u32>) -> Result<()> {
        let mut rq = self.lock();
        let cur = rq.current_id();
        if rq.queue(c.mutex.0).owner != Some(cur) {
            panic!("condition waited on without holding its mutex");
        }
        // The timeout is the only step that can fail; arm it while the
        // mutex is still held.
        let slot = self.arm_wait_timeout(cur, c.queue, timeout_ms)?;
        rq.threads[cur].relock = Some(c.mutex.0);
        rq.mutex_release_all(c.mutex.0, cur, self.clock());
        self.park_current(rq, c.queue, slot)
    }

    /// Release the most favorable waiter.
    pub fn cond_signal(&self, c: &Condition) {
        self.lock().wake_one(c.queue, self.clock());
        self.preempt_schedule();
    }

    /// Release every waiter.
    pub fn cond_broadcast(&self, c: &Condition) {
        {
            let mut rq = self.lock();
            while rq.queue(c.queue).head.has_waiters() {
                rq.wake_one(c.queue, self.clock());
            }
        }
        self.preempt_schedule();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::kernel::tests::{boot, spawn};
    use crate::thread::{ThreadState, WakeReason};

    #[test]
    fn test_signaled_waiter_runs_after_mutex_handoff() {
        let k = boot();
        let a = spawn(&k, "consumer", 10);
        let b = spawn(&k, "producer", 20);
        let c = k.cond_create().unwrap();

        k.cond_lock(&c).unwrap();
        k.mutex_lock(c.mutex()).unwrap();
        assert_eq!(k.mutex_lock_count(c.mutex()), 2);
        assert_eq!(k.cond_wait(&c), Err(Error::Suspended));
        assert_eq!(k.current(), Some(b));
        assert_eq!(k.mutex_owner(c.mutex()), None);

        k.cond_lock(&c).unwrap();
        k.cond_signal(&c);
        // Still waiting, now for the mutex
        assert_eq!(k.thread_state(a), Some(ThreadState::Waiting));
        assert_eq!(k.current(), Some(b));

        k.cond_unlock(&c);
        assert_eq!(k.current(), Some(a));
        assert_eq!(k.mutex_owner(c.mutex()), Some(a));
        assert_eq!(k.mutex_lock_count(c.mutex()), 1);
        assert_eq!(k.wake_reason(a), Some(WakeReason::Notified));
    }

    #[test]
    fn test_signal_with_free_mutex_wakes_directly() {
        let k = boot();
        let a = spawn(&k, "a", 10);
        spawn(&k, "b", 20);
        let c = k.cond_create().unwrap();

        k.cond_lock(&c).unwrap();
        k.cond_wait(&c).unwrap_err();
        k.cond_signal(&c);
        assert_eq!(k.current(), Some(a));
        assert_eq!(k.mutex_owner(c.mutex()), Some(a));
    }

    #[test]
    fn test_timeout_still_reacquires_mutex() {
        let k = boot();
        let a = spawn(&k, "a", 10);
        let b = spawn(&k, "b", 20);
        let c = k.cond_create().unwrap();

        k.cond_lock(&c).unwrap();
        assert_eq!(k.cond_wait_for(&c, Some(5)), Err(Error::Suspended));
        k.cond_lock(&c).unwrap();
        for _ in 0..5 {
            k.timer_interrupt();
        }
        assert_eq!(k.thread_state(a), Some(ThreadState::Waiting));
        assert_eq!(k.current(), Some(b));

        k.cond_unlock(&c);
        assert_eq!(k.current(), Some(a));
        assert_eq!(k.mutex_owner(c.mutex()), Some(a));
        assert_eq!(k.wake_reason(a), Some(WakeReason::TimedOut));
    }

    #[test]
    fn test_broadcast_releases_all_in_order() {
        let k = boot();
        let a = spawn(&k, "a", 10);
        let c_thread = spawn(&k, "c", 15);
        let b = spawn(&k, "b", 20);
        let c = k.cond_create().unwrap();

        k.cond_lock(&c).unwrap();
        k.cond_wait(&c).unwrap_err();
        assert_eq!(k.current(), Some(c_thread));
        k.cond_lock(&c).unwrap();
        k.cond_wait(&c).unwrap_err();
        assert_eq!(k.current(), Some(b));

        k.cond_lock(&c).unwrap();
        k.cond_broadcast(&c);
        k.cond_unlock(&c);
        assert_eq!(k.current(), Some(a));
        assert_eq!(k.thread_state(c_thread), Some(ThreadState::Waiting));

        k.cond_unlock(&c);
        assert_eq!(k.mutex_owner(c.mutex()), Some(c_thread));
        assert_eq!(k.thread_state(c_thread), Some(ThreadState::Ready));
    }

    #[test]
    fn test_failed_timeout_arm_keeps_mutex_and_state() {
        let k = boot();
        let a = spawn(&k, "a", 10);
        let b = spawn(&k, "b", 20);
        let c = k.cond_create().unwrap();

        k.cond_lock(&c).unwrap();
        k.mutex_lock(c.mutex()).unwrap();
        k.clock().fail_next_insert();
        assert_eq!(k.cond_wait_for(&c, Some(10)), Err(Error::OutOfMemory));
        assert_eq!(k.current(), Some(a));
        assert_eq!(k.mutex_owner(c.mutex()), Some(a));
        assert_eq!(k.mutex_lock_count(c.mutex()), 2);
        k.cond_unlock(&c);
        k.cond_unlock(&c);

        // A later plain wait is not rerouted onto the condition's mutex.
        let ev = k.event_create().unwrap();
        assert_eq!(k.wait(&ev, None), Err(Error::Suspended));
        assert_eq!(k.current(), Some(b));
        k.cond_lock(&c).unwrap();
        k.notify(&ev);
        assert_eq!(k.current(), Some(a));
        assert_eq!(k.wake_reason(a), Some(WakeReason::Notified));
        assert_eq!(k.mutex_owner(c.mutex()), Some(b));
    }

    #[test]
    fn test_destroy_is_all_or_nothing() {
        let k = boot();
        spawn(&k, "a", 10);
        let c = k.cond_create().unwrap();

        k.cond_lock(&c).unwrap();
        assert_eq!(k.cond_destroy(c), Err(Error::Busy));
        k.with_rq(|rq| {
            assert_eq!(rq.queue(c.queue).kind, QueueKind::Condition);
            assert_eq!(rq.queue(c.mutex.0).kind, QueueKind::Mutex);
        });

        k.cond_unlock(&c);
        k.cond_destroy(c).unwrap();
        let again = k.cond_create().unwrap();
        assert_eq!(again.mutex.0, c.mutex.0);
        assert_eq!(again.queue, c.queue);
    }

    #[test]
    #[should_panic(expected = "without holding its mutex")]
    fn test_wait_without_mutex_is_fatal() {
        let k = boot();
        spawn(&k, "a", 10);
        let c = k.cond_create().unwrap();
        let _ = k.cond_wait(&c);
    }
}
