//! # Mutex
//!
//! Recursive mutex on a thread queue. The owner may lock it again any
//! number of times and must unlock it as often. On the final unlock the
//! mutex is handed straight to the most favorable waiter, which wakes up
//! already owning it.
//!
//! Unlocking a mutex the caller does not own is a contract violation and
//! panics.

use crate::arch::Port;
use crate::error::{Error, Result};
use crate::event::{QueueId, QueueKind};
use crate::kernel::Kernel;
use crate::sched::rq::KernelClock;
use crate::sched::{RunQueue, SchedClass};
use crate::thread::ThreadId;

/// Handle to a kernel mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mutex(pub(crate) QueueId);

impl<C: SchedClass> RunQueue<C> {
    /// Take `m` for `tid` if it is free or already held by `tid`.
    pub(crate) fn mutex_try_take(&mut self, m: QueueId, tid: ThreadId) -> bool {
        let q = self.queue_mut(m);
        match q.owner {
            None => {
                q.owner = Some(tid);
                q.count = 1;
                true
            }
            Some(owner) if owner == tid => {
                q.count += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Drop one level of ownership. The last one passes the mutex to the
    /// head waiter.
    pub(crate) fn mutex_give(&mut self, m: QueueId, tid: ThreadId, clock: &KernelClock) {
        let q = self.queue_mut(m);
        if q.owner != Some(tid) {
            panic!("mutex unlocked by a thread that does not own it");
        }
        q.count -= 1;
        if q.count > 0 {
            return;
        }
        q.owner = None;

        let Some(next) = q.head.first() else {
            return;
        };
        self.release_waiter(next, clock);
        let q = self.queue_mut(m);
        q.owner = Some(next);
        q.count = 1;
        self.make_runnable(next, clock.get_tick());
    }

    /// Give up a mutex entirely, whatever its depth.
    pub(crate) fn mutex_release_all(&mut self, m: QueueId, tid: ThreadId, clock: &KernelClock) {
        self.queue_mut(m).count = 1;
        self.mutex_give(m, tid, clock);
    }
}

impl<C: SchedClass, P: Port> Kernel<C, P> {
    pub fn mutex_create(&self) -> Result<Mutex> {
        self.lock().queue_create(QueueKind::Mutex).map(Mutex)
    }

    /// Destroy a mutex. Its handle must not be used afterwards.
    ///
    /// # Errors
    /// `Busy` while a thread owns it or waits on it.
    pub fn mutex_destroy(&self, m: Mutex) -> Result<()> {
        self.lock().queue_destroy(m.0)
    }

    /// Lock `m`, blocking while another thread owns it.
    pub fn mutex_lock(&self, m: &Mutex) -> Result<()> {
        self.mutex_lock_timeout(m, None)
    }

    /// Lock `m`, waiting at most `timeout_ms` when given.
    ///
    /// # Errors
    /// `TimedOut` when the mutex did not come free in time.
    pub fn mutex_lock_timeout(&self, m: &Mutex, timeout_ms: Option<u32>) -> Result<()> {
        let mut rq = self.lock();
        let cur = rq.current_id();
        if rq.mutex_try_take(m.0, cur) {
            return Ok(());
        }
        self.block_current(rq, m.0, timeout_ms)
    }

    /// Lock `m` only if that does not block.
    ///
    /// # Errors
    /// `Busy` when another thread owns it.
    pub fn mutex_try_lock(&self, m: &Mutex) -> Result<()> {
        let mut rq = self.lock();
        let cur = rq.current_id();
        if rq.mutex_try_take(m.0, cur) {
            Ok(())
        } else {
            Err(Error::Busy)
        }
    }

    /// # Panics
    /// When the caller does not own `m`.
    pub fn mutex_unlock(&self, m: &Mutex) {
        {
            let mut rq = self.lock();
            let cur = rq.current_id();
            rq.mutex_give(m.0, cur, self.clock());
        }
        self.preempt_schedule();
    }

    pub fn mutex_owner(&self, m: &Mutex) -> Option<ThreadId> {
        self.lock().queue(m.0).owner
    }

    /// Recursion depth of the owner, zero when free.
    pub fn mutex_lock_count(&self, m: &Mutex) -> u32 {
        self.lock().queue(m.0).count
    }
}
