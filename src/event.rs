//! # Events and Thread Queues
//!
//! A thread queue is a list of blocked threads ordered by the active
//! scheduling class. Events, mutexes, semaphores, condition variables and
//! message queues are all built on one.
//!
//! ## Event semantics
//!
//! An event queue remembers a notification that found nobody waiting:
//!
//! ```text
//!   notify ──► Empty ───────────────► Signaled
//!   wait   ──► Signaled ─────────────► Empty, returns at once
//!   wait   ──► Empty | Waiters ──────► blocks (optionally with a timeout)
//!   notify ──► Waiters ──────────────► wakes the head waiter; an emptied
//!                                      queue is left Signaled
//! ```
//!
//! so a notify issued before the matching wait is never lost. A timed-out
//! waiter leaves the queue without latching anything.
//!
//! Interrupt handlers cannot run the full wake path. [`Kernel::notify_irq`]
//! only bumps the head waiter's event count; the next reschedule drains it.

use crate::arch::Port;
use crate::clocksource::Tick;
use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::sched::rq::KernelClock;
use crate::sched::{QueueHead, RunQueue, SchedClass};
use crate::thread::{ThreadId, ThreadState, TimerSlot};

/// Handle to a thread queue owned by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(u16);

impl QueueId {
    #[inline]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// What a thread queue backs. Decides the notification semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Event,
    Mutex,
    Semaphore,
    Condition,
    /// Slot of a destroyed queue, free for reuse.
    Free,
}

impl QueueKind {
    /// Whether a notification with nobody to wake is remembered.
    #[inline]
    pub fn latches(self) -> bool {
        self == QueueKind::Event
    }
}

/// Kernel side of a thread queue.
#[derive(Debug)]
pub struct ThreadQueue {
    pub head: QueueHead,
    pub kind: QueueKind,
    /// Mutex owner.
    pub owner: Option<ThreadId>,
    /// Mutex recursion depth or semaphore value.
    pub count: u32,
}

impl ThreadQueue {
    fn new(kind: QueueKind) -> Self {
        Self {
            head: QueueHead::Empty,
            kind,
            owner: None,
            count: 0,
        }
    }
}

/// A waitable event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event(pub(crate) QueueId);

impl Event {
    pub fn queue(&self) -> QueueId {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Run-queue side, lock held
// ---------------------------------------------------------------------------

impl<C: SchedClass> RunQueue<C> {
    pub(crate) fn queue_create(&mut self, kind: QueueKind) -> Result<QueueId> {
        if let Some(i) = self.queues.iter().position(|q| q.kind == QueueKind::Free) {
            self.queues[i] = ThreadQueue::new(kind);
            return Ok(QueueId(i as u16));
        }
        if self.queues.len() > u16::MAX as usize {
            return Err(Error::OutOfMemory);
        }
        self.queues.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        self.queues.push(ThreadQueue::new(kind));
        Ok(QueueId((self.queues.len() - 1) as u16))
    }

    /// Free the slot of `q` for reuse.
    ///
    /// # Errors
    /// - `InvalidHandle` when `q` is not a live queue.
    /// - `Busy` while threads wait on it or a thread owns it.
    pub(crate) fn queue_destroy(&mut self, q: QueueId) -> Result<()> {
        self.queue_check_idle(q)?;
        self.queues[q.index()] = ThreadQueue::new(QueueKind::Free);
        Ok(())
    }

    /// Whether `q` is live with neither waiters nor owner.
    pub(crate) fn queue_check_idle(&self, q: QueueId) -> Result<()> {
        let queue = self
            .queues
            .get(q.index())
            .filter(|queue| queue.kind != QueueKind::Free)
            .ok_or(Error::InvalidHandle)?;
        if queue.head.has_waiters() || queue.owner.is_some() {
            return Err(Error::Busy);
        }
        Ok(())
    }

    pub fn queue(&self, q: QueueId) -> &ThreadQueue {
        &self.queues[q.index()]
    }

    pub(crate) fn queue_mut(&mut self, q: QueueId) -> &mut ThreadQueue {
        &mut self.queues[q.index()]
    }

    /// Park `tid` on `q`. The thread leaves the ready set and joins the
    /// wake list until it is released.
    pub(crate) fn enqueue_waiter(&mut self, tid: ThreadId, q: QueueId, timer: TimerSlot) {
        self.block(tid, ThreadState::Waiting);
        let t = &mut self.threads[tid];
        t.timer = timer;
        t.queue = Some(q);
        let head = &mut self.queues[q.index()].head;
        self.class.queue_add(&mut self.threads, head, tid);
        self.wake_list_push(tid);
    }

    /// Unlink a waiter from its queue, cancelling an armed timeout.
    ///
    /// Returns the interrupt notifications the thread had not delivered
    /// yet; they belong to the queue, not to this thread.
    pub(crate) fn release_waiter(&mut self, tid: ThreadId, clock: &KernelClock) -> u8 {
        let Some(q) = self.threads[tid].queue.take() else {
            return 0;
        };
        let head = &mut self.queues[q.index()].head;
        self.class.queue_rm(&mut self.threads, head, tid);
        self.wake_list_remove(tid);

        let t = &mut self.threads[tid];
        if let TimerSlot::Armed(id) = t.timer {
            clock.timer_stop(id);
            t.timer = TimerSlot::None;
        }
        core::mem::take(&mut t.event_count)
    }

    /// Make a released waiter runnable, or move it over to the mutex it
    /// has to take back first.
    pub(crate) fn finish_wait(&mut self, tid: ThreadId, now: Tick) {
        match self.threads[tid].relock.take() {
            Some(m) if !self.mutex_try_take(m, tid) => {
                let slot = self.threads[tid].timer;
                self.enqueue_waiter(tid, m, slot);
            }
            _ => self.make_runnable(tid, now),
        }
    }

    /// Wake the head waiter of `q`.
    ///
    /// Undelivered interrupt notifications of the woken thread are passed
    /// on to the next waiter. On a latching queue, a notification that ends
    /// up with nobody to wake leaves the queue signaled.
    pub(crate) fn wake_one(&mut self, q: QueueId, clock: &KernelClock) -> Option<ThreadId> {
        let latch = self.queues[q.index()].kind.latches();
        let now = clock.get_tick();
        let mut pending: u32 = 1;
        let mut woken = None;

        while pending > 0 {
            pending -= 1;
            let head = self.queues[q.index()].head;
            let Some(h) = head.first() else {
                if latch {
                    self.queues[q.index()].head = QueueHead::Signaled;
                }
                break;
            };

            pending += self.release_waiter(h, clock) as u32;
            self.finish_wait(h, now);
            woken.get_or_insert(h);

            if latch && self.queues[q.index()].head == QueueHead::Empty {
                self.queues[q.index()].head = QueueHead::Signaled;
                break;
            }
        }
        woken
    }

    /// A timed wait expired: release the waiter without latching.
    pub(crate) fn wait_timed_out(&mut self, tid: ThreadId, q: QueueId, clock: &KernelClock) {
        let pending = self.release_waiter(tid, clock);
        self.finish_wait(tid, clock.get_tick());
        for _ in 0..pending {
            self.wake_one(q, clock);
        }
    }

    /// Deliver notifications posted from interrupt context.
    pub(crate) fn drain_events(&mut self, clock: &KernelClock) {
        while let Some(tid) = self.wake_list_find(|t| t.event_count > 0) {
            let pending = core::mem::take(&mut self.threads[tid].event_count);
            let Some(q) = self.threads[tid].queue else {
                continue;
            };
            for _ in 0..pending {
                self.wake_one(q, clock);
            }
        }
    }

    /// Interrupt-safe notification: no list is walked.
    pub(crate) fn notify_deferred(&mut self, q: QueueId) {
        let head = &mut self.queues[q.index()].head;
        match *head {
            QueueHead::Empty => *head = QueueHead::Signaled,
            QueueHead::Signaled => {}
            QueueHead::Waiters(h) => {
                let t = &mut self.threads[h];
                t.event_count = t.event_count.saturating_add(1);
                self.set_resched();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel API
// ---------------------------------------------------------------------------

impl<C: SchedClass, P: Port> Kernel<C, P> {
    /// Create an event in the unsignaled state.
    pub fn event_create(&self) -> Result<Event> {
        self.lock().queue_create(QueueKind::Event).map(Event)
    }

    /// Destroy an event. Its handle must not be used afterwards; the slot
    /// may back a new object.
    ///
    /// # Errors
    /// `Busy` while threads wait on it, `InvalidHandle` when already
    /// destroyed.
    pub fn event_destroy(&self, ev: Event) -> Result<()> {
        self.lock().queue_destroy(ev.0)
    }

    /// Wait for `ev` to be notified, for at most `timeout_ms` when given.
    ///
    /// Returns at once when the event is signaled, consuming the signal.
    ///
    /// # Errors
    /// - `TimedOut` when the timeout expired first.
    /// - `OutOfMemory` when the timeout timer could not be armed; the
    ///   caller did not block.
    /// - `Suspended` on hosted ports, see [`Error::Suspended`].
    pub fn wait(&self, ev: &Event, timeout_ms: Option<u32>) -> Result<()> {
        let mut rq = self.lock();
        let head = &mut rq.queue_mut(ev.0).head;
        if *head == QueueHead::Signaled {
            *head = QueueHead::Empty;
            return Ok(());
        }
        self.block_current(rq, ev.0, timeout_ms)
    }

    /// Like [`wait`](Self::wait), but a signal left over from before the
    /// call is discarded: only a notification issued after it counts.
    pub fn wait_next(&self, ev: &Event, timeout_ms: Option<u32>) -> Result<()> {
        let mut rq = self.lock();
        let head = &mut rq.queue_mut(ev.0).head;
        if *head == QueueHead::Signaled {
            *head = QueueHead::Empty;
        }
        self.block_current(rq, ev.0, timeout_ms)
    }

    /// Wake the most favorable waiter of `ev`, or leave it signaled when
    /// nobody waits. Redirects to [`notify_irq`](Self::notify_irq) in
    /// interrupt context.
    pub fn notify(&self, ev: &Event) {
        if self.port().in_interrupt() {
            self.notify_irq(ev);
            return;
        }
        self.lock().wake_one(ev.0, self.clock());
        self.preempt_schedule();
    }

    /// Wake every waiter of `ev`. With nobody waiting, a pending signal is
    /// cleared instead.
    pub fn notify_broadcast(&self, ev: &Event) {
        if self.port().in_interrupt() {
            self.notify_irq(ev);
            return;
        }
        {
            let mut rq = self.lock();
            let head = &mut rq.queue_mut(ev.0).head;
            if *head == QueueHead::Signaled {
                *head = QueueHead::Empty;
            }
            while rq.queue(ev.0).head.has_waiters() {
                rq.wake_one(ev.0, self.clock());
            }
        }
        self.preempt_schedule();
    }

    /// Notification from interrupt context. The head waiter is credited an
    /// event that the next reschedule delivers.
    pub fn notify_irq(&self, ev: &Event) {
        self.lock().notify_deferred(ev.0);
    }

    /// True when `ev` holds a notification nobody consumed yet.
    pub fn event_signaled(&self, ev: &Event) -> bool {
        self.lock().queue(ev.0).head == QueueHead::Signaled
    }
}
