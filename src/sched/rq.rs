//! # Run Queue
//!
//! The run queue binds one scheduling class to the threads it schedules and
//! keeps the bookkeeping of the reschedule protocol:
//!
//! - `current`: the thread owning the CPU. It stays on the class's ready
//!   set for as long as it is runnable, so `on_rq` always means "reachable
//!   from the ready set".
//! - the wake list: threads blocked on a thread queue, whose deferred
//!   interrupt notifications (`event_count`) are drained on reschedule.
//! - the kill list: threads killed and waiting to be reaped.
//!
//! Everything here runs with the run-queue lock held; see
//! [`crate::kernel::Kernel`] for the locking side of the protocol.

use alloc::vec::Vec;

use crate::clocksource::{ClockSource, Tick};
use crate::config::DEFAULT_TIME_SLICE;
use crate::error::{Error, Result};
use crate::event::{QueueId, ThreadQueue};
use crate::thread::{Thread, ThreadFlags, ThreadId, ThreadState, Threads, TimerSlot};
use crate::timer::TimerId;

use super::SchedClass;

/// What a kernel timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// End the sleep of a thread.
    Wake(ThreadId),
    /// Expire a timed wait on a thread queue.
    WaitTimeout { thread: ThreadId, queue: QueueId },
    /// Call a user handler, with no kernel lock held.
    Callback { handler: fn(usize), arg: usize },
}

/// The clock source driving the scheduler.
pub type KernelClock = ClockSource<TimerAction>;

/// Scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedStats {
    /// Context switches performed.
    pub switches: u64,
    /// Threads reaped from the kill list.
    pub reaped: u32,
    /// Kernel-allocated stacks given back to the allocator.
    pub stacks_freed: u32,
}

/// A context switch decided under the lock, and handed to the port under it.
pub(crate) struct Switch {
    pub(crate) prev: ThreadId,
    pub(crate) next: ThreadId,
    /// Where the port saves the outgoing stack pointer. Points into a boxed
    /// TCB, which stays put until the thread is reaped.
    pub(crate) prev_sp: *mut usize,
    pub(crate) next_sp: usize,
}

pub struct RunQueue<C> {
    pub(crate) class: C,
    pub(crate) threads: Threads,
    pub(crate) queues: Vec<ThreadQueue>,
    pub(crate) current: Option<ThreadId>,
    pub(crate) idle: Option<ThreadId>,
    wake_list: Option<ThreadId>,
    kill_list: Option<ThreadId>,
    pub(crate) stats: SchedStats,
}

impl<C: SchedClass> RunQueue<C> {
    pub const fn new(class: C) -> Self {
        Self {
            class,
            threads: Threads::new(),
            queues: Vec::new(),
            current: None,
            idle: None,
            wake_list: None,
            kill_list: None,
            stats: SchedStats {
                switches: 0,
                reaped: 0,
                stacks_freed: 0,
            },
        }
    }

    pub fn class(&self) -> &C {
        &self.class
    }

    pub fn threads(&self) -> &Threads {
        &self.threads
    }

    pub fn current(&self) -> Option<ThreadId> {
        self.current
    }

    pub fn stats(&self) -> SchedStats {
        self.stats
    }

    /// # Panics
    /// Before the scheduler started.
    pub(crate) fn current_id(&self) -> ThreadId {
        match self.current {
            Some(cur) => cur,
            None => panic!("scheduler not started"),
        }
    }

    pub(crate) fn current_thread(&mut self) -> &mut Thread {
        let cur = self.current_id();
        &mut self.threads[cur]
    }

    pub(crate) fn set_resched(&mut self) {
        if let Some(cur) = self.current {
            self.threads[cur].flags.insert(ThreadFlags::NEED_RESCHED);
        }
    }

    pub(crate) fn needs_resched(&self) -> bool {
        self.current
            .map_or(false, |cur| self.threads[cur].flags.contains(ThreadFlags::NEED_RESCHED))
    }

    // -----------------------------------------------------------------------
    // Ready set
    // -----------------------------------------------------------------------

    /// Mark a thread runnable and put it on the ready set.
    pub(crate) fn make_runnable(&mut self, tid: ThreadId, now: Tick) {
        let is_current = self.current == Some(tid);
        let t = &mut self.threads[tid];
        t.flags.insert(ThreadFlags::RUNNING);
        t.state = if is_current {
            ThreadState::Running
        } else {
            ThreadState::Ready
        };
        if !t.on_rq {
            self.class.add_thread(&mut self.threads, tid, now);
        }
        if !is_current {
            self.check_preempt_wakeup(tid);
        }
    }

    /// Ask for a reschedule unless the current thread clearly outranks the
    /// thread that just became ready.
    fn check_preempt_wakeup(&mut self, woken: ThreadId) {
        let Some(cur) = self.current else {
            return;
        };
        if !self.class.preempt_check(&self.threads, woken, cur) {
            self.threads[cur].flags.insert(ThreadFlags::NEED_RESCHED);
        }
    }

    /// Take a thread off the CPU into `state`.
    pub(crate) fn block(&mut self, tid: ThreadId, state: ThreadState) {
        let t = &mut self.threads[tid];
        t.flags.remove(ThreadFlags::RUNNING);
        t.state = state;
        self.class.rm_thread(&mut self.threads, tid);
        if self.current == Some(tid) {
            self.threads[tid].flags.insert(ThreadFlags::NEED_RESCHED);
        }
    }

    /// Change a thread's static priority and restore the order of whatever
    /// list it sits on.
    pub(crate) fn set_prio(&mut self, tid: ThreadId, prio: u8, now: Tick) {
        self.threads[tid].prio = prio;

        if self.threads[tid].on_rq {
            self.class.rm_thread(&mut self.threads, tid);
            self.class.add_thread(&mut self.threads, tid, now);
            if self.current == Some(tid) {
                self.threads[tid].flags.insert(ThreadFlags::NEED_RESCHED);
            } else {
                self.check_preempt_wakeup(tid);
            }
        } else if let Some(q) = self.threads[tid].queue {
            let head = &mut self.queues[q.index()].head;
            if self.class.queue_rm(&mut self.threads, head, tid) {
                self.class.queue_add(&mut self.threads, head, tid);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Wake and kill lists
    // -----------------------------------------------------------------------

    pub(crate) fn wake_list_push(&mut self, tid: ThreadId) {
        list_push(&mut self.threads, &mut self.wake_list, tid);
    }

    pub(crate) fn wake_list_remove(&mut self, tid: ThreadId) -> bool {
        list_remove(&mut self.threads, &mut self.wake_list, tid)
    }

    pub(crate) fn wake_list_find<F>(&self, pred: F) -> Option<ThreadId>
    where
        F: Fn(&Thread) -> bool,
    {
        let mut cursor = self.wake_list;
        while let Some(tid) = cursor {
            if pred(&self.threads[tid]) {
                return Some(tid);
            }
            cursor = self.threads[tid].rq_next;
        }
        None
    }

    /// Number of threads waiting to be reaped.
    pub fn nr_dying(&self) -> usize {
        let mut n = 0;
        let mut cursor = self.kill_list;
        while let Some(tid) = cursor {
            n += 1;
            cursor = self.threads[tid].rq_next;
        }
        n
    }

    /// Detach a thread from every list and timer and queue it for reaping.
    ///
    /// A killed current thread keeps the CPU until the next reschedule,
    /// which is requested here.
    pub(crate) fn kill(&mut self, tid: ThreadId, clock: &KernelClock) -> Result<()> {
        let t = self.threads.get_mut(tid).ok_or(Error::InvalidHandle)?;
        if t.state == ThreadState::ExitPending {
            return Ok(());
        }
        if t.is_idle() {
            panic!("the idle thread cannot be killed");
        }

        if let TimerSlot::Armed(id) = t.timer {
            clock.timer_stop(id);
        }
        t.timer = TimerSlot::None;
        t.relock = None;
        t.event_count = 0;
        if let Some(q) = t.queue.take() {
            let head = &mut self.queues[q.index()].head;
            self.class.queue_rm(&mut self.threads, head, tid);
            self.wake_list_remove(tid);
        }

        self.block(tid, ThreadState::ExitPending);
        list_push(&mut self.threads, &mut self.kill_list, tid);
        log::debug!("thread '{}' killed", self.threads[tid].name);
        Ok(())
    }

    /// Free every thread on the kill list but `skip`, the thread whose
    /// context may still be saved by a deferred switch.
    pub(crate) fn reap(&mut self, skip: Option<ThreadId>) {
        let mut cursor = self.kill_list.take();
        while let Some(tid) = cursor {
            cursor = self.threads[tid].rq_next.take();
            if Some(tid) == skip || Some(tid) == self.current {
                list_push(&mut self.threads, &mut self.kill_list, tid);
                continue;
            }

            self.class.kill(&mut self.threads, tid);
            if let Some(tcb) = self.threads.remove(tid) {
                self.stats.reaped += 1;
                if tcb.stack.is_kernel_allocated() {
                    self.stats.stacks_freed += 1;
                }
                log::debug!("thread '{}' reaped", tcb.name);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Reschedule decision
    // -----------------------------------------------------------------------

    /// Pick the next thread and do the bookkeeping of a switch to it.
    ///
    /// Returns `None` when the current thread keeps the CPU.
    ///
    /// # Panics
    /// When nothing at all is runnable: the idle thread is missing.
    pub(crate) fn pick_next(&mut self, now: Tick) -> Option<Switch> {
        let cur = self.current?;

        let expired = cfg!(feature = "preempt")
            && self.threads[cur].flags.contains(ThreadFlags::SLICE_EXPIRED);
        if expired && C::TIME_SLICED && self.threads[cur].on_rq {
            // Behind its equals
            self.class.rm_thread(&mut self.threads, cur);
            self.class.add_thread(&mut self.threads, cur, now);
        }

        let next = match self.class.next_runnable(&self.threads) {
            Some(next) => next,
            None if self.threads[cur].is_runnable() => cur,
            None => panic!("no runnable thread"),
        };

        let flags = self.threads[cur].flags;
        let mut resched = flags.contains(ThreadFlags::NEED_RESCHED) || !flags.contains(ThreadFlags::RUNNING);
        if cfg!(feature = "preempt") {
            resched |= expired && !self.threads[next].is_idle();
            resched |= self.class.preempt_check(&self.threads, cur, next);
        }
        self.threads[cur]
            .flags
            .remove(ThreadFlags::NEED_RESCHED | ThreadFlags::SLICE_EXPIRED);

        if !resched || next == cur {
            return None;
        }

        let n = &mut self.threads[next];
        n.state = ThreadState::Running;
        n.dprio = 0;
        n.slice = DEFAULT_TIME_SLICE;
        n.flags.remove(ThreadFlags::NEED_RESCHED | ThreadFlags::SLICE_EXPIRED);
        let next_sp = n.sp;
        if cfg!(feature = "dyn-prio") {
            self.class.reorder(&mut self.threads);
        }

        let p = &mut self.threads[cur];
        if p.is_runnable() {
            p.state = ThreadState::Ready;
        }
        let prev_sp = &mut p.sp as *mut usize;

        self.current = Some(next);
        self.stats.switches += 1;
        log::trace!("switch {:?} -> {:?}", cur, next);
        Some(Switch {
            prev: cur,
            next,
            prev_sp,
            next_sp,
        })
    }

    /// Per-tick accounting of the current thread.
    pub(crate) fn sched_tick(&mut self) {
        let Some(cur) = self.current else {
            return;
        };

        if cfg!(feature = "dyn-prio") {
            self.class.dyn_prio_update(&mut self.threads, 1);
            // The running thread earns no bonus.
            self.threads[cur].dprio = 0;
            self.class.reorder(&mut self.threads);
        }

        if cfg!(feature = "preempt") {
            let t = &mut self.threads[cur];
            t.slice = t.slice.saturating_sub(1);
            if t.slice == 0 {
                t.slice = DEFAULT_TIME_SLICE;
                t.flags.insert(ThreadFlags::SLICE_EXPIRED);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Act on a fired sleep or wait timer. Timers that lost a race with a
    /// wake-up no longer match the thread's slot and are ignored.
    pub(crate) fn timer_fired(&mut self, id: TimerId, action: TimerAction, clock: &KernelClock) {
        let now = clock.get_tick();
        match action {
            TimerAction::Wake(tid) => {
                let Some(t) = self.threads.get_mut(tid) else {
                    return;
                };
                if t.state != ThreadState::Sleeping || t.timer != TimerSlot::Armed(id) {
                    return;
                }
                t.timer = TimerSlot::None;
                self.make_runnable(tid, now);
            }
            TimerAction::WaitTimeout { thread, queue } => {
                let Some(t) = self.threads.get(thread) else {
                    return;
                };
                if t.queue != Some(queue) || t.timer != TimerSlot::Armed(id) {
                    return;
                }
                self.threads[thread].timer = TimerSlot::Expired;
                self.wait_timed_out(thread, queue, clock);
            }
            TimerAction::Callback { .. } => {}
        }
    }
}

// ---------------------------------------------------------------------------
// rq_next lists
// ---------------------------------------------------------------------------

fn list_push(threads: &mut Threads, head: &mut Option<ThreadId>, tid: ThreadId) {
    threads[tid].rq_next = head.replace(tid);
}

fn list_remove(threads: &mut Threads, head: &mut Option<ThreadId>, tid: ThreadId) -> bool {
    let mut prev: Option<ThreadId> = None;
    let mut cursor = *head;
    while let Some(cur) = cursor {
        let next = threads[cur].rq_next;
        if cur == tid {
            match prev {
                Some(p) => threads[p].rq_next = next,
                None => *head = next,
            }
            threads[tid].rq_next = None;
            return true;
        }
        prev = Some(cur);
        cursor = next;
    }
    false
}
