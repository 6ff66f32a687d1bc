//! # Kernel
//!
//! The kernel context: one run queue, the clock source it schedules by and
//! the architecture port that switches stacks. Every public thread and
//! synchronization API is a method of [`Kernel`].
//!
//! ## Startup Sequence
//!
//! ```text
//! reset handler (cortex-m-rt)
//!   └─► main()
//!         ├─► kernel.init()          ← idle thread
//!         ├─► kernel.spawn() (×N)    ← application threads
//!         └─► kernel.start()         ← first thread, no return on target
//!
//! timer IRQ ──► timer_interrupt()
//!                 ├─► clock tick, expired timers
//!                 ├─► time-slice accounting
//!                 └─► preempt_schedule_irq() ──► schedule()
//! ```
//!
//! ## Reschedule protocol
//!
//! [`Kernel::schedule`] runs the expired timers with no lock held, then,
//! under the run-queue lock, delivers interrupt notifications and picks the
//! next thread. The port is told about the switch while the lock is still
//! held; a port that defers the stack swap performs it once interrupts come
//! back on. Dead threads are reaped afterwards, except the one switched away
//! from in the same round: a deferred switch may still be saving its context.
//!
//! ## Locking
//!
//! The run-queue lock and the clock-source lock are both interrupt-masking
//! spin locks. Paths needing both take the run queue first.

use crate::arch::Port;
use crate::config::{DEFAULT_TIME_SLICE, IDLE_PRIO, IDLE_STACK_SIZE};
use crate::error::{Error, Result};
use crate::event::QueueId;
use crate::sched::rq::{KernelClock, TimerAction};
use crate::sched::{RunQueue, SchedClass, SchedStats};
use crate::sync::{IrqSpinLock, IrqSpinLockGuard};
use crate::thread::{
    self, Stack, Thread, ThreadEntry, ThreadFlags, ThreadId, ThreadStack, ThreadState, TimerSlot,
    WakeReason,
};
use crate::timer::{TimerId, TimerMode};

pub struct Kernel<C, P> {
    port: P,
    rq: IrqSpinLock<RunQueue<C>>,
    clock: KernelClock,
}

impl<C: SchedClass, P: Port> Kernel<C, P> {
    /// Build a kernel around a scheduling class, ticking at `tick_hz`.
    pub const fn new(port: P, class: C, tick_hz: u32) -> Self {
        Self {
            port,
            rq: IrqSpinLock::new(RunQueue::new(class)),
            clock: KernelClock::new("sys", tick_hz),
        }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn clock(&self) -> &KernelClock {
        &self.clock
    }

    pub(crate) fn lock(&self) -> IrqSpinLockGuard<'_, RunQueue<C>> {
        self.rq.lock()
    }

    #[cfg(test)]
    pub(crate) fn rq_locked(&self) -> bool {
        self.rq.is_locked()
    }

    /// Inspect the run queue under its lock.
    pub fn with_rq<R>(&self, f: impl FnOnce(&RunQueue<C>) -> R) -> R {
        f(&self.lock())
    }

    // -----------------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------------

    /// Create the idle thread. Must be called once, before [`start`](Self::start).
    ///
    /// # Panics
    /// When called twice.
    pub fn init(&self) -> Result<ThreadId> {
        if self.lock().idle.is_some() {
            panic!("kernel initialized twice");
        }
        let idle = self.thread_create(
            "idle",
            self.port.idle_entry(),
            0,
            ThreadStack::Alloc(IDLE_STACK_SIZE),
            IDLE_PRIO,
        )?;
        {
            let mut rq = self.lock();
            rq.threads[idle].flags.insert(ThreadFlags::IDLE);
            rq.idle = Some(idle);
        }
        self.thread_start(idle)?;
        log::debug!("kernel initialized, {} scheduling", C::NAME);
        Ok(idle)
    }

    /// Hand the CPU to the best ready thread. Does not return on a real
    /// target.
    ///
    /// # Panics
    /// When the kernel is not initialized or already started.
    pub fn start(&self) {
        let sp = {
            let mut guard = self.lock();
            let rq = &mut *guard;
            if rq.idle.is_none() {
                panic!("kernel not initialized");
            }
            if rq.current.is_some() {
                panic!("scheduler already started");
            }
            let Some(first) = rq.class.next_runnable(&rq.threads) else {
                panic!("no runnable thread");
            };
            rq.current = Some(first);
            let t = &mut rq.threads[first];
            t.state = ThreadState::Running;
            t.slice = DEFAULT_TIME_SLICE;
            log::debug!("scheduler started with '{}'", t.name);
            t.sp
        };
        self.port.start_first(sp);
    }

    // -----------------------------------------------------------------------
    // Threads
    // -----------------------------------------------------------------------

    /// Create a thread in the `New` state.
    ///
    /// # Errors
    /// `OutOfMemory` when the control block or stack cannot be allocated.
    /// Nothing is left behind in that case.
    pub fn thread_create(
        &self,
        name: &'static str,
        entry: ThreadEntry,
        arg: usize,
        stack: ThreadStack,
        prio: u8,
    ) -> Result<ThreadId> {
        let mut stack = Stack::new(stack)?;
        let sp = self.port.init_stack(stack.as_mut_slice(), entry, arg);
        let mut tcb = Thread::new(name, entry, arg, stack, prio);
        tcb.sp = sp;
        let tcb = thread::try_box(tcb)?;

        let tid = self.lock().threads.insert(tcb)?;
        log::debug!("thread '{}' created, prio {}", name, prio);
        Ok(tid)
    }

    /// Put a new thread on the run queue.
    pub fn thread_start(&self, tid: ThreadId) -> Result<()> {
        {
            let mut rq = self.lock();
            let t = rq.threads.get(tid).ok_or(Error::InvalidHandle)?;
            if t.state != ThreadState::New {
                return Ok(());
            }
            let now = self.clock.get_tick();
            rq.make_runnable(tid, now);
        }
        self.preempt_schedule();
        Ok(())
    }

    /// Create and start a thread with a kernel-allocated stack.
    pub fn spawn(&self, name: &'static str, entry: ThreadEntry, arg: usize, prio: u8) -> Result<ThreadId> {
        let tid = self.thread_create(name, entry, arg, ThreadStack::default_size(), prio)?;
        self.thread_start(tid)?;
        Ok(tid)
    }

    /// The thread owning the CPU, once the scheduler started.
    pub fn current(&self) -> Option<ThreadId> {
        self.lock().current
    }

    pub fn thread_state(&self, tid: ThreadId) -> Option<ThreadState> {
        self.lock().threads.get(tid).map(|t| t.state)
    }

    /// Number of live threads, idle and dying ones included.
    pub fn nr_threads(&self) -> usize {
        self.lock().threads.len()
    }

    /// Kill a thread. It never runs again; its resources are released at
    /// the next reschedule. A thread killing itself is switched out at once.
    pub fn kill(&self, tid: ThreadId) -> Result<()> {
        let is_current = {
            let mut rq = self.lock();
            rq.kill(tid, &self.clock)?;
            rq.current == Some(tid)
        };
        if is_current {
            self.schedule();
        }
        Ok(())
    }

    /// Terminate the calling thread.
    pub fn exit(&self) {
        let cur = self.lock().current_id();
        // Only a stale handle fails, and the current thread is live.
        let _ = self.kill(cur);
    }

    /// Sleep for `ms` milliseconds. `sleep(0)` gives the CPU to equal or
    /// better threads and comes straight back otherwise.
    pub fn sleep(&self, ms: u32) -> Result<()> {
        {
            let mut rq = self.lock();
            let cur = rq.current_id();
            let id = self.clock.timer_create(ms, TimerMode::OneShot, TimerAction::Wake(cur))?;
            rq.threads[cur].timer = TimerSlot::Armed(id);
            rq.block(cur, ThreadState::Sleeping);
        }
        self.schedule();
        Ok(())
    }

    /// Give up the CPU if a more favorable thread is ready.
    pub fn yield_now(&self) {
        self.lock().set_resched();
        self.schedule();
    }

    /// Set the nice value of a thread. Lower is more favorable.
    pub fn set_priority(&self, tid: ThreadId, prio: u8) -> Result<()> {
        {
            let mut rq = self.lock();
            if !rq.threads.contains(tid) {
                return Err(Error::InvalidHandle);
            }
            rq.set_prio(tid, prio, self.clock.get_tick());
        }
        self.preempt_schedule();
        Ok(())
    }

    pub fn priority(&self, tid: ThreadId) -> Result<u8> {
        self.lock()
            .threads
            .get(tid)
            .map(|t| t.prio)
            .ok_or(Error::InvalidHandle)
    }

    /// How a thread left its last wait. `None` while it still waits or
    /// sleeps.
    pub fn wake_reason(&self, tid: ThreadId) -> Option<WakeReason> {
        let rq = self.lock();
        let t = rq.threads.get(tid)?;
        match t.state {
            ThreadState::Ready | ThreadState::Running => Some(match t.timer {
                TimerSlot::Expired => WakeReason::TimedOut,
                _ => WakeReason::Notified,
            }),
            _ => None,
        }
    }

    pub fn stats(&self) -> SchedStats {
        self.lock().stats()
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Arm a timer calling `handler(arg)` after `ms` milliseconds, and every
    /// `ms` milliseconds after that when periodic. Handlers run with no
    /// kernel lock held.
    pub fn timer_create(&self, ms: u32, mode: TimerMode, handler: fn(usize), arg: usize) -> Result<TimerId> {
        self.clock
            .timer_create(ms, mode, TimerAction::Callback { handler, arg })
    }

    /// Stop a timer. `false` when it already fired or was stopped.
    pub fn timer_stop(&self, id: TimerId) -> bool {
        self.clock.timer_stop(id)
    }

    pub(crate) fn run_timers(&self) {
        let now = self.clock.get_tick();
        while let Some((id, action)) = self.clock.next_expired(now) {
            match action {
                TimerAction::Callback { handler, arg } => handler(arg),
                _ => self.lock().timer_fired(id, action, &self.clock),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Run the reschedule protocol.
    pub fn schedule(&self) {
        loop {
            self.run_timers();

            // The port learns of the switch before the lock drops. Between
            // the two, `current` names a thread that is not on the CPU.
            let prev = {
                let mut rq = self.lock();
                rq.drain_events(&self.clock);
                let switch = rq.pick_next(self.clock.get_tick());
                switch.map(|sw| {
                    // SAFETY: `prev_sp` points into a boxed TCB that is not
                    // reaped before the next round.
                    unsafe { self.port.switch_context(sw.prev_sp, sw.next_sp) };
                    sw.prev
                })
            };

            let again = {
                let mut rq = self.lock();
                rq.reap(prev);
                rq.needs_resched()
            };
            if !again {
                break;
            }
        }
    }

    /// Block the current thread on `q` and give up the CPU.
    ///
    /// Takes over the run-queue lock the caller checked the queue under, so
    /// no notification slips in between.
    pub(crate) fn block_current(
        &self,
        mut rq: IrqSpinLockGuard<'_, RunQueue<C>>,
        q: QueueId,
        timeout_ms: Option<u32>,
    ) -> Result<()> {
        let cur = rq.current_id();
        let slot = self.arm_wait_timeout(cur, q, timeout_ms)?;
        self.park_current(rq, q, slot)
    }

    /// Arm the timeout of a wait of `tid` on `q`. Nothing is armed on
    /// error.
    pub(crate) fn arm_wait_timeout(&self, tid: ThreadId, q: QueueId, timeout_ms: Option<u32>) -> Result<TimerSlot> {
        match timeout_ms {
            Some(ms) => {
                let action = TimerAction::WaitTimeout { thread: tid, queue: q };
                let id = self.clock.timer_create(ms, TimerMode::OneShot, action)?;
                Ok(TimerSlot::Armed(id))
            }
            None => Ok(TimerSlot::None),
        }
    }

    /// Second half of [`block_current`](Self::block_current), once the
    /// timeout is armed. Cannot fail before the thread is parked.
    pub(crate) fn park_current(
        &self,
        mut rq: IrqSpinLockGuard<'_, RunQueue<C>>,
        q: QueueId,
        slot: TimerSlot,
    ) -> Result<()> {
        let cur = rq.current_id();
        rq.enqueue_waiter(cur, q, slot);
        drop(rq);

        self.schedule();
        self.wait_result(cur)
    }

    /// Outcome of a wait for the thread that ran it.
    fn wait_result(&self, tid: ThreadId) -> Result<()> {
        let mut rq = self.lock();
        if rq.current != Some(tid) {
            return Err(Error::Suspended);
        }
        let t = &mut rq.threads[tid];
        if t.timer == TimerSlot::Expired {
            t.timer = TimerSlot::None;
            return Err(Error::TimedOut);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Global instance (Cortex-M4 target)
// ---------------------------------------------------------------------------

#[cfg(all(feature = "cortex-m4", target_arch = "arm"))]
mod global {
    use super::*;
    use crate::arch::cortex_m4::{self, CortexM4};
    use crate::config::TICK_HZ;
    use crate::sched::{self, DefaultClass};

    /// The system kernel. Interrupt handlers and the thread-exit path reach
    /// it through [`global`].
    static KERNEL: Kernel<DefaultClass, CortexM4> = Kernel::new(CortexM4, sched::default_class(), TICK_HZ);

    pub fn global() -> &'static Kernel<DefaultClass, CortexM4> {
        &KERNEL
    }

    /// Create the idle thread.
    ///
    /// # Panics
    /// When the idle thread cannot be allocated.
    pub fn init() {
        if let Err(e) = KERNEL.init() {
            panic!("idle thread: {}", e);
        }
    }

    pub fn spawn(name: &'static str, entry: ThreadEntry, arg: usize, prio: u8) -> Result<ThreadId> {
        KERNEL.spawn(name, entry, arg, prio)
    }

    /// Configure SysTick and the exception priorities, then launch the
    /// first thread. **Does not return.**
    pub fn start(mut core_peripherals: cortex_m::Peripherals) -> ! {
        cortex_m4::configure_systick(&mut core_peripherals.SYST);
        cortex_m4::set_interrupt_priorities();
        KERNEL.start();
        loop {
            cortex_m::asm::wfi();
        }
    }

    pub fn sleep(ms: u32) -> Result<()> {
        KERNEL.sleep(ms)
    }

    pub fn yield_now() {
        KERNEL.yield_now();
    }

    pub fn exit() {
        KERNEL.exit();
    }
}

#[cfg(all(feature = "cortex-m4", target_arch = "arm"))]
pub use global::*;

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
