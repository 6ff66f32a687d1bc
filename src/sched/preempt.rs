//! Preemption control.
//!
//! Every thread carries a preemption counter. While it is non-zero the
//! thread keeps the CPU on interrupt exits and wake-ups; the request is
//! remembered in `NEED_RESCHED` and honored when the count drops back to
//! zero.

use crate::arch::Port;
use crate::kernel::Kernel;
use crate::thread::ThreadFlags;

use super::SchedClass;

impl<C: SchedClass, P: Port> Kernel<C, P> {
    /// Keep the current thread on the CPU until the matching
    /// [`preempt_enable`](Self::preempt_enable). Nests.
    pub fn preempt_disable(&self) {
        let mut rq = self.lock();
        let t = rq.current_thread();
        t.preempt_count += 1;
    }

    /// Undo one [`preempt_disable`](Self::preempt_disable) and reschedule
    /// if a request came in meanwhile.
    ///
    /// # Panics
    /// When the count is already zero.
    pub fn preempt_enable(&self) {
        self.preempt_enable_no_resched();
        self.preempt_schedule();
    }

    /// Undo one [`preempt_disable`](Self::preempt_disable) without acting
    /// on a pending reschedule request.
    pub fn preempt_enable_no_resched(&self) {
        let mut rq = self.lock();
        let t = rq.current_thread();
        if t.preempt_count == 0 {
            panic!("unbalanced preempt_enable in '{}'", t.name);
        }
        t.preempt_count -= 1;
    }

    pub fn preempt_count(&self) -> u32 {
        let rq = self.lock();
        rq.current().map_or(0, |cur| rq.threads()[cur].preempt_count)
    }

    /// Whether the current thread has been asked to give up the CPU.
    pub fn should_resched(&self) -> bool {
        self.lock().needs_resched()
    }

    /// Whether a reschedule is asked for and allowed right now.
    pub fn preempt_should_resched(&self) -> bool {
        let rq = self.lock();
        let Some(cur) = rq.current() else {
            return false;
        };
        let t = &rq.threads()[cur];
        t.preempt_count == 0
            && t.flags
                .intersects(ThreadFlags::NEED_RESCHED | ThreadFlags::SLICE_EXPIRED)
    }

    /// Reschedule from thread context if it is allowed and asked for.
    pub fn preempt_schedule(&self) {
        if self.port().irqs_enabled() && self.preempt_should_resched() {
            self.schedule();
        }
    }

    /// Reschedule on the way out of an interrupt handler.
    pub fn preempt_schedule_irq(&self) {
        if self.preempt_should_resched() {
            self.schedule();
        }
    }

    /// Per-tick scheduler accounting of the current thread.
    pub fn sched_clock_tick(&self) {
        self.lock().sched_tick();
    }

    /// The system timer interrupt: advance the clock, fire timers, charge
    /// the current thread and preempt it if needed.
    pub fn timer_interrupt(&self) {
        self.clock().tick();
        self.run_timers();
        self.sched_clock_tick();
        self.preempt_schedule_irq();
    }
}

#[cfg(test)]
mod tests {
    use crate::kernel::tests::{boot, spawn};
    use crate::thread::ThreadState;

    #[test]
    fn test_disabled_preemption_defers_wakeup() {
        let k = boot();
        let b = spawn(&k, "b", 20);
        assert_eq!(k.current(), Some(b));

        k.preempt_disable();
        k.preempt_disable();
        let a = spawn(&k, "a", 10);
        assert_eq!(k.current(), Some(b));
        assert!(k.should_resched());

        k.preempt_enable();
        assert_eq!(k.current(), Some(b));
        assert_eq!(k.preempt_count(), 1);

        k.preempt_enable();
        assert_eq!(k.current(), Some(a));
        assert_eq!(k.thread_state(b), Some(ThreadState::Ready));
    }

    #[test]
    fn test_irq_tick_respects_preempt_count() {
        let k = boot();
        let b = spawn(&k, "b", 20);
        k.preempt_disable();
        let a = spawn(&k, "a", 10);
        for _ in 0..30 {
            k.timer_interrupt();
        }
        assert_eq!(k.current(), Some(b));
        k.preempt_enable_no_resched();
        assert_eq!(k.current(), Some(b));
        k.timer_interrupt();
        assert_eq!(k.current(), Some(a));
    }

    #[test]
    fn test_masked_irqs_block_thread_preemption() {
        let k = boot();
        let b = spawn(&k, "b", 20);
        k.port().set_irqs_enabled(false);
        let a = spawn(&k, "a", 10);
        assert_eq!(k.current(), Some(b));
        k.port().set_irqs_enabled(true);
        k.preempt_schedule();
        assert_eq!(k.current(), Some(a));
    }

    #[test]
    #[should_panic(expected = "unbalanced preempt_enable")]
    fn test_unbalanced_enable_is_fatal() {
        let k = boot();
        spawn(&k, "a", 10);
        k.preempt_enable();
    }

    #[cfg(feature = "preempt")]
    #[test]
    fn test_slice_expiry_rotates_equal_threads() {
        let k = boot();
        let a = spawn(&k, "a", 10);
        let b = spawn(&k, "b", 10);
        assert_eq!(k.current(), Some(a));

        for _ in 0..crate::config::DEFAULT_TIME_SLICE {
            k.timer_interrupt();
        }
        assert_eq!(k.current(), Some(b));
    }
}
