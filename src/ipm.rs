//! # Inter-Process Messages
//!
//! A bounded FIFO of messages paired with an event. Posting a message
//! notifies the event; a receiver that finds the queue empty waits on it.
//! The event latches, so a message posted between the receiver's empty
//! check and its wait is never missed.
//!
//! Posting is interrupt safe: the message buffer has its own lock and the
//! notification takes the deferred path in interrupt context.

use heapless::Deque;

use crate::arch::Port;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::kernel::Kernel;
use crate::sched::{QueueHead, SchedClass};
use crate::sync::IrqSpinLock;

/// Message queue holding up to `N` messages of type `T`.
pub struct Ipm<T, const N: usize> {
    msgs: IrqSpinLock<Deque<T, N>>,
    event: Event,
}

impl<T, const N: usize> Ipm<T, N> {
    /// Number of messages waiting to be received.
    pub fn len(&self) -> usize {
        self.msgs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        N
    }

    fn pop(&self) -> Option<T> {
        self.msgs.lock().pop_front()
    }
}

impl<C: SchedClass, P: Port> Kernel<C, P> {
    pub fn ipm_create<T, const N: usize>(&self) -> Result<Ipm<T, N>> {
        Ok(Ipm {
            msgs: IrqSpinLock::new(Deque::new()),
            event: self.event_create()?,
        })
    }

    /// Append a message and wake a receiver.
    ///
    /// # Errors
    /// `Full` when the queue holds `N` messages already; the message is
    /// dropped.
    pub fn ipm_post<T, const N: usize>(&self, ipm: &Ipm<T, N>, msg: T) -> Result<()> {
        ipm.msgs.lock().push_back(msg).map_err(|_| Error::Full)?;
        self.notify(&ipm.event);
        Ok(())
    }

    /// Take the oldest message, waiting for one at most `timeout_ms` when
    /// given.
    ///
    /// # Errors
    /// `TimedOut` when no message arrived in time.
    pub fn ipm_recv<T, const N: usize>(&self, ipm: &Ipm<T, N>, timeout_ms: Option<u32>) -> Result<T> {
        loop {
            if let Some(msg) = ipm.pop() {
                return Ok(msg);
            }
            self.wait(&ipm.event, timeout_ms)?;
        }
    }

    /// # Errors
    /// `Empty` when no message is queued.
    pub fn ipm_try_recv<T, const N: usize>(&self, ipm: &Ipm<T, N>) -> Result<T> {
        ipm.pop().ok_or(Error::Empty)
    }

    /// Drop the queued messages and release the queue's event. The queue
    /// must not be used afterwards.
    ///
    /// # Errors
    /// `Busy` when a thread waits on the queue; nothing changes then.
    pub fn ipm_destroy<T, const N: usize>(&self, ipm: &Ipm<T, N>) -> Result<()> {
        self.lock().queue_destroy(ipm.event.queue())?;
        ipm.msgs.lock().clear();
        Ok(())
    }

    /// Drop every queued message and any pending notification.
    ///
    /// # Errors
    /// `Busy` when a thread waits on the queue; nothing is dropped.
    pub fn ipm_reset<T, const N: usize>(&self, ipm: &Ipm<T, N>) -> Result<()> {
        let mut rq = self.lock();
        let head = &mut rq.queue_mut(ipm.event.queue()).head;
        if head.has_waiters() {
            return Err(Error::Busy);
        }
        *head = QueueHead::Empty;
        ipm.msgs.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::{boot, spawn};
    use crate::thread::{ThreadState, WakeReason};

    #[test]
    fn test_messages_arrive_in_order() {
        let k = boot();
        spawn(&k, "a", 10);
        let ipm = k.ipm_create::<u32, 4>().unwrap();

        k.ipm_post(&ipm, 1).unwrap();
        k.ipm_post(&ipm, 2).unwrap();
        k.ipm_post(&ipm, 3).unwrap();
        assert_eq!(ipm.len(), 3);
        assert_eq!(k.ipm_recv(&ipm, None), Ok(1));
        assert_eq!(k.ipm_recv(&ipm, None), Ok(2));
        assert_eq!(k.ipm_try_recv(&ipm), Ok(3));
        assert_eq!(k.ipm_try_recv(&ipm), Err(Error::Empty));
    }

    #[test]
    fn test_destroy_refused_while_receiver_waits() {
        let k = boot();
        let rx = spawn(&k, "rx", 10);
        spawn(&k, "tx", 20);
        let ipm = k.ipm_create::<u32, 4>().unwrap();

        assert_eq!(k.ipm_recv(&ipm, None), Err(Error::Suspended));
        assert_eq!(k.ipm_destroy(&ipm), Err(Error::Busy));
        k.ipm_post(&ipm, 7).unwrap();
        assert_eq!(k.current(), Some(rx));
        k.ipm_post(&ipm, 8).unwrap();

        k.ipm_destroy(&ipm).unwrap();
        assert!(ipm.is_empty());
    }

    #[test]
    fn test_post_to_full_queue_fails() {
        let k = boot();
        spawn(&k, "a", 10);
        let ipm = k.ipm_create::<u8, 2>().unwrap();
        k.ipm_post(&ipm, 1).unwrap();
        k.ipm_post(&ipm, 2).unwrap();
        assert_eq!(k.ipm_post(&ipm, 3), Err(Error::Full));
        assert_eq!(ipm.len(), ipm.capacity());
    }

    #[test]
    fn test_receiver_blocks_until_post() {
        let k = boot();
        let rx = spawn(&k, "rx", 10);
        let tx = spawn(&k, "tx", 20);
        let ipm = k.ipm_create::<u32, 4>().unwrap();

        assert_eq!(k.ipm_recv(&ipm, None), Err(Error::Suspended));
        assert_eq!(k.thread_state(rx), Some(ThreadState::Waiting));
        assert_eq!(k.current(), Some(tx));

        k.ipm_post(&ipm, 42).unwrap();
        assert_eq!(k.current(), Some(rx));
        assert_eq!(k.wake_reason(rx), Some(WakeReason::Notified));
        assert_eq!(k.ipm_recv(&ipm, None), Ok(42));
    }

    #[test]
    fn test_post_from_interrupt() {
        let k = boot();
        let rx = spawn(&k, "rx", 10);
        spawn(&k, "tx", 20);
        let ipm = k.ipm_create::<u32, 4>().unwrap();
        k.ipm_recv(&ipm, None).unwrap_err();

        k.port().set_in_interrupt(true);
        k.ipm_post(&ipm, 7).unwrap();
        k.port().set_in_interrupt(false);
        k.timer_interrupt();

        assert_eq!(k.current(), Some(rx));
        assert_eq!(k.ipm_try_recv(&ipm), Ok(7));
    }

    #[test]
    fn test_reset_refused_while_waited_on() {
        let k = boot();
        spawn(&k, "rx", 10);
        spawn(&k, "tx", 20);
        let ipm = k.ipm_create::<u32, 4>().unwrap();

        k.ipm_recv(&ipm, None).unwrap_err();
        assert_eq!(k.ipm_reset(&ipm), Err(Error::Busy));
    }

    #[test]
    fn test_reset_clears_messages_and_signal() {
        let k = boot();
        spawn(&k, "a", 10);
        let ipm = k.ipm_create::<u32, 4>().unwrap();
        k.ipm_post(&ipm, 1).unwrap();
        k.ipm_post(&ipm, 2).unwrap();

        assert_eq!(k.ipm_reset(&ipm), Ok(()));
        assert!(ipm.is_empty());
        assert!(!k.event_signaled(&ipm.event));
    }
}
