//! Hosted port.
//!
//! Nothing actually changes stacks: a "switch" is recorded and control
//! returns to the caller, which then reports [`Error::Suspended`] when it
//! is no longer the current thread. Interrupt context is simulated with
//! [`SimPort::set_in_interrupt`].
//!
//! [`Error::Suspended`]: crate::error::Error::Suspended

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use super::Port;
use crate::thread::ThreadEntry;

pub struct SimPort {
    switches: RefCell<Vec<usize>>,
    in_irq: Cell<bool>,
    irqs_on: Cell<bool>,
    started: Cell<Option<usize>>,
    on_switch: RefCell<Option<Box<dyn Fn()>>>,
}

impl SimPort {
    pub fn new() -> Self {
        Self {
            switches: RefCell::new(Vec::new()),
            in_irq: Cell::new(false),
            irqs_on: Cell::new(true),
            started: Cell::new(None),
            on_switch: RefCell::new(None),
        }
    }

    pub fn set_in_interrupt(&self, on: bool) {
        self.in_irq.set(on);
    }

    pub fn set_irqs_enabled(&self, on: bool) {
        self.irqs_on.set(on);
    }

    /// Run `hook` inside every `switch_context`, after the switch is
    /// recorded. Lets a test land an "interrupt" at the moment the port is
    /// asked to switch.
    pub fn set_switch_hook(&self, hook: impl Fn() + 'static) {
        *self.on_switch.borrow_mut() = Some(Box::new(hook));
    }

    /// Number of context switches requested so far.
    pub fn switches(&self) -> usize {
        self.switches.borrow().len()
    }

    /// Stack pointers switched to, oldest first.
    pub fn switch_log(&self) -> Vec<usize> {
        self.switches.borrow().clone()
    }

    /// Stack pointer handed to `start_first`.
    pub fn started(&self) -> Option<usize> {
        self.started.get()
    }
}

impl Default for SimPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for SimPort {
    fn init_stack(&self, stack: &mut [u8], _entry: ThreadEntry, _arg: usize) -> usize {
        let top = stack.as_ptr() as usize + stack.len();
        top & !7
    }

    unsafe fn switch_context(&self, prev_sp: *mut usize, next_sp: usize) {
        // The outgoing thread "saves" the pointer it was created with.
        let _ = prev_sp;
        self.switches.borrow_mut().push(next_sp);
        if let Some(hook) = self.on_switch.borrow().as_ref() {
            hook();
        }
    }

    fn start_first(&self, sp: usize) {
        self.started.set(Some(sp));
    }

    fn irqs_enabled(&self) -> bool {
        self.irqs_on.get()
    }

    fn in_interrupt(&self) -> bool {
        self.in_irq.get()
    }
}
