//! # ETA/OS Demo Firmware
//!
//! Three threads exercising the scheduler on a Cortex-M4:
//!
//! | Thread     | Nice | Behavior |
//! |------------|------|----------|
//! | `producer` | 100  | Posts a sequence number every 100 ms |
//! | `consumer` | 80   | Blocks on the mailbox, tallies what arrives |
//! | `worker`   | 150  | Busy loop, preempted at every time slice |
//!
//! The consumer has the most favorable priority, so every post preempts
//! whoever runs and hands the CPU to it. The worker only gets the CPU
//! while the other two are blocked or sleeping.

#![no_std]
#![no_main]

use core::mem::MaybeUninit;
use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicU32, Ordering};

use cortex_m_rt::entry;
use linked_list_allocator::LockedHeap;
use panic_halt as _;

use etaos::config::HEAP_SIZE;
use etaos::{kernel, Ipm};

#[global_allocator]
static HEAP: LockedHeap = LockedHeap::empty();

static mut HEAP_MEM: [MaybeUninit<u8>; HEAP_SIZE] = [MaybeUninit::uninit(); HEAP_SIZE];

static MAILBOX: spin::Once<Ipm<u32, 8>> = spin::Once::new();
static RECEIVED: AtomicU32 = AtomicU32::new(0);

fn mailbox() -> &'static Ipm<u32, 8> {
    MAILBOX.get().unwrap_or_else(|| panic!("mailbox used before main set it up"))
}

// ---------------------------------------------------------------------------
// Thread entry points
// ---------------------------------------------------------------------------

extern "C" fn producer(_arg: usize) {
    let mut seq: u32 = 0;
    loop {
        // A full mailbox drops the sample, the consumer is behind anyway
        let _ = kernel::global().ipm_post(mailbox(), seq);
        seq = seq.wrapping_add(1);
        let _ = kernel::sleep(100);
    }
}

extern "C" fn consumer(_arg: usize) {
    loop {
        if let Ok(seq) = kernel::global().ipm_recv(mailbox(), None) {
            log::trace!("consumer got {}", seq);
            RECEIVED.fetch_add(1, Ordering::Relaxed);
        }
    }
}

extern "C" fn worker(_arg: usize) {
    let mut counter: u32 = 0;
    loop {
        counter = counter.wrapping_add(1);
    }
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

#[entry]
fn main() -> ! {
    // SAFETY: the heap memory is handed over once, before any allocation.
    unsafe {
        HEAP.lock()
            .init(addr_of_mut!(HEAP_MEM) as *mut u8, HEAP_SIZE);
    }

    let Some(cp) = cortex_m::Peripherals::take() else {
        panic!("core peripherals already taken");
    };

    kernel::init();

    match kernel::global().ipm_create::<u32, 8>() {
        Ok(ipm) => {
            MAILBOX.call_once(|| ipm);
        }
        Err(e) => panic!("mailbox: {}", e),
    }

    for (name, entry, prio) in [
        ("producer", producer as extern "C" fn(usize), 100),
        ("consumer", consumer, 80),
        ("worker", worker, 150),
    ] {
        if let Err(e) = kernel::spawn(name, entry, 0, prio) {
            panic!("failed to create {}: {}", name, e);
        }
    }

    kernel::start(cp)
}
