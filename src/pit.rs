//! Programmable interval timer (channel 0).
//!
//! The tick handler runs in interrupt context and touches nothing but
//! atomics: it bumps the global counter and, every SLICE_TICKS ticks,
//! raises the reschedule request that task code consumes at its next
//! yield point.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use x86_64::instructions::port::Port;

pub const TIMER_HZ: u32 = 100;

/// Preemption ticks per time slice.
const SLICE_TICKS: u64 = 10;

const PIT_BASE_HZ: u32 = 1193180;
const PIT_COMMAND: u16 = 0x43;
const PIT_CHANNEL0: u16 = 0x40;

pub static NEED_RESCHED: AtomicBool = AtomicBool::new(false);
static TICKS: AtomicU64 = AtomicU64::new(0);
static SLICE: AtomicU64 = AtomicU64::new(0);

/// Programs channel 0 for a rate-generator square wave at `hz`.
pub fn init(hz: u32) {
    let divisor = PIT_BASE_HZ / hz;
    unsafe {
        let mut cmd = Port::<u8>::new(PIT_COMMAND);
        let mut data = Port::<u8>::new(PIT_CHANNEL0);
        cmd.write(0x36);
        data.write((divisor & 0xFF) as u8);
        data.write(((divisor >> 8) & 0xFF) as u8);
    }
}

/// Called from the timer IRQ handler. No locks here.
pub fn on_tick() {
    TICKS.fetch_add(1, Ordering::SeqCst);
    if SLICE.fetch_add(1, Ordering::SeqCst) + 1 >= SLICE_TICKS {
        SLICE.store(0, Ordering::SeqCst);
        NEED_RESCHED.store(true, Ordering::SeqCst);
    }
}

/// Ticks since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::SeqCst)
}

/// Seconds since boot, for display only.
pub fn uptime_secs() -> u64 {
    ticks() / TIMER_HZ as u64
}
