//! Programmable Interval Timer (8253/8254)
//!
//! Channel 0 is programmed for a 1 kHz rate; the vector-32 IRQ bridge
//! advances a monotonic tick counter. `wait_ms` is the kernel's only
//! time source during bring-up (AP startup delays, APIC calibration).

use core::sync::atomic::{AtomicU64, Ordering};

/// PIT input clock in Hz.
const PIT_FREQUENCY: u32 = 1_193_182;

/// Tick rate programmed into channel 0.
const TICK_HZ: u32 = 1000;

const PIT_CHANNEL0_PORT: u16 = 0x40;
const PIT_MODE_PORT: u16 = 0x43;

/// Milliseconds since `init` (one tick per millisecond).
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Program channel 0: rate generator (mode 3 square wave), lo/hi access.
#[cfg(target_os = "none")]
pub fn init() {
    let divisor = (PIT_FREQUENCY / TICK_HZ) as u16;
    // SAFETY: the mode/divisor writes are the architected channel-0
    // programming sequence; nothing else drives these ports.
    unsafe {
        crate::arch::outb(PIT_MODE_PORT, 0b0011_0110);
        crate::arch::outb(PIT_CHANNEL0_PORT, divisor as u8);
        crate::arch::outb(PIT_CHANNEL0_PORT, (divisor >> 8) as u8);
    }
    log::info!("[PIT] channel 0 at {} Hz", TICK_HZ);
}

/// Called from the vector-32 IRQ bridge on every tick.
pub fn on_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Milliseconds since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Busy-wait (HLT loop) until `ms` ticks have elapsed.
///
/// Requires interrupts enabled and the PIT programmed; each HLT wakes on
/// the next tick.
#[cfg(target_os = "none")]
pub fn wait_ms(ms: u64) {
    let deadline = ticks() + ms;
    while ticks() < deadline {
        crate::arch::x86_64::wait_for_interrupt();
    }
}
