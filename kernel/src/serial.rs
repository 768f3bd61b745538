//! Serial debug port (COM1)
//!
//! All kernel console output goes to the 16550 UART at 0x3F8; the
//! framebuffer terminal is outside this kernel's scope.

use core::fmt;

#[cfg(target_os = "none")]
use lazy_static::lazy_static;
#[cfg(target_os = "none")]
use spin::Mutex;

#[cfg(target_os = "none")]
lazy_static! {
    pub static ref SERIAL1: Mutex<uart_16550::SerialPort> = {
        // SAFETY: 0x3F8 is the standard COM1 base; the port block is not
        // shared with any other driver in this kernel.
        let mut port = unsafe { uart_16550::SerialPort::new(0x3F8) };
        port.init();
        Mutex::new(port)
    };
}

#[cfg(target_os = "none")]
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    // Interrupt handlers in this kernel never print, so taking the lock
    // with interrupts enabled cannot self-deadlock.
    SERIAL1.lock().write_fmt(args).ok();
}

#[cfg(not(target_os = "none"))]
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    std::print!("{}", args);
}
