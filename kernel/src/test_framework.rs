//! Bare-metal test plumbing
//!
//! Host-target unit tests use the standard harness; on the kernel target
//! the custom test framework runs `#[test_case]` functions and reports
//! through the QEMU isa-debug-exit device.

/// Exit codes understood by the QEMU isa-debug-exit device at 0xF4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Exit QEMU (test runs only); falls through to a halt loop when the
/// exit device is absent.
#[cfg(target_os = "none")]
pub fn exit_qemu(exit_code: QemuExitCode) -> ! {
    // SAFETY: port 0xF4 is the isa-debug-exit device configured by the
    // test runner; writing elsewhere it is harmless.
    unsafe {
        crate::arch::outl(0xF4, exit_code as u32);
    }
    crate::arch::halt_loop();
}

#[cfg(all(test, target_os = "none"))]
pub trait Testable {
    fn run(&self);
}

#[cfg(all(test, target_os = "none"))]
impl<T: Fn()> Testable for T {
    fn run(&self) {
        crate::print!("{}...\t", core::any::type_name::<T>());
        self();
        crate::println!("[ok]");
    }
}

#[cfg(all(test, target_os = "none"))]
pub fn test_runner(tests: &[&dyn Testable]) {
    crate::println!("Running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    exit_qemu(QemuExitCode::Success);
}

#[cfg(all(test, target_os = "none"))]
pub fn test_panic_handler(info: &core::panic::PanicInfo) -> ! {
    crate::println!("[failed]");
    crate::println!("Error: {}", info);
    exit_qemu(QemuExitCode::Failed);
}
