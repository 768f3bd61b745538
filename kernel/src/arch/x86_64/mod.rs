//! x86_64 architecture support.
//!
//! Provides hardware initialization (GDT, IDT, PIC), interrupt control,
//! I/O port primitives, MSR and control-register access, and the SMP
//! bring-up machinery.

#![allow(clippy::missing_safety_doc)]

pub mod acpi;
pub mod apic;
pub mod gdt;
pub mod idt;
pub mod multiboot;
pub mod smp;
pub mod timer;

/// Early architecture init: GDT, IDT + PIC remap, then enable interrupts.
///
/// Must run before any subsystem that takes a hardware interrupt (the PIT
/// tick in particular).
#[cfg(target_os = "none")]
pub fn init() {
    // SAFETY: interrupts must be off while the descriptor tables are
    // swapped; idt::init re-enables nothing on its own.
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack));
    }

    gdt::init();
    idt::init();

    x86_64::instructions::interrupts::enable();
    log::info!("[ARCH] GDT/IDT installed, interrupts enabled");
}

/// Write a byte to an I/O port.
pub unsafe fn outb(port: u16, value: u8) {
    use x86_64::instructions::port::Port;
    Port::new(port).write(value);
}

/// Read a byte from an I/O port.
pub unsafe fn inb(port: u16) -> u8 {
    use x86_64::instructions::port::Port;
    Port::new(port).read()
}

/// Write a word to an I/O port.
pub unsafe fn outw(port: u16, value: u16) {
    use x86_64::instructions::port::Port;
    Port::new(port).write(value);
}

/// Read a word from an I/O port.
pub unsafe fn inw(port: u16) -> u16 {
    use x86_64::instructions::port::Port;
    Port::new(port).read()
}

/// Write a dword to an I/O port.
pub unsafe fn outl(port: u16, value: u32) {
    use x86_64::instructions::port::Port;
    Port::new(port).write(value);
}

/// Read a dword from an I/O port.
pub unsafe fn inl(port: u16) -> u32 {
    use x86_64::instructions::port::Port;
    Port::new(port).read()
}

/// Read an MSR.
pub fn read_msr(msr: u32) -> u64 {
    // SAFETY: reading a model-specific register has no memory effects; the
    // callers only name architecturally defined MSRs (APIC base, x2APIC
    // register file).
    unsafe { x86_64::registers::model_specific::Msr::new(msr).read() }
}

/// Write an MSR.
pub fn write_msr(msr: u32, value: u64) {
    // SAFETY: see read_msr; callers only touch APIC-related MSRs.
    unsafe { x86_64::registers::model_specific::Msr::new(msr).write(value) }
}

/// Physical address of the active top-level page table.
pub fn read_cr3() -> u64 {
    let (frame, _) = x86_64::registers::control::Cr3::read();
    frame.start_address().as_u64()
}

/// CPUID leaf 1 ECX, used for the x2APIC feature probe.
pub fn cpuid_features_ecx() -> u32 {
    // SAFETY: CPUID leaf 1 is supported on every x86_64 CPU.
    unsafe { core::arch::x86_64::__cpuid(1).ecx }
}

/// Enable SSE (clear CR0.EM, set CR0.MP, set CR4.OSFXSR/OSXMMEXCPT).
///
/// The BSP gets this from the bootloader handoff; each AP must call it
/// before touching any floating-point state.
#[cfg(target_os = "none")]
pub fn enable_sse() {
    use x86_64::registers::control::{Cr0, Cr0Flags, Cr4, Cr4Flags};
    // SAFETY: flipping the FPU/SSE control bits is a local CPU state
    // change with no memory effects.
    unsafe {
        let mut cr0 = Cr0::read();
        cr0.remove(Cr0Flags::EMULATE_COPROCESSOR);
        cr0.insert(Cr0Flags::MONITOR_COPROCESSOR);
        Cr0::write(cr0);

        let mut cr4 = Cr4::read();
        cr4.insert(Cr4Flags::OSFXSR | Cr4Flags::OSXMMEXCPT_ENABLE);
        Cr4::write(cr4);
    }
}

/// Halt forever with interrupts disabled.
pub fn halt_loop() -> ! {
    #[cfg(target_os = "none")]
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
    #[cfg(not(target_os = "none"))]
    loop {
        core::hint::spin_loop();
    }
}

/// Halt until the next interrupt (the idle loop body).
#[cfg(target_os = "none")]
pub fn wait_for_interrupt() {
    x86_64::instructions::hlt();
}
