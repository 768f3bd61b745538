// Interrupt Descriptor Table

#![cfg(target_os = "none")]

use core::sync::atomic::{AtomicU64, Ordering};

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::irq;

/// Snapshot of the last fatal exception: (vector, error code, RIP).
/// Written before halting so a debugger can recover the state.
static FAULT_VECTOR: AtomicU64 = AtomicU64::new(0);
static FAULT_CODE: AtomicU64 = AtomicU64::new(0);
static FAULT_RIP: AtomicU64 = AtomicU64::new(0);

fn record_fault(vector: u64, code: u64, rip: u64) {
    FAULT_VECTOR.store(vector, Ordering::SeqCst);
    FAULT_CODE.store(code, Ordering::SeqCst);
    FAULT_RIP.store(rip, Ordering::SeqCst);
}

// The IRQ bridge: record (vector, RIP), drive the PIT tick on vector 32,
// acknowledge the PIC. Handlers must not allocate.
macro_rules! irq_bridge {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(frame: InterruptStackFrame) {
            irq::record($vector, frame.instruction_pointer.as_u64());
            if $vector == irq::PIC_1_OFFSET {
                crate::arch::x86_64::timer::on_tick();
            }
            irq::eoi($vector);
        }
    };
}

irq_bridge!(irq0_handler, 32);
irq_bridge!(irq1_handler, 33);
irq_bridge!(irq2_handler, 34);
irq_bridge!(irq3_handler, 35);
irq_bridge!(irq4_handler, 36);
irq_bridge!(irq5_handler, 37);
irq_bridge!(irq6_handler, 38);
irq_bridge!(irq7_handler, 39);
irq_bridge!(irq8_handler, 40);
irq_bridge!(irq9_handler, 41);
irq_bridge!(irq10_handler, 42);
irq_bridge!(irq11_handler, 43);
irq_bridge!(irq12_handler, 44);
irq_bridge!(irq13_handler, 45);
irq_bridge!(irq14_handler, 46);
irq_bridge!(irq15_handler, 47);

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(super::gdt::DOUBLE_FAULT_IST_INDEX);
        }

        idt[32].set_handler_fn(irq0_handler);
        idt[33].set_handler_fn(irq1_handler);
        idt[34].set_handler_fn(irq2_handler);
        idt[35].set_handler_fn(irq3_handler);
        idt[36].set_handler_fn(irq4_handler);
        idt[37].set_handler_fn(irq5_handler);
        idt[38].set_handler_fn(irq6_handler);
        idt[39].set_handler_fn(irq7_handler);
        idt[40].set_handler_fn(irq8_handler);
        idt[41].set_handler_fn(irq9_handler);
        idt[42].set_handler_fn(irq10_handler);
        idt[43].set_handler_fn(irq11_handler);
        idt[44].set_handler_fn(irq12_handler);
        idt[45].set_handler_fn(irq13_handler);
        idt[46].set_handler_fn(irq14_handler);
        idt[47].set_handler_fn(irq15_handler);
        idt
    };
}

/// Load the IDT and remap the PICs.
pub fn init() {
    IDT.load();
    irq::init();
}

/// Reload the IDT on an AP (the table is shared).
pub fn reload() {
    IDT.load();
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    record_fault(8, error_code, stack_frame.instruction_pointer.as_u64());
    crate::println!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
    crate::arch::halt_loop();
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    record_fault(13, error_code, stack_frame.instruction_pointer.as_u64());
    crate::println!("EXCEPTION: GENERAL PROTECTION FAULT");
    crate::println!("Error Code: {:#x}", error_code);
    crate::println!("{:#?}", stack_frame);
    crate::arch::halt_loop();
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    record_fault(
        14,
        error_code.bits(),
        stack_frame.instruction_pointer.as_u64(),
    );
    crate::println!("EXCEPTION: PAGE FAULT");
    crate::println!("Accessed Address: {:?}", Cr2::read());
    crate::println!("Error Code: {:?}", error_code);
    crate::println!("{:#?}", stack_frame);
    crate::arch::halt_loop();
}
