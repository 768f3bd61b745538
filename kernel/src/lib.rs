//! vanadium-kernel library
//!
//! A 64-bit x86 kernel booted through Multiboot2: physical and virtual
//! memory management, a two-tier kernel allocator, PCI enumeration with
//! driver dispatch, an AHCI storage engine, a block/VFS stack, and
//! APIC-driven interrupt and SMP bring-up. The crate doubles as a host
//! library so the hardware-independent logic runs under the standard
//! test harness.

#![no_std]
#![cfg_attr(all(test, target_os = "none"), no_main)]
#![feature(custom_test_frameworks)]
#![feature(abi_x86_interrupt)]
#![cfg_attr(target_os = "none", test_runner(crate::test_framework::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

extern crate alloc;

// Host target: use the system allocator so unit tests allocate normally;
// macro_use brings vec!/format! into scope for test code.
#[cfg(not(target_os = "none"))]
#[macro_use]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod bootstrap;
pub mod cmdline;
pub mod drivers;
pub mod error;
pub mod fs;
pub mod irq;
pub mod logger;
pub mod mm;
pub mod serial;
pub mod test_framework;

#[cfg(target_os = "none")]
mod kernel_heap {
    //! The global allocator: a small bootstrap heap
    //! (`linked_list_allocator`) until memory management is online, the
    //! two-tier kernel allocator afterwards. Frees are dispatched by
    //! address range, so objects born on the bootstrap heap die there.

    use core::alloc::{GlobalAlloc, Layout};

    use linked_list_allocator::LockedHeap;

    /// Bootstrap heap backing store (1 MiB of BSS).
    const BOOT_HEAP_SIZE: usize = 1 << 20;
    static mut BOOT_HEAP: [u8; BOOT_HEAP_SIZE] = [0; BOOT_HEAP_SIZE];

    static BOOT_ALLOC: LockedHeap = LockedHeap::empty();

    fn boot_heap_bounds() -> (usize, usize) {
        let start = core::ptr::addr_of!(BOOT_HEAP) as usize;
        (start, start + BOOT_HEAP_SIZE)
    }

    /// Initialize the bootstrap heap. Called once from `_start` before
    /// any allocation.
    pub fn init() {
        // SAFETY: BOOT_HEAP is a dedicated static handed to the
        // allocator exactly once.
        unsafe {
            BOOT_ALLOC
                .lock()
                .init(core::ptr::addr_of_mut!(BOOT_HEAP) as *mut u8, BOOT_HEAP_SIZE);
        }
    }

    pub struct KernelHeap;

    unsafe impl GlobalAlloc for KernelHeap {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            let effective = layout.size().max(layout.align());
            if crate::mm::is_ready() {
                if effective <= crate::mm::slab::SLAB_MAX {
                    return crate::mm::slab::alloc(effective);
                }
                if layout.align() <= 8 {
                    return crate::mm::kalloc::kmalloc(effective);
                }
                // Rare large+overaligned case: the bootstrap heap honors
                // arbitrary alignment.
            }
            BOOT_ALLOC
                .lock()
                .allocate_first_fit(layout)
                .map(|ptr| ptr.as_ptr())
                .unwrap_or(core::ptr::null_mut())
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            let (start, end) = boot_heap_bounds();
            let addr = ptr as usize;
            if addr >= start && addr < end {
                BOOT_ALLOC
                    .lock()
                    .deallocate(core::ptr::NonNull::new_unchecked(ptr), layout);
            } else {
                crate::mm::kalloc::kfree(ptr);
            }
        }
    }
}

#[cfg(target_os = "none")]
#[global_allocator]
static KERNEL_HEAP: kernel_heap::KernelHeap = kernel_heap::KernelHeap;

/// Bootstrap-heap init, re-exported for the binary's `_start`.
#[cfg(target_os = "none")]
pub fn init_boot_heap() {
    kernel_heap::init();
}

#[cfg(all(target_os = "none", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("[KERNEL PANIC] {}", info);
    arch::halt_loop();
}

#[cfg(all(test, target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_framework::test_panic_handler(info)
}

#[cfg(all(test, target_os = "none"))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    test_main();
    arch::halt_loop();
}
