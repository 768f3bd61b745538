//! Kernel binary entry
//!
//! The loader (via the Multiboot2 trampoline in the boot assembly)
//! enters `_start` with the physical address of the info blob and the
//! higher-half direct-map base. Both are trusted as handed over.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn _start(mb2_phys: u64, hhdm_base: u64) -> ! {
    vanadium_kernel::init_boot_heap();

    // SAFETY: the loader contract guarantees a valid info blob and a
    // direct map covering physical memory.
    let boot = unsafe { vanadium_kernel::arch::x86_64::multiboot::init(mb2_phys, hhdm_base) };

    vanadium_kernel::bootstrap::kernel_main(boot)
}

// The panic handler lives in the library crate.

// Host builds of the workspace still compile the binary crate; there is
// nothing to run outside the kernel target.
#[cfg(not(target_os = "none"))]
fn main() {}
