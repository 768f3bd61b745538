//! Memory management
//!
//! Three layers, initialized in order during boot:
//! - [`pmm`]: bitmap physical-frame allocator built from the loader
//!   memory map
//! - [`vmm`]: 4-level page-table walker over the higher-half direct map
//! - [`slab`] + [`kalloc`]: the two-tier kernel allocator
//!
//! All physical memory is reachable through the HHDM installed by the
//! loader; intermediate page tables and DMA structures are accessed
//! exclusively through it.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bitflags::bitflags;

pub mod kalloc;
pub mod page_table;
pub mod pmm;
pub mod slab;
pub mod vmm;

/// Size of a physical frame / virtual page (4 KiB).
pub const PAGE_SIZE: usize = 4096;

bitflags! {
    /// x86_64 page-table entry flags (low 12 bits plus NX).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        /// Page-size bit: terminates the walk at PDPT (1 GiB) or PD (2 MiB).
        const HUGE          = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

/// Source of physical frames for page-table and slab growth.
///
/// The production implementation is [`pmm::FrameBitmap`]; tests substitute
/// an arena-backed source so walkers run off-target.
pub trait FrameSource {
    /// Allocate one 4 KiB frame; `None` when the pool is empty.
    fn alloc_frame(&mut self) -> Option<u64>;
    /// Return a frame to the pool.
    fn free_frame(&mut self, phys: u64);
}

/// Base of the higher-half direct map, set once at boot.
static HHDM_BASE: AtomicU64 = AtomicU64::new(0);

/// Becomes true once PMM+VMM are online and the kernel allocator may be
/// used; the global allocator routes to the bootstrap heap before this.
static MM_READY: AtomicBool = AtomicBool::new(false);

/// Record the direct-map base. Called once from boot glue before any
/// frame or table access.
pub fn set_hhdm_base(base: u64) {
    HHDM_BASE.store(base, Ordering::SeqCst);
}

/// The direct-map base.
pub fn hhdm_base() -> u64 {
    HHDM_BASE.load(Ordering::Relaxed)
}

/// Translate a physical address through the direct map.
#[inline]
pub fn phys_to_virt(phys: u64) -> *mut u8 {
    (hhdm_base() + phys) as *mut u8
}

pub(crate) fn set_ready() {
    MM_READY.store(true, Ordering::SeqCst);
}

/// Whether the kernel allocator (slab + large path) is usable.
pub fn is_ready() -> bool {
    MM_READY.load(Ordering::Relaxed)
}

/// Align `value` up to `align` (power of two).
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Align `value` down to `align` (power of two).
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// Full memory-management bring-up: PMM from the boot memory map with the
/// kernel image, low 1 MiB, info blob, and modules reserved; VMM from CR3;
/// then the kernel allocator goes live.
#[cfg(target_os = "none")]
pub fn init(boot: &crate::arch::x86_64::multiboot::BootInfo) {
    extern "C" {
        static _kernel_phys_start: u8;
        static _kernel_bss_end: u8;
    }

    set_hhdm_base(boot.hhdm_base);

    // SAFETY: linker-provided symbols delimiting the loaded image.
    let (kernel_start, kernel_end) = unsafe {
        (
            &_kernel_phys_start as *const u8 as u64,
            &_kernel_bss_end as *const u8 as u64,
        )
    };

    let mut reserved: [(u64, u64); 2 + crate::arch::x86_64::multiboot::MAX_BOOT_MODULES] =
        [(0, 0); 2 + crate::arch::x86_64::multiboot::MAX_BOOT_MODULES];
    reserved[0] = (kernel_start, kernel_end);
    reserved[1] = (
        boot.mb2_phys,
        boot.mb2_phys + boot.total_size() as u64,
    );
    let mut count = 2;
    for module in boot.modules.iter().flatten() {
        reserved[count] = (module.start_phys, module.end_phys);
        count += 1;
    }

    pmm::init(boot.memory_regions(), &reserved[..count]);
    vmm::init();
    slab::init();
    kalloc::init_large_heap(align_up(kernel_end, PAGE_SIZE as u64));
    set_ready();
    log::info!(
        "[MM] online: {} free frames, PML4 at {:#x}",
        pmm::free_count(),
        vmm::pml4_phys()
    );
}
