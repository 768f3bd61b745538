//! Two-tier kernel allocator
//!
//! `kmalloc`/`kfree` present one surface over two paths: objects of at
//! most 2048 bytes go to the slab, anything larger gets page-backed
//! memory from a bump region that starts just above the kernel BSS.
//! Large regions carry a `{magic, pages}` header immediately before the
//! returned payload; `kfree` masks to the page boundary and dispatches on
//! the magic word.
//!
//! The bump pointer only grows: freeing a large region returns its
//! frames and mappings but never recycles the virtual range.

use core::mem;

use spin::Mutex;

use super::vmm::AddressSpace;
use super::{FrameSource, PageFlags, PAGE_SIZE};

/// 'KMAL': marks a page-backed region header.
const KALLOC_MAGIC: u32 = 0x4B4D_414C;

/// Header at the start of every large region, directly preceding the
/// payload. The magic word distinguishes large from slab origin on free.
#[repr(C)]
struct LargeHeader {
    magic: u32,
    pages: u32,
}

/// Direct-map view of the header of the large region based at
/// `region_base` (a kernel virtual address).
fn header_ptr(space: &AddressSpace, hhdm_base: u64, region_base: u64) -> Option<*mut LargeHeader> {
    let phys = space.translate(region_base)?;
    Some((hhdm_base + phys) as *mut LargeHeader)
}

/// Map and return a large region for `size` bytes; null if the frame
/// pool runs dry (every page installed so far is unmapped and freed).
pub fn large_alloc(
    space: &mut AddressSpace,
    frames: &mut dyn FrameSource,
    bump: &mut u64,
    hhdm_base: u64,
    size: usize,
) -> *mut u8 {
    if size == 0 {
        return core::ptr::null_mut();
    }
    let total = size + mem::size_of::<LargeHeader>();
    let npages = total.div_ceil(PAGE_SIZE);
    let start = *bump;

    let mut mapped = 0;
    for i in 0..npages {
        let virt = start + (i * PAGE_SIZE) as u64;
        if space
            .map_alloc_page(virt, PageFlags::WRITABLE, frames)
            .is_err()
        {
            break;
        }
        mapped += 1;
    }

    if mapped != npages {
        for i in 0..mapped {
            let virt = start + (i * PAGE_SIZE) as u64;
            if let Some(phys) = space.translate(virt) {
                space.unmap_page(virt).ok();
                frames.free_frame(phys);
            }
        }
        return core::ptr::null_mut();
    }

    // SAFETY: the first page of the region was just mapped, so the
    // header is reachable through the direct map.
    unsafe {
        let header = header_ptr(space, hhdm_base, start).expect("fresh mapping must translate");
        (*header).magic = KALLOC_MAGIC;
        (*header).pages = npages as u32;
    }

    *bump = start + (npages * PAGE_SIZE) as u64;
    (start + mem::size_of::<LargeHeader>() as u64) as *mut u8
}

/// Free a large region if `ptr` carries the large-allocation magic.
/// Returns false when the pointer is not a large allocation (the caller
/// then treats it as a slab object).
pub fn large_free(
    space: &mut AddressSpace,
    frames: &mut dyn FrameSource,
    hhdm_base: u64,
    ptr: *mut u8,
) -> bool {
    let base = ptr as u64 & !(PAGE_SIZE as u64 - 1);
    let Some(header) = header_ptr(space, hhdm_base, base) else {
        return false;
    };

    // SAFETY: base translates, so the header page is mapped; the magic
    // check below rejects anything that is not a large region.
    unsafe {
        if (*header).magic != KALLOC_MAGIC {
            return false;
        }
        let pages = (*header).pages;
        for i in 0..pages {
            let virt = base + (i as usize * PAGE_SIZE) as u64;
            if let Some(phys) = space.translate(virt) {
                space.unmap_page(virt).ok();
                frames.free_frame(phys);
            }
        }
    }
    true
}

/// Next virtual address handed to a large allocation.
static LARGE_HEAP_NEXT: Mutex<u64> = Mutex::new(0);

/// Set the bump base (page-aligned end of the kernel BSS). Boot glue only.
pub fn init_large_heap(base: u64) {
    *LARGE_HEAP_NEXT.lock() = base;
}

/// Allocate `size` bytes: slab for `size <= 2048`, page-backed otherwise.
#[cfg(target_os = "none")]
pub fn kmalloc(size: usize) -> *mut u8 {
    if size == 0 {
        return core::ptr::null_mut();
    }
    if size <= super::slab::SLAB_MAX {
        return super::slab::alloc(size);
    }

    let mut bump = LARGE_HEAP_NEXT.lock();
    let mut space = super::vmm::kernel_space_lock();
    let mut frames = super::pmm::FRAME_ALLOCATOR.lock();
    large_alloc(
        &mut space,
        &mut *frames,
        &mut bump,
        super::hhdm_base(),
        size,
    )
}

/// Free a pointer from either tier.
#[cfg(target_os = "none")]
pub fn kfree(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    {
        let mut space = super::vmm::kernel_space_lock();
        let mut frames = super::pmm::FRAME_ALLOCATOR.lock();
        if large_free(&mut space, &mut *frames, super::hhdm_base(), ptr) {
            return;
        }
    }
    super::slab::free(ptr);
}
