//! Virtual memory manager
//!
//! Walks and installs 4-level page tables for 4 KiB mappings, honoring
//! huge-page (1 GiB / 2 MiB) entries left by the loader when translating.
//! Intermediate tables are allocated from a [`FrameSource`] and accessed
//! through the higher-half direct map, so the walker also runs against an
//! arena off-target.
//!
//! Kernel-created mappings live in 4 KiB regions distinct from the boot
//! huge-page map; `map_page` assumes the target slot is not currently a
//! huge entry.

use spin::{Mutex, Once};

use super::page_table::{table_indices, PageTable};
use super::{FrameSource, PageFlags};
use crate::error::{KernelError, KernelResult};

/// One 4-level address space rooted at a PML4 frame.
pub struct AddressSpace {
    pml4_phys: u64,
    hhdm_base: u64,
}

impl AddressSpace {
    /// Wrap an existing hierarchy (e.g. the one the loader handed over).
    pub fn new(pml4_phys: u64, hhdm_base: u64) -> Self {
        Self {
            pml4_phys,
            hhdm_base,
        }
    }

    /// Physical address of the root table.
    pub fn pml4_phys(&self) -> u64 {
        self.pml4_phys
    }

    /// Direct-map base of this address space (test support).
    #[cfg(all(test, not(target_os = "none")))]
    pub fn hhdm_for_tests(&self) -> u64 {
        self.hhdm_base
    }

    #[inline]
    fn table_ptr(&self, phys: u64) -> *mut PageTable {
        (self.hhdm_base + phys) as *mut PageTable
    }

    /// Follow `table[index]`, allocating and zeroing a new table frame if
    /// the entry is absent.
    fn ensure_table(
        &mut self,
        table: *mut PageTable,
        index: usize,
        frames: &mut dyn FrameSource,
    ) -> Option<u64> {
        // SAFETY: `table` was derived from a table frame reachable through
        // the direct map and is exclusively owned by this walk.
        let entry = unsafe { &mut (&mut *table)[index] };
        if entry.is_present() {
            return Some(entry.addr());
        }
        let frame = frames.alloc_frame()?;
        // SAFETY: a freshly allocated frame, mapped by the HHDM; zeroing
        // makes every entry non-present before the table is linked in.
        unsafe {
            (*self.table_ptr(frame)).zero();
        }
        entry.set(frame, PageFlags::PRESENT | PageFlags::WRITABLE);
        Some(frame)
    }

    /// Install a 4 KiB mapping `virt -> phys`.
    pub fn map_page(
        &mut self,
        virt: u64,
        phys: u64,
        flags: PageFlags,
        frames: &mut dyn FrameSource,
    ) -> KernelResult<()> {
        let [i4, i3, i2, i1] = table_indices(virt);

        let pml4 = self.table_ptr(self.pml4_phys);
        let pdpt_phys = self
            .ensure_table(pml4, i4, frames)
            .ok_or(KernelError::MappingFailed { virt })?;
        let pdpt = self.table_ptr(pdpt_phys);
        let pd_phys = self
            .ensure_table(pdpt, i3, frames)
            .ok_or(KernelError::MappingFailed { virt })?;
        let pd = self.table_ptr(pd_phys);
        let pt_phys = self
            .ensure_table(pd, i2, frames)
            .ok_or(KernelError::MappingFailed { virt })?;
        let pt = self.table_ptr(pt_phys);

        // SAFETY: pt is a valid page table reached through the walk above.
        unsafe {
            (&mut *pt)[i1].set(phys, flags | PageFlags::PRESENT);
        }
        flush_tlb(virt);
        Ok(())
    }

    /// Remove a 4 KiB mapping. Errors if any level is absent.
    pub fn unmap_page(&mut self, virt: u64) -> KernelResult<()> {
        let [i4, i3, i2, i1] = table_indices(virt);

        let pml4 = self.table_ptr(self.pml4_phys);
        // SAFETY: each pointer below is derived from a present entry of
        // the level above and read through the direct map.
        unsafe {
            let e4 = (&*pml4)[i4];
            if !e4.is_present() {
                return Err(KernelError::MappingFailed { virt });
            }
            let pdpt = self.table_ptr(e4.addr());
            let e3 = (&*pdpt)[i3];
            if !e3.is_present() || e3.is_huge() {
                return Err(KernelError::MappingFailed { virt });
            }
            let pd = self.table_ptr(e3.addr());
            let e2 = (&*pd)[i2];
            if !e2.is_present() || e2.is_huge() {
                return Err(KernelError::MappingFailed { virt });
            }
            let pt = self.table_ptr(e2.addr());
            if !(&*pt)[i1].is_present() {
                return Err(KernelError::MappingFailed { virt });
            }
            (&mut *pt)[i1].clear();
        }
        flush_tlb(virt);
        Ok(())
    }

    /// Walk the tables and resolve `virt` to a physical address,
    /// synthesizing the offset for 1 GiB and 2 MiB entries.
    pub fn translate(&self, virt: u64) -> Option<u64> {
        let [i4, i3, i2, i1] = table_indices(virt);

        // SAFETY: reads of present table frames through the direct map.
        unsafe {
            let e4 = (&*self.table_ptr(self.pml4_phys))[i4];
            if !e4.is_present() {
                return None;
            }
            let e3 = (&*self.table_ptr(e4.addr()))[i3];
            if !e3.is_present() {
                return None;
            }
            if e3.is_huge() {
                return Some(e3.huge_1g_base() | (virt & 0x3FFF_FFFF));
            }
            let e2 = (&*self.table_ptr(e3.addr()))[i2];
            if !e2.is_present() {
                return None;
            }
            if e2.is_huge() {
                return Some(e2.huge_2m_base() | (virt & 0x1F_FFFF));
            }
            let e1 = (&*self.table_ptr(e2.addr()))[i1];
            if !e1.is_present() {
                return None;
            }
            Some(e1.addr() | (virt & 0xFFF))
        }
    }

    /// Allocate a frame and map it at `virt`; the frame is returned to
    /// the source if the mapping fails.
    pub fn map_alloc_page(
        &mut self,
        virt: u64,
        flags: PageFlags,
        frames: &mut dyn FrameSource,
    ) -> KernelResult<u64> {
        let phys = frames.alloc_frame().ok_or(KernelError::OutOfMemory)?;
        if let Err(err) = self.map_page(virt, phys, flags, frames) {
            frames.free_frame(phys);
            return Err(err);
        }
        Ok(phys)
    }
}

#[inline]
fn flush_tlb(virt: u64) {
    #[cfg(target_os = "none")]
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt));
    #[cfg(not(target_os = "none"))]
    let _ = virt;
}

static KERNEL_SPACE: Once<Mutex<AddressSpace>> = Once::new();

/// Capture the active hierarchy from CR3. Called once after the PMM is up.
#[cfg(target_os = "none")]
pub fn init() {
    let pml4 = crate::arch::x86_64::read_cr3();
    KERNEL_SPACE.call_once(|| Mutex::new(AddressSpace::new(pml4, super::hhdm_base())));
    log::info!("[VMM] captured PML4 at {:#x}", pml4);
}

fn kernel_space() -> &'static Mutex<AddressSpace> {
    KERNEL_SPACE.get().expect("VMM used before init")
}

/// Lock the kernel address space (for callers that combine several
/// operations under one acquisition, e.g. the large allocator).
pub(crate) fn kernel_space_lock() -> spin::MutexGuard<'static, AddressSpace> {
    kernel_space().lock()
}

/// Physical address of the kernel PML4.
pub fn pml4_phys() -> u64 {
    kernel_space().lock().pml4_phys()
}

/// Map one kernel page. Lock order: address space, then frame allocator.
pub fn map_page(virt: u64, phys: u64, flags: PageFlags) -> KernelResult<()> {
    let mut space = kernel_space().lock();
    let mut frames = super::pmm::FRAME_ALLOCATOR.lock();
    space.map_page(virt, phys, flags, &mut *frames)
}

/// Unmap one kernel page.
pub fn unmap_page(virt: u64) -> KernelResult<()> {
    kernel_space().lock().unmap_page(virt)
}

/// Resolve a kernel virtual address, or `None` if unmapped.
pub fn translate(virt: u64) -> Option<u64> {
    kernel_space().lock().translate(virt)
}

/// Allocate and map a fresh frame at `virt`.
pub fn map_alloc_page(virt: u64, flags: PageFlags) -> KernelResult<u64> {
    let mut space = kernel_space().lock();
    let mut frames = super::pmm::FRAME_ALLOCATOR.lock();
    space.map_alloc_page(virt, flags, &mut *frames)
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod test_support {
    use std::vec::Vec;

    use super::*;

    /// Frame source over a fake physical memory: a page-aligned arena
    /// where "physical" addresses are offsets from the arena base.
    pub struct ArenaFrames {
        pub next: u64,
        pub limit: u64,
        pub freed: Vec<u64>,
    }

    impl FrameSource for ArenaFrames {
        fn alloc_frame(&mut self) -> Option<u64> {
            if let Some(frame) = self.freed.pop() {
                return Some(frame);
            }
            if self.next >= self.limit {
                return None;
            }
            let frame = self.next;
            self.next += 4096;
            Some(frame)
        }

        fn free_frame(&mut self, phys: u64) {
            self.freed.push(phys);
        }
    }

    /// Build (address space, frame source) over a leaked arena of `pages`
    /// usable frames; frame 0 is the PML4.
    pub fn fake_space(pages: usize) -> (AddressSpace, ArenaFrames) {
        let bytes = (pages + 1) * 4096;
        let layout = std::alloc::Layout::from_size_align(bytes, 4096).unwrap();
        // SAFETY: fresh zeroed allocation, leaked for the test lifetime.
        let base = unsafe { std::alloc::alloc_zeroed(layout) } as u64;
        let space = AddressSpace::new(0, base);
        let frames = ArenaFrames {
            next: 4096,
            limit: bytes as u64,
            freed: Vec::new(),
        };
        (space, frames)
    }
}
