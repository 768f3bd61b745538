//! Physical frame allocator
//!
//! A fixed-size bitmap covering the highest available address in the boot
//! memory map, clipped to [`PMM_BITMAP_BYTES`]. One bit per 4 KiB frame;
//! bit set = frame in use. Initialization marks everything used, frees
//! the frames fully contained in available regions, then re-reserves the
//! kernel image, the low 1 MiB, the boot-info blob, and every module.

use spin::Mutex;

use super::{FrameSource, PAGE_SIZE};
use crate::arch::x86_64::multiboot::MemoryRegion;

/// Bitmap backing store: 256 KiB tracks 2M frames (8 GiB of RAM).
pub const PMM_BITMAP_BYTES: usize = 256 * 1024;

/// Low memory reserved for BIOS/IVT/EBDA and the AP trampoline.
const LOW_MEMORY_LIMIT: u64 = 0x100000;

/// Bitmap frame allocator state.
pub struct FrameBitmap {
    bitmap: [u8; PMM_BITMAP_BYTES],
    total_frames: u64,
    free_frames: usize,
}

impl FrameBitmap {
    pub const fn new() -> Self {
        Self {
            bitmap: [0xFF; PMM_BITMAP_BYTES],
            total_frames: 0,
            free_frames: 0,
        }
    }

    #[inline]
    fn set_used(&mut self, frame: u64) {
        self.bitmap[(frame >> 3) as usize] |= 1 << (frame & 7);
    }

    #[inline]
    fn set_free(&mut self, frame: u64) {
        self.bitmap[(frame >> 3) as usize] &= !(1 << (frame & 7));
    }

    #[inline]
    fn is_free(&self, frame: u64) -> bool {
        self.bitmap[(frame >> 3) as usize] & (1 << (frame & 7)) == 0
    }

    /// Build the inventory from the loader memory map plus reserved
    /// physical ranges (half-open `(start, end)` byte addresses).
    pub fn init_from<I>(&mut self, regions: I, reserved: &[(u64, u64)])
    where
        I: Iterator<Item = MemoryRegion> + Clone,
    {
        let page = PAGE_SIZE as u64;

        let max_phys = regions
            .clone()
            .filter(|r| r.available)
            .map(|r| r.addr + r.len)
            .max()
            .unwrap_or(0);

        self.total_frames = max_phys.div_ceil(page);
        let capacity = (PMM_BITMAP_BYTES * 8) as u64;
        if self.total_frames > capacity {
            log::warn!(
                "[PMM] memory above {} GiB ignored (bitmap capacity)",
                capacity * page >> 30
            );
            self.total_frames = capacity;
        }

        self.bitmap.fill(0xFF);

        // Free every frame fully contained in an available region.
        for region in regions.filter(|r| r.available) {
            let first = region.addr.div_ceil(page);
            let last = (region.addr + region.len) / page;
            for frame in first..last.min(self.total_frames) {
                self.set_free(frame);
            }
        }

        // Low 1 MiB stays permanently allocated.
        for frame in 0..(LOW_MEMORY_LIMIT / page).min(self.total_frames) {
            self.set_used(frame);
        }

        for &(start, end) in reserved {
            if start >= end {
                continue;
            }
            let first = start / page;
            let last = end.div_ceil(page);
            for frame in first..last.min(self.total_frames) {
                self.set_used(frame);
            }
        }

        self.free_frames = (0..self.total_frames).filter(|&f| self.is_free(f)).count();
    }

    /// First-fit scan, skipping fully used bytes.
    pub fn alloc_frame(&mut self) -> Option<u64> {
        if self.free_frames == 0 {
            return None;
        }
        let bytes = self.total_frames.div_ceil(8) as usize;
        for byte in 0..bytes {
            if self.bitmap[byte] == 0xFF {
                continue;
            }
            for bit in 0..8 {
                let frame = (byte * 8 + bit) as u64;
                if frame >= self.total_frames {
                    return None;
                }
                if self.is_free(frame) {
                    self.set_used(frame);
                    self.free_frames -= 1;
                    return Some(frame * PAGE_SIZE as u64);
                }
            }
        }
        None
    }

    /// Return a frame. Unaligned or out-of-range addresses are ignored,
    /// and freeing an already-free frame is a silent no-op.
    pub fn free_frame(&mut self, phys: u64) {
        if phys % PAGE_SIZE as u64 != 0 {
            return;
        }
        let frame = phys / PAGE_SIZE as u64;
        if frame >= self.total_frames {
            return;
        }
        if !self.is_free(frame) {
            self.set_free(frame);
            self.free_frames += 1;
        }
    }

    /// Number of free frames.
    pub fn free_count(&self) -> usize {
        self.free_frames
    }

    /// Whether the frame containing `phys` is currently allocated.
    pub fn is_used(&self, phys: u64) -> bool {
        let frame = phys / PAGE_SIZE as u64;
        frame < self.total_frames && !self.is_free(frame)
    }
}

impl FrameSource for FrameBitmap {
    fn alloc_frame(&mut self) -> Option<u64> {
        FrameBitmap::alloc_frame(self)
    }

    fn free_frame(&mut self, phys: u64) {
        FrameBitmap::free_frame(self, phys)
    }
}

/// The authoritative frame inventory.
pub static FRAME_ALLOCATOR: Mutex<FrameBitmap> = Mutex::new(FrameBitmap::new());

/// Initialize the global inventory (boot glue only).
pub fn init<I>(regions: I, reserved: &[(u64, u64)])
where
    I: Iterator<Item = MemoryRegion> + Clone,
{
    let mut pmm = FRAME_ALLOCATOR.lock();
    pmm.init_from(regions, reserved);
    log::info!(
        "[PMM] {} frames tracked, {} free",
        pmm.total_frames,
        pmm.free_frames
    );
}

/// Allocate one frame from the global pool; 0 means exhausted is never
/// returned -- callers receive `None` instead.
pub fn alloc_frame() -> Option<u64> {
    FRAME_ALLOCATOR.lock().alloc_frame()
}

/// Free one frame in the global pool.
pub fn free_frame(phys: u64) {
    FRAME_ALLOCATOR.lock().free_frame(phys)
}

/// Free-frame count of the global pool.
pub fn free_count() -> usize {
    FRAME_ALLOCATOR.lock().free_count()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use std::{boxed::Box, vec::Vec};

    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn regions() -> Vec<MemoryRegion> {
        vec![
            MemoryRegion {
                addr: 0,
                len: 0x9F000,
                available: true,
            },
            MemoryRegion {
                addr: MIB,
                len: 7 * MIB,
                available: true,
            },
            MemoryRegion {
                addr: 0xFFFC_0000,
                len: 0x40000,
                available: false,
            },
        ]
    }

    fn fresh(reserved: &[(u64, u64)]) -> Box<FrameBitmap> {
        let mut pmm = Box::new(FrameBitmap::new());
        pmm.init_from(regions().into_iter(), reserved);
        pmm
    }

    #[test]
    fn alloc_free_restores_count() {
        let mut pmm = fresh(&[]);
        let before = pmm.free_count();
        let frame = pmm.alloc_frame().unwrap();
        assert_eq!(pmm.free_count(), before - 1);
        pmm.free_frame(frame);
        assert_eq!(pmm.free_count(), before);
    }

    #[test]
    fn double_free_is_a_no_op() {
        let mut pmm = fresh(&[]);
        let frame = pmm.alloc_frame().unwrap();
        pmm.free_frame(frame);
        let count = pmm.free_count();
        pmm.free_frame(frame);
        assert_eq!(pmm.free_count(), count);
    }

    #[test]
    fn unaligned_free_is_rejected() {
        let mut pmm = fresh(&[]);
        let count = pmm.free_count();
        pmm.free_frame(0x100001);
        assert_eq!(pmm.free_count(), count);
    }

    #[test]
    fn exhaustion_never_returns_reserved_frames() {
        // Reserve a pretend kernel image at 1..2 MiB.
        let kernel = (MIB, 2 * MIB);
        let mut pmm = fresh(&[kernel]);
        let initial = pmm.free_count();

        let mut allocated = Vec::new();
        while let Some(frame) = pmm.alloc_frame() {
            assert!(
                !(frame >= kernel.0 && frame < kernel.1),
                "allocator returned a reserved kernel frame {:#x}",
                frame
            );
            assert!(frame >= 0x100000, "allocator returned low-memory frame");
            allocated.push(frame);
        }

        assert_eq!(allocated.len(), initial);
        assert_eq!(pmm.free_count(), 0);
        assert!(pmm.alloc_frame().is_none());
    }

    #[test]
    fn partial_frames_at_region_edges_stay_reserved() {
        // Region 0..0x9F000 ends mid-frame after clipping to low memory;
        // everything below 1 MiB must stay used regardless.
        let pmm = fresh(&[]);
        assert!(pmm.is_used(0));
        assert!(pmm.is_used(0x9E000));
    }
}
