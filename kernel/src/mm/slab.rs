//! Slab allocator with per-CPU magazines
//!
//! Objects up to 2048 bytes come from slab pages: 4 KiB frames whose
//! header records the size class and whose body is cut into equal
//! objects, free objects threading their next pointer through their own
//! first word. Each size class keeps a list of partial pages and one
//! fixed-capacity magazine per CPU; allocation prefers the magazine, then
//! the head partial page. A page whose free count returns to
//! objects-per-page is unlinked and its frame handed back.
//!
//! Magazine objects are not on any page free list; the sum of page free
//! lists and magazines is the total free count for a class.

use core::ptr;

use spin::Mutex;

use super::{FrameSource, PAGE_SIZE};

/// Size classes served by the slab.
pub const SIZE_CLASSES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// Largest size the slab serves; anything bigger is a large allocation.
pub const SLAB_MAX: usize = 2048;

/// Per-CPU magazine capacity.
pub const SLAB_MAGAZINE_SIZE: usize = 16;

/// Magazines provisioned per class. Until per-CPU state exists the CPU
/// selector returns 0, so early callers share the class-zero magazine.
pub const SLAB_MAX_CPUS: usize = 4;

/// Space reserved at the start of every slab page for [`SlabPageHeader`].
const HEADER_SIZE: usize = 32;

/// Header at the base of every slab page. Reachable from any object by
/// masking the pointer down to page alignment; `obj_size` must match the
/// owning class.
#[repr(C)]
struct SlabPageHeader {
    next: *mut SlabPageHeader,
    obj_size: u32,
    free_count: u16,
    objs_per_page: u16,
    free_list: *mut u8,
}

/// Fixed stack of free object pointers for one CPU.
struct Magazine {
    objs: [*mut u8; SLAB_MAGAZINE_SIZE],
    count: usize,
}

impl Magazine {
    const fn new() -> Self {
        Self {
            objs: [ptr::null_mut(); SLAB_MAGAZINE_SIZE],
            count: 0,
        }
    }
}

struct SlabCache {
    obj_size: usize,
    partial: *mut SlabPageHeader,
    magazines: [Magazine; SLAB_MAX_CPUS],
}

/// All size-class caches. Accesses go through the module-level
/// [`SLAB`] mutex; the raw pointers inside never leave the lock.
pub struct SlabAllocator {
    caches: [SlabCache; SIZE_CLASSES.len()],
    hhdm_base: u64,
}

// SAFETY: the contained pointers reference slab pages owned exclusively
// by this allocator and are only dereferenced under the SLAB lock.
unsafe impl Send for SlabAllocator {}

/// Current CPU for magazine selection. Per-CPU state does not exist yet
/// during single-processor bring-up, so this is always 0; callers racing
/// from APs would need the translation-table scheme first.
fn current_cpu() -> usize {
    0
}

fn class_index(size: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&class| size <= class)
}

impl SlabAllocator {
    pub const fn new() -> Self {
        const EMPTY_CACHE: SlabCache = SlabCache {
            obj_size: 0,
            partial: ptr::null_mut(),
            magazines: [const { Magazine::new() }; SLAB_MAX_CPUS],
        };
        let mut allocator = Self {
            caches: [EMPTY_CACHE; SIZE_CLASSES.len()],
            hhdm_base: 0,
        };
        let mut i = 0;
        while i < SIZE_CLASSES.len() {
            allocator.caches[i].obj_size = SIZE_CLASSES[i];
            i += 1;
        }
        allocator
    }

    /// Record the direct-map base; must precede any allocation.
    pub fn set_hhdm_base(&mut self, base: u64) {
        self.hhdm_base = base;
    }

    /// Carve a fresh frame into a slab page for `obj_size` objects.
    fn create_page(&self, obj_size: usize, frames: &mut dyn FrameSource) -> *mut SlabPageHeader {
        let Some(phys) = frames.alloc_frame() else {
            return ptr::null_mut();
        };
        let base = (self.hhdm_base + phys) as *mut u8;

        // Objects start at the first obj_size-aligned offset past the
        // header, so every object is naturally aligned for its class.
        let data_start = HEADER_SIZE.max(obj_size).next_multiple_of(obj_size);
        let objs_per_page = (PAGE_SIZE - data_start) / obj_size;

        // SAFETY: `base` addresses a whole fresh frame through the HHDM.
        unsafe {
            ptr::write_bytes(base, 0, PAGE_SIZE);
            let header = base as *mut SlabPageHeader;
            (*header).next = ptr::null_mut();
            (*header).obj_size = obj_size as u32;
            (*header).objs_per_page = objs_per_page as u16;
            (*header).free_count = objs_per_page as u16;
            (*header).free_list = ptr::null_mut();

            for i in 0..objs_per_page {
                let obj = base.add(data_start + i * obj_size);
                *(obj as *mut *mut u8) = (*header).free_list;
                (*header).free_list = obj;
            }
            header
        }
    }

    /// Allocate one object of at most `size` bytes; null when the class
    /// is too large or the frame pool is dry.
    pub fn alloc(&mut self, size: usize, frames: &mut dyn FrameSource) -> *mut u8 {
        let Some(idx) = class_index(size) else {
            return ptr::null_mut();
        };
        let cpu = current_cpu();

        let magazine = &mut self.caches[idx].magazines[cpu];
        if magazine.count > 0 {
            magazine.count -= 1;
            return magazine.objs[magazine.count];
        }

        // SAFETY: partial-list pages are live slab pages owned by this
        // cache; all pointer chasing stays under the allocator lock.
        unsafe {
            let mut page = self.caches[idx].partial;
            if page.is_null() || (*page).free_count == 0 {
                page = self.create_page(SIZE_CLASSES[idx], frames);
                if page.is_null() {
                    return ptr::null_mut();
                }
                (*page).next = self.caches[idx].partial;
                self.caches[idx].partial = page;
            }

            let obj = (*page).free_list;
            (*page).free_list = *(obj as *mut *mut u8);
            (*page).free_count -= 1;
            obj
        }
    }

    /// Free a slab object. The owning page and class are recovered from
    /// the page header.
    pub fn free(&mut self, obj: *mut u8, frames: &mut dyn FrameSource) {
        if obj.is_null() {
            return;
        }
        let page = (obj as usize & !(PAGE_SIZE - 1)) as *mut SlabPageHeader;

        // SAFETY: callers only pass pointers previously returned by
        // `alloc`, so the masked base is a live slab page header.
        unsafe {
            let obj_size = (*page).obj_size as usize;
            let Some(idx) = class_index(obj_size) else {
                return;
            };
            if (*page).objs_per_page == 0 || obj_size != SIZE_CLASSES[idx] {
                return;
            }
            let cpu = current_cpu();
            let hhdm_base = self.hhdm_base;
            let cache = &mut self.caches[idx];

            let magazine = &mut cache.magazines[cpu];
            if magazine.count < SLAB_MAGAZINE_SIZE {
                magazine.objs[magazine.count] = obj;
                magazine.count += 1;
                return;
            }

            *(obj as *mut *mut u8) = (*page).free_list;
            (*page).free_list = obj;
            (*page).free_count += 1;

            if (*page).free_count == (*page).objs_per_page {
                // Fully free: unlink and hand the frame back.
                let mut link = &mut cache.partial as *mut *mut SlabPageHeader;
                while !(*link).is_null() {
                    if *link == page {
                        *link = (*page).next;
                        break;
                    }
                    link = &mut (*(*link)).next as *mut *mut SlabPageHeader;
                }
                frames.free_frame(page as u64 - hhdm_base);
            }
        }
    }

    /// Total free objects for the class serving `size_class` bytes:
    /// page free lists plus every magazine.
    pub fn free_objects(&self, size_class: usize) -> usize {
        let Some(idx) = class_index(size_class) else {
            return 0;
        };
        let cache = &self.caches[idx];
        let mut total = 0;
        // SAFETY: partial pages are owned by the cache (see alloc).
        unsafe {
            let mut page = cache.partial;
            while !page.is_null() {
                total += (*page).free_count as usize;
                page = (*page).next;
            }
        }
        for magazine in &cache.magazines {
            total += magazine.count;
        }
        total
    }
}

/// Global slab, shared by `kmalloc` and the global allocator.
pub static SLAB: Mutex<SlabAllocator> = Mutex::new(SlabAllocator::new());

/// Point the global slab at the direct map (boot glue only).
pub fn init() {
    SLAB.lock().set_hhdm_base(super::hhdm_base());
    log::info!(
        "[SLAB] classes up to {} bytes, {} magazines of {}",
        SLAB_MAX,
        SLAB_MAX_CPUS,
        SLAB_MAGAZINE_SIZE
    );
}

/// Allocate from the global slab.
pub fn alloc(size: usize) -> *mut u8 {
    let mut slab = SLAB.lock();
    let mut frames = super::pmm::FRAME_ALLOCATOR.lock();
    slab.alloc(size, &mut *frames)
}

/// Free to the global slab.
pub fn free(obj: *mut u8) {
    let mut slab = SLAB.lock();
    let mut frames = super::pmm::FRAME_ALLOCATOR.lock();
    slab.free(obj, &mut *frames)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use std::vec::Vec;

    use super::super::vmm::test_support::ArenaFrames;
    use super::*;

    fn fixture(pages: usize) -> (SlabAllocator, ArenaFrames) {
        let bytes = pages * PAGE_SIZE;
        let layout = std::alloc::Layout::from_size_align(bytes, PAGE_SIZE).unwrap();
        // SAFETY: fresh allocation leaked for the test lifetime.
        let base = unsafe { std::alloc::alloc_zeroed(layout) } as u64;
        let mut slab = SlabAllocator::new();
        slab.set_hhdm_base(base);
        let frames = ArenaFrames {
            next: 0,
            limit: bytes as u64,
            freed: Vec::new(),
        };
        (slab, frames)
    }

    #[test]
    fn header_reachable_from_object_pointer() {
        let (mut slab, mut frames) = fixture(4);
        let obj = slab.alloc(100, &mut frames);
        assert!(!obj.is_null());
        let header = (obj as usize & !(PAGE_SIZE - 1)) as *const SlabPageHeader;
        assert_eq!(unsafe { (*header).obj_size }, 128);
    }

    #[test]
    fn alloc_free_preserves_aggregate_free_count() {
        let (mut slab, mut frames) = fixture(4);
        for &size in &[16usize, 40, 512, 2000] {
            let obj = slab.alloc(size, &mut frames);
            assert!(!obj.is_null());
            let class = SIZE_CLASSES[class_index(size).unwrap()];
            let after_alloc = slab.free_objects(class);
            slab.free(obj, &mut frames);
            assert_eq!(slab.free_objects(class), after_alloc + 1);
        }
    }

    #[test]
    fn free_prefers_the_magazine() {
        let (mut slab, mut frames) = fixture(4);
        let obj = slab.alloc(64, &mut frames);
        slab.free(obj, &mut frames);
        // The object sits in the CPU-0 magazine, not on the page list,
        // and comes straight back on the next allocation.
        assert_eq!(slab.caches[class_index(64).unwrap()].magazines[0].count, 1);
        let again = slab.alloc(64, &mut frames);
        assert_eq!(again, obj);
        slab.free(again, &mut frames);
    }

    #[test]
    fn distinct_objects_until_page_exhausted() {
        let (mut slab, mut frames) = fixture(8);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let obj = slab.alloc(256, &mut frames);
            assert!(!obj.is_null());
            assert!(seen.insert(obj as usize), "duplicate object handed out");
        }
    }

    #[test]
    fn fully_free_page_returns_to_frame_source() {
        // Class 2048 holds one object per page, so overflowing the
        // magazine by one forces a page onto its own free list and
        // releases it.
        let (mut slab, mut frames) = fixture(SLAB_MAGAZINE_SIZE + 2);
        let mut objs = Vec::new();
        for _ in 0..SLAB_MAGAZINE_SIZE + 1 {
            objs.push(slab.alloc(2048, &mut frames));
        }
        for obj in objs {
            slab.free(obj, &mut frames);
        }
        assert_eq!(frames.freed.len(), 1, "one fully-free page released");
    }
}
