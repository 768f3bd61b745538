//! Multiboot2 boot information
//!
//! The loader hands over the physical address of the Multiboot2 info blob
//! and the higher-half direct-map base. Everything the kernel consumes from
//! the blob -- command line, modules, memory map, RSDP, framebuffer -- is
//! captured here once, early, into a [`BootInfo`] that the rest of the
//! kernel reads through [`boot_info`].
//!
//! Tag parsing operates on a byte slice so it can be exercised off-target.

use core::arch::global_asm;

use spin::Once;

// Multiboot2 header, found by the loader in the first 32 KiB of the image.
#[cfg(target_os = "none")]
global_asm!(
    r#"
.section .multiboot_header, "aw"
.align 8

multiboot_header_start:
    .long 0xe85250d6                // magic number
    .long 0                         // architecture (0 = i386)
    .long multiboot_header_end - multiboot_header_start  // header length

    // checksum
    .long -(0xe85250d6 + 0 + (multiboot_header_end - multiboot_header_start))

    // End tag
    .word 0                         // type
    .word 0                         // flags
    .long 8                         // size
multiboot_header_end:
"#
);

/// Multiboot2 tag types consumed by this kernel.
mod tag {
    pub const END: u32 = 0;
    pub const CMDLINE: u32 = 1;
    pub const MODULE: u32 = 3;
    pub const MMAP: u32 = 6;
    pub const FRAMEBUFFER: u32 = 8;
    pub const ACPI_OLD: u32 = 14;
    pub const ACPI_NEW: u32 = 15;
}

/// Memory-map entry type for usable RAM.
const MEMORY_AVAILABLE: u32 = 1;

/// Maximum boot modules tracked.
pub const MAX_BOOT_MODULES: usize = 16;

/// Fixed command-line buffer size; longer command lines are truncated.
const CMDLINE_MAX: usize = 256;

/// One boot module (e.g. the initrd), by physical extent plus its path
/// string inside the info blob.
#[derive(Debug, Clone, Copy)]
pub struct BootModule {
    pub start_phys: u64,
    pub end_phys: u64,
    pub path: &'static str,
}

impl BootModule {
    pub fn len(&self) -> usize {
        (self.end_phys - self.start_phys) as usize
    }
}

/// Framebuffer description from the loader (the terminal driver itself is
/// outside this kernel's scope; the tag is captured for completeness).
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    pub addr: u64,
    pub pitch: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u8,
    pub red_shift: u8,
    pub red_mask_size: u8,
    pub green_shift: u8,
    pub green_mask_size: u8,
    pub blue_shift: u8,
    pub blue_mask_size: u8,
}

/// One memory-map region as reported by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub addr: u64,
    pub len: u64,
    pub available: bool,
}

/// Everything captured from the Multiboot2 handoff.
pub struct BootInfo {
    /// Physical address of the info blob (reserved from the PMM).
    pub mb2_phys: u64,
    /// Higher-half direct-map base installed by the loader.
    pub hhdm_base: u64,
    /// The raw info blob, viewed through the direct map.
    blob: &'static [u8],
    cmdline: [u8; CMDLINE_MAX],
    cmdline_len: usize,
    pub modules: [Option<BootModule>; MAX_BOOT_MODULES],
    pub module_count: usize,
    /// RSDP structure bytes inside the blob, if the loader passed one.
    pub rsdp: Option<&'static [u8]>,
    pub framebuffer: Option<FramebufferInfo>,
}

static BOOT_INFO: Once<BootInfo> = Once::new();

/// Global boot info. Panics if called before [`init`].
pub fn boot_info() -> &'static BootInfo {
    BOOT_INFO
        .get()
        .expect("boot_info queried before multiboot::init")
}

/// Capture the Multiboot2 blob. Called exactly once from `_start`.
///
/// # Safety
///
/// `mb2_phys` must be the physical address of a valid Multiboot2 info blob
/// and `hhdm_base` a direct map covering all physical memory, both exactly
/// as handed over by the loader. The kernel trusts both.
#[cfg(target_os = "none")]
pub unsafe fn init(mb2_phys: u64, hhdm_base: u64) -> &'static BootInfo {
    let base = (hhdm_base + mb2_phys) as *const u8;
    let total_size = core::ptr::read(base as *const u32) as usize;
    let blob = core::slice::from_raw_parts(base, total_size);
    BOOT_INFO.call_once(|| BootInfo::parse(blob, mb2_phys, hhdm_base))
}

/// Iterator over the 8-byte-aligned tag sequence of an info blob.
struct TagIter<'a> {
    blob: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for TagIter<'a> {
    /// (tag type, full tag bytes including the 8-byte header)
    type Item = (u32, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + 8 > self.blob.len() {
            return None;
        }
        let ty = read_u32(self.blob, self.offset);
        let size = read_u32(self.blob, self.offset + 4) as usize;
        if ty == tag::END || size < 8 || self.offset + size > self.blob.len() {
            return None;
        }
        let bytes = &self.blob[self.offset..self.offset + size];
        self.offset += (size + 7) & !7;
        Some((ty, bytes))
    }
}

fn tags(blob: &[u8]) -> TagIter<'_> {
    // The blob starts with total_size (u32) and reserved (u32).
    TagIter { blob, offset: 8 }
}

fn read_u32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn read_u64(b: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(raw)
}

fn c_str(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    core::str::from_utf8(&bytes[..end]).unwrap_or("")
}

impl BootInfo {
    /// Parse an info blob. `blob` must stay alive for the kernel lifetime
    /// (module path strings borrow from it).
    pub fn parse(blob: &'static [u8], mb2_phys: u64, hhdm_base: u64) -> Self {
        let mut info = BootInfo {
            mb2_phys,
            hhdm_base,
            blob,
            cmdline: [0; CMDLINE_MAX],
            cmdline_len: 0,
            modules: [None; MAX_BOOT_MODULES],
            module_count: 0,
            rsdp: None,
            framebuffer: None,
        };

        for (ty, bytes) in tags(blob) {
            match ty {
                tag::CMDLINE => {
                    let src = c_str(&bytes[8..]);
                    let len = src.len().min(CMDLINE_MAX - 1);
                    info.cmdline[..len].copy_from_slice(&src.as_bytes()[..len]);
                    info.cmdline_len = len;
                }
                tag::MODULE => {
                    if info.module_count < MAX_BOOT_MODULES {
                        let start = read_u32(bytes, 8) as u64;
                        let end = read_u32(bytes, 12) as u64;
                        info.modules[info.module_count] = Some(BootModule {
                            start_phys: start,
                            end_phys: end,
                            path: c_str(&bytes[16..]),
                        });
                        info.module_count += 1;
                    }
                }
                tag::ACPI_OLD | tag::ACPI_NEW => {
                    if info.rsdp.is_none() {
                        info.rsdp = Some(&bytes[8..]);
                    }
                }
                tag::FRAMEBUFFER if bytes.len() >= 38 => {
                    info.framebuffer = Some(FramebufferInfo {
                        addr: read_u64(bytes, 8),
                        pitch: read_u32(bytes, 16),
                        width: read_u32(bytes, 20),
                        height: read_u32(bytes, 24),
                        bpp: bytes[28],
                        // RGB color info follows the common fields.
                        red_shift: bytes[32],
                        red_mask_size: bytes[33],
                        green_shift: bytes[34],
                        green_mask_size: bytes[35],
                        blue_shift: bytes[36],
                        blue_mask_size: bytes[37],
                    });
                }
                _ => {}
            }
        }
        info
    }

    /// The kernel command line (possibly empty).
    pub fn cmdline(&self) -> &str {
        core::str::from_utf8(&self.cmdline[..self.cmdline_len]).unwrap_or("")
    }

    /// Total size of the info blob in bytes.
    pub fn total_size(&self) -> usize {
        self.blob.len()
    }

    /// Iterate the loader memory map.
    pub fn memory_regions(&self) -> impl Iterator<Item = MemoryRegion> + Clone + '_ {
        let mut out = MemoryRegionIter {
            entries: &[],
            entry_size: 0,
            offset: 0,
        };
        for (ty, bytes) in tags(self.blob) {
            if ty == tag::MMAP {
                let entry_size = read_u32(bytes, 8) as usize;
                if entry_size >= 24 {
                    out = MemoryRegionIter {
                        entries: &bytes[16..],
                        entry_size,
                        offset: 0,
                    };
                }
                break;
            }
        }
        out
    }

    /// Module data through the direct map.
    ///
    /// # Safety
    ///
    /// Valid only on-target where the HHDM covers the module's physical
    /// range; the PMM reserves the range so it is never reused.
    #[cfg(target_os = "none")]
    pub unsafe fn module_bytes(&self, module: &BootModule) -> &'static [u8] {
        core::slice::from_raw_parts(
            (self.hhdm_base + module.start_phys) as *const u8,
            module.len(),
        )
    }
}

#[derive(Clone)]
struct MemoryRegionIter<'a> {
    entries: &'a [u8],
    entry_size: usize,
    offset: usize,
}

impl Iterator for MemoryRegionIter<'_> {
    type Item = MemoryRegion;

    fn next(&mut self) -> Option<MemoryRegion> {
        if self.entry_size == 0 || self.offset + self.entry_size > self.entries.len() {
            return None;
        }
        let e = &self.entries[self.offset..];
        self.offset += self.entry_size;
        Some(MemoryRegion {
            addr: read_u64(e, 0),
            len: read_u64(e, 8),
            available: read_u32(e, 16) == MEMORY_AVAILABLE,
        })
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use std::{boxed::Box, string::String, vec::Vec};

    use super::*;

    fn push_tag(blob: &mut Vec<u8>, ty: u32, payload: &[u8]) {
        let size = 8 + payload.len() as u32;
        blob.extend_from_slice(&ty.to_le_bytes());
        blob.extend_from_slice(&size.to_le_bytes());
        blob.extend_from_slice(payload);
        while blob.len() % 8 != 0 {
            blob.push(0);
        }
    }

    fn build_blob(build: impl FnOnce(&mut Vec<u8>)) -> &'static [u8] {
        let mut blob = vec![0u8; 8];
        build(&mut blob);
        push_tag(&mut blob, tag::END, &[]);
        let total = blob.len() as u32;
        blob[0..4].copy_from_slice(&total.to_le_bytes());
        Box::leak(blob.into_boxed_slice())
    }

    #[test]
    fn parses_cmdline_and_module() {
        let blob = build_blob(|b| {
            push_tag(b, tag::CMDLINE, b"root=/dev/sda1 loglevel=1\0");
            let mut module = Vec::new();
            module.extend_from_slice(&0x100000u32.to_le_bytes());
            module.extend_from_slice(&0x140000u32.to_le_bytes());
            module.extend_from_slice(b"initrd.tar\0");
            push_tag(b, tag::MODULE, &module);
        });

        let info = BootInfo::parse(blob, 0x9000, 0);
        assert_eq!(info.cmdline(), "root=/dev/sda1 loglevel=1");
        assert_eq!(info.module_count, 1);
        let module = info.modules[0].unwrap();
        assert_eq!(module.start_phys, 0x100000);
        assert_eq!(module.len(), 0x40000);
        assert_eq!(module.path, "initrd.tar");
    }

    #[test]
    fn memory_map_regions_round_trip() {
        let blob = build_blob(|b| {
            let mut mmap = Vec::new();
            mmap.extend_from_slice(&24u32.to_le_bytes()); // entry_size
            mmap.extend_from_slice(&0u32.to_le_bytes()); // entry_version
            for (addr, len, ty) in [
                (0u64, 0x9F000u64, 1u32),
                (0x100000, 0x7EE0000, 1),
                (0xFFFC0000, 0x40000, 2),
            ] {
                mmap.extend_from_slice(&addr.to_le_bytes());
                mmap.extend_from_slice(&len.to_le_bytes());
                mmap.extend_from_slice(&ty.to_le_bytes());
                mmap.extend_from_slice(&0u32.to_le_bytes());
            }
            push_tag(b, tag::MMAP, &mmap);
        });

        let info = BootInfo::parse(blob, 0, 0);
        let regions: Vec<_> = info.memory_regions().collect();
        assert_eq!(regions.len(), 3);
        assert!(regions[0].available);
        assert_eq!(regions[1].addr, 0x100000);
        assert_eq!(regions[1].len, 0x7EE0000);
        assert!(!regions[2].available);
    }

    #[test]
    fn truncates_overlong_cmdline() {
        let long = "x".repeat(400);
        let blob = build_blob(|b| {
            let mut payload = long.clone().into_bytes();
            payload.push(0);
            push_tag(b, tag::CMDLINE, &payload);
        });
        let info = BootInfo::parse(blob, 0, 0);
        assert_eq!(info.cmdline().len(), CMDLINE_MAX - 1);
    }
}
