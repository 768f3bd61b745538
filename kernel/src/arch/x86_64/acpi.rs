//! ACPI table discovery
//!
//! Walks the RSDP to the RSDT or XSDT and exposes table lookup by
//! signature. Of the ACPI universe this kernel consumes exactly two
//! tables: the MADT (APIC topology: LAPIC address, I/O APICs, interrupt
//! source overrides, CPUs) and the FADT (presence check only). A missing
//! RSDP or malformed MADT is fatal.

use alloc::vec::Vec;

use spin::Once;

use crate::error::{KernelError, KernelResult};

/// SDT header length field offset / header size.
const SDT_HEADER_LEN: usize = 36;

/// One I/O APIC reported by the MADT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoApicInfo {
    pub id: u8,
    pub addr: u32,
    pub gsi_base: u32,
}

/// An interrupt source override (legacy IRQ -> GSI with flags).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptOverride {
    pub bus_src: u8,
    pub irq_src: u8,
    pub gsi: u32,
    pub flags: u16,
}

/// One processor local APIC entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuInfo {
    pub processor_id: u8,
    pub apic_id: u8,
    pub enabled: bool,
    pub online_capable: bool,
}

/// Everything this kernel consumes from the MADT.
#[derive(Debug, Clone, Default)]
pub struct MadtInfo {
    pub lapic_addr: u64,
    pub ioapics: Vec<IoApicInfo>,
    pub overrides: Vec<InterruptOverride>,
    pub cpus: Vec<CpuInfo>,
}

fn le16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn le32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn le64(b: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(raw)
}

/// Parse a full MADT (including the 36-byte SDT header).
///
/// Collects the local-APIC address (honoring a type-5 override), I/O
/// APICs, interrupt source overrides, and processor entries. Truncated
/// or undersized entries make the table invalid.
pub fn parse_madt(table: &[u8]) -> KernelResult<MadtInfo> {
    if table.len() < SDT_HEADER_LEN + 8 {
        return Err(KernelError::HeaderInvalid { what: "MADT" });
    }
    let declared_len = le32(table, 4) as usize;
    if declared_len > table.len() || declared_len < SDT_HEADER_LEN + 8 {
        return Err(KernelError::HeaderInvalid { what: "MADT" });
    }

    let mut info = MadtInfo {
        lapic_addr: le32(table, SDT_HEADER_LEN) as u64,
        ..Default::default()
    };

    let entries = &table[SDT_HEADER_LEN + 8..declared_len];
    let mut offset = 0;
    while offset + 2 <= entries.len() {
        let entry_type = entries[offset];
        let entry_len = entries[offset + 1] as usize;
        if entry_len < 2 || offset + entry_len > entries.len() {
            return Err(KernelError::HeaderInvalid { what: "MADT entry" });
        }
        let entry = &entries[offset..offset + entry_len];

        match entry_type {
            0 if entry_len >= 8 => {
                let flags = le32(entry, 4);
                info.cpus.push(CpuInfo {
                    processor_id: entry[2],
                    apic_id: entry[3],
                    enabled: flags & 0x1 != 0,
                    online_capable: flags & 0x2 != 0,
                });
            }
            1 if entry_len >= 12 => {
                info.ioapics.push(IoApicInfo {
                    id: entry[2],
                    addr: le32(entry, 4),
                    gsi_base: le32(entry, 8),
                });
            }
            2 if entry_len >= 10 => {
                info.overrides.push(InterruptOverride {
                    bus_src: entry[2],
                    irq_src: entry[3],
                    gsi: le32(entry, 4),
                    flags: le16(entry, 8),
                });
            }
            5 if entry_len >= 12 => {
                info.lapic_addr = le64(entry, 4);
            }
            _ => {}
        }
        offset += entry_len;
    }

    Ok(info)
}

/// RSDP fields this kernel uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rsdp {
    pub revision: u8,
    pub rsdt_addr: u32,
    pub xsdt_addr: u64,
}

impl Rsdp {
    pub fn use_xsdt(&self) -> bool {
        self.revision >= 2
    }
}

/// Parse RSDP bytes (the blob the loader hands over in its ACPI tag).
pub fn parse_rsdp(bytes: &[u8]) -> KernelResult<Rsdp> {
    if bytes.len() < 20 || &bytes[0..8] != b"RSD PTR " {
        return Err(KernelError::HeaderInvalid { what: "RSDP" });
    }
    let revision = bytes[15];
    let rsdt_addr = le32(bytes, 16);
    let xsdt_addr = if revision >= 2 && bytes.len() >= 36 {
        le64(bytes, 24)
    } else {
        0
    };
    Ok(Rsdp {
        revision,
        rsdt_addr,
        xsdt_addr,
    })
}

static MADT: Once<MadtInfo> = Once::new();

/// Parsed MADT. Panics if queried before [`init`].
pub fn madt() -> &'static MadtInfo {
    MADT.get().expect("ACPI queried before init")
}

/// View physical table memory through the direct map.
#[cfg(target_os = "none")]
unsafe fn table_slice(phys: u64) -> &'static [u8] {
    let base = crate::mm::phys_to_virt(phys) as *const u8;
    let len = core::ptr::read_unaligned(base.add(4) as *const u32) as usize;
    core::slice::from_raw_parts(base, len.max(SDT_HEADER_LEN))
}

/// Find a table by signature in the RSDT/XSDT.
#[cfg(target_os = "none")]
pub fn find_table(rsdp: &Rsdp, signature: &[u8; 4]) -> Option<&'static [u8]> {
    let (sdt_phys, entry_size) = if rsdp.use_xsdt() {
        (rsdp.xsdt_addr, 8)
    } else {
        (rsdp.rsdt_addr as u64, 4)
    };
    // SAFETY: the loader-reported SDT lives in reserved physical memory
    // covered by the HHDM.
    let sdt = unsafe { table_slice(sdt_phys) };
    if sdt.len() < SDT_HEADER_LEN {
        return None;
    }
    let entry_count = (sdt.len() - SDT_HEADER_LEN) / entry_size;
    for i in 0..entry_count {
        let off = SDT_HEADER_LEN + i * entry_size;
        let phys = if entry_size == 8 {
            le64(sdt, off)
        } else {
            le32(sdt, off) as u64
        };
        // SAFETY: see above.
        let table = unsafe { table_slice(phys) };
        if &table[0..4] == signature {
            return Some(table);
        }
    }
    None
}

/// Discover ACPI tables and parse the MADT. A missing RSDP or MADT is a
/// fatal configuration; both assertions halt the machine.
#[cfg(target_os = "none")]
pub fn init(boot: &super::multiboot::BootInfo) {
    let rsdp_bytes = boot.rsdp.expect("ACPI RSDP pointer is NULL");
    let rsdp = parse_rsdp(rsdp_bytes).expect("RSDP header invalid");
    log::info!(
        "[ACPI] using {} (rev {})",
        if rsdp.use_xsdt() { "XSDT" } else { "RSDT" },
        rsdp.revision
    );

    let madt_table = find_table(&rsdp, b"APIC").expect("ACPI MADT not found");
    let info = parse_madt(madt_table).expect("MADT malformed");
    log::info!(
        "[ACPI] MADT: lapic={:#x} ioapics={} overrides={} cpus={}",
        info.lapic_addr,
        info.ioapics.len(),
        info.overrides.len(),
        info.cpus.len()
    );

    if find_table(&rsdp, b"FACP").is_some() {
        log::info!("[ACPI] FADT present");
    } else {
        log::warn!("[ACPI] FADT not found");
    }

    MADT.call_once(|| info);
}
