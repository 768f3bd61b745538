//! Local APIC and I/O APIC
//!
//! The local APIC is driven either through its MMIO window (xAPIC) or
//! through MSRs (x2APIC); the mode is fixed at init from CPUID and the
//! two cases are the variants of [`Apic`]. I/O APIC redirection entries
//! are written through IOREGSEL/IOWIN, translating interrupt source
//! overrides from the MADT.

use spin::Once;

use super::acpi::MadtInfo;

/// IA32_APIC_BASE MSR.
const APIC_BASE_MSR: u32 = 0x1B;
/// Global APIC enable (bit 11).
const APIC_BASE_ENABLE: u64 = 1 << 11;
/// x2APIC mode enable (bit 10).
const APIC_BASE_X2APIC: u64 = 1 << 10;

/// CPUID leaf 1 ECX bit 21: x2APIC supported.
const CPUID_X2APIC: u32 = 1 << 21;

// Register offsets (xAPIC byte offsets).
pub const APIC_REG_ID: u32 = 0x20;
pub const APIC_REG_EOI: u32 = 0xB0;
pub const APIC_REG_SPURIOUS: u32 = 0xF0;
pub const APIC_REG_ICR_LO: u32 = 0x300;
pub const APIC_REG_ICR_HI: u32 = 0x310;
pub const APIC_REG_LVT_TIMER: u32 = 0x320;
pub const APIC_REG_INIT_COUNT: u32 = 0x380;
pub const APIC_REG_CURR_COUNT: u32 = 0x390;
pub const APIC_REG_DIV_CFG: u32 = 0x3E0;

/// Spurious-vector register software enable bit.
const SVR_ENABLE: u64 = 0x100;

/// LVT mask bit.
pub const LVT_MASKED: u32 = 1 << 16;

/// ICR destination shorthand: all excluding self.
pub const IPI_OTHERS: u32 = 0xC0000;

/// x2APIC register file: MSR = (xAPIC offset >> 4) + 0x800.
pub const fn x2apic_msr(reg: u32) -> u32 {
    (reg >> 4) + 0x800
}

/// The local APIC, dispatched on the access mode chosen at init.
pub enum Apic {
    /// MMIO register file at the (direct-mapped) LAPIC base.
    Xapic { base: u64 },
    /// MSR-based register file.
    X2apic,
}

impl Apic {
    pub fn read(&self, reg: u32) -> u64 {
        match self {
            Apic::Xapic { base } => {
                // SAFETY: the LAPIC window is direct-mapped; reads of
                // defined registers have no side effects we rely on.
                unsafe { core::ptr::read_volatile((base + reg as u64) as *const u32) as u64 }
            }
            Apic::X2apic => crate::arch::x86_64::read_msr(x2apic_msr(reg)),
        }
    }

    pub fn write(&self, reg: u32, value: u64) {
        match self {
            Apic::Xapic { base } => {
                // SAFETY: see read.
                unsafe {
                    core::ptr::write_volatile((base + reg as u64) as *mut u32, value as u32)
                }
            }
            Apic::X2apic => crate::arch::x86_64::write_msr(x2apic_msr(reg), value),
        }
    }

    /// Signal end-of-interrupt.
    pub fn eoi(&self) {
        self.write(APIC_REG_EOI, 0);
    }

    /// This CPU's APIC ID.
    pub fn id(&self) -> u32 {
        let id = self.read(APIC_REG_ID);
        match self {
            Apic::Xapic { .. } => (id >> 24) as u32,
            Apic::X2apic => id as u32,
        }
    }

    /// Send an IPI. `data` is the low ICR dword (delivery mode, level,
    /// vector); `shorthand` 0 targets `dest` alone.
    pub fn ipi(&self, dest: u32, data: u32, shorthand: u32) {
        match self {
            Apic::Xapic { .. } => {
                self.write(APIC_REG_ICR_HI, (dest as u64) << 24);
                self.write(APIC_REG_ICR_LO, (data | shorthand) as u64);
            }
            Apic::X2apic => {
                self.write(
                    APIC_REG_ICR_LO,
                    ((dest as u64) << 32) | (data | shorthand) as u64,
                );
            }
        }
    }
}

static APIC: Once<Apic> = Once::new();

/// The local APIC. Panics before [`init`].
pub fn apic() -> &'static Apic {
    APIC.get().expect("APIC used before init")
}

/// Enable the local APIC, switching to x2APIC when CPUID reports it.
#[cfg(target_os = "none")]
pub fn init(madt: &MadtInfo) {
    use crate::arch::x86_64::{cpuid_features_ecx, read_msr, write_msr};

    let mut base_flags = read_msr(APIC_BASE_MSR) | APIC_BASE_ENABLE;
    let x2apic = cpuid_features_ecx() & CPUID_X2APIC != 0;
    if x2apic {
        base_flags |= APIC_BASE_X2APIC;
        log::info!("[APIC] using x2APIC");
    }
    write_msr(APIC_BASE_MSR, base_flags);

    let apic = if x2apic {
        Apic::X2apic
    } else {
        Apic::Xapic {
            base: crate::mm::hhdm_base() + madt.lapic_addr,
        }
    };

    let svr = apic.read(APIC_REG_SPURIOUS) | SVR_ENABLE;
    apic.write(APIC_REG_SPURIOUS, svr);
    APIC.call_once(|| apic);
    log::info!("[APIC] enabled (id={})", self::apic().id());
}

/// Calibrate the LAPIC timer against a 1 ms PIT wait and record the
/// ticks-per-millisecond in this CPU's descriptor. BSP-only during
/// bring-up.
#[cfg(target_os = "none")]
pub fn timer_calibrate() {
    let apic = apic();
    apic.write(APIC_REG_DIV_CFG, 0x3);
    apic.write(APIC_REG_INIT_COUNT, 0xFFFF_FFFF);
    crate::arch::x86_64::timer::wait_ms(1);
    apic.write(APIC_REG_LVT_TIMER, LVT_MASKED as u64);
    let ticks = 0xFFFF_FFFFu64 - apic.read(APIC_REG_CURR_COUNT);
    super::smp::set_timer_ticks(apic.id(), ticks as u32);
    log::info!("[APIC] timer: {} ticks/ms", ticks);
}

// ---------------------------------------------------------------------------
// I/O APIC
// ---------------------------------------------------------------------------

/// IOREGSEL / IOWIN byte offsets.
const IOREGSEL: u64 = 0x00;
const IOWIN: u64 = 0x10;

/// Redirection-table register index for a GSI (two 32-bit registers per
/// entry).
pub const fn redirection_register(gsi: u32) -> u8 {
    (0x10 + 2 * gsi) as u8
}

/// Build the 64-bit redirection entry: vector, flags, destination APIC
/// ID in bits 63:56.
pub const fn redirection_entry(apic_id: u32, vector: u8, flags: u32) -> u64 {
    (vector as u64) | (flags as u64) | ((apic_id as u64) << 56)
}

/// Translate MADT ISO flags into redirection-entry bits: polarity
/// (bit 1 -> active low, bit 13) and trigger mode (bit 3 -> level,
/// bit 15), plus the mask bit.
pub const fn iso_redirection_flags(iso_flags: u16, mask: bool) -> u32 {
    let mut flags = 0;
    if iso_flags & (1 << 1) != 0 {
        flags |= 1 << 13;
    }
    if iso_flags & (1 << 3) != 0 {
        flags |= 1 << 15;
    }
    if mask {
        flags |= 1 << 16;
    }
    flags
}

#[cfg(target_os = "none")]
fn ioapic_write(base_phys: u32, reg: u8, value: u32) {
    let base = crate::mm::phys_to_virt(base_phys as u64);
    // SAFETY: the I/O APIC window is direct-mapped; IOREGSEL selects the
    // register, IOWIN carries the data.
    unsafe {
        core::ptr::write_volatile(base.add(IOREGSEL as usize) as *mut u32, reg as u32);
        core::ptr::write_volatile(base.add(IOWIN as usize) as *mut u32, value);
    }
}

/// Pick the I/O APIC whose GSI range covers `gsi`.
fn ioapic_for_gsi(madt: &MadtInfo, gsi: u32) -> Option<super::acpi::IoApicInfo> {
    let mut chosen = None;
    for ioapic in &madt.ioapics {
        if ioapic.gsi_base <= gsi {
            match chosen {
                Some(super::acpi::IoApicInfo { gsi_base, .. }) if gsi_base >= ioapic.gsi_base => {}
                _ => chosen = Some(*ioapic),
            }
        }
    }
    chosen.or_else(|| madt.ioapics.first().copied())
}

/// Program a redirection entry for `gsi`.
#[cfg(target_os = "none")]
pub fn map_gsi(apic_id: u32, gsi: u32, vector: u8, flags: u32) {
    let madt = super::acpi::madt();
    let Some(ioapic) = ioapic_for_gsi(madt, gsi) else {
        log::warn!("[IOAPIC] no I/O APIC for GSI {}", gsi);
        return;
    };
    let entry = redirection_entry(apic_id, vector, flags);
    let reg = redirection_register(gsi - ioapic.gsi_base);
    ioapic_write(ioapic.addr, reg, entry as u32);
    ioapic_write(ioapic.addr, reg + 1, (entry >> 32) as u32);
}

/// Redirect a legacy IRQ: apply the matching interrupt source override
/// (GSI and polarity/trigger flags) or fall back to GSI = IRQ.
#[cfg(target_os = "none")]
pub fn map_irq(apic_id: u32, irq: u8, vector: u8, mask: bool) {
    let madt = super::acpi::madt();
    let iso = madt.overrides.iter().find(|o| o.irq_src == irq);
    match iso {
        Some(iso) => {
            let flags = iso_redirection_flags(iso.flags, mask);
            map_gsi(apic_id, iso.gsi, vector, flags);
        }
        None => {
            let flags = if mask { LVT_MASKED } else { 0 };
            map_gsi(apic_id, irq as u32, vector, flags);
        }
    }
}
