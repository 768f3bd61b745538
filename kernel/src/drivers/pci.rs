//! PCI bus driver
//!
//! Enumerates the bus hierarchy through legacy configuration mechanism #1
//! (ports 0xCF8/0xCFC), sizes BARs with the standard all-ones dance,
//! recurses into PCI-to-PCI bridges, and dispatches drivers from a
//! two-tier registry: device-specific (vendor/device) probes override
//! class-based ones.
//!
//! Configuration access is a capability ([`ConfigAccess`]) so enumeration
//! runs against a mock device tree off-target.

use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::mm::{self, FrameSource, PageFlags, PAGE_SIZE};

/// Capacity of the device descriptor table.
pub const PCI_MAX_DEVICES: usize = 256;

/// Wildcard device ID for device-specific driver registration.
pub const PCI_DEVICE_ANY: u16 = 0xFFFF;

/// Driver registry capacity (each tier).
const MAX_PCI_DRIVERS: usize = 32;

/// PCI-to-PCI bridge class/subclass.
const CLASS_BRIDGE: u8 = 0x06;
const SUBCLASS_PCI_BRIDGE: u8 = 0x04;

/// Command-register bits drivers commonly enable.
pub mod command {
    pub const IO_SPACE: u16 = 1 << 0;
    pub const MEMORY_SPACE: u16 = 1 << 1;
    pub const BUS_MASTER: u16 = 1 << 2;
}

/// One enumerated PCI function. Populated during the scan; only
/// `bar_virt` is written afterwards (by BAR mapping), read-only from
/// then on.
#[derive(Debug, Clone)]
pub struct PciDevice {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class_code: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub header_type: u8,
    /// Physical BAR bases (flag bits stripped).
    pub bar: [u64; 6],
    /// BAR sizes; the high half of a 64-bit pair reports 0.
    pub bar_size: [u64; 6],
    pub bar_is_io: [bool; 6],
    /// Virtual base per BAR once mapped, 0 if unmapped.
    pub bar_virt: [u64; 6],
}

/// Configuration-space access for one mechanism (ports on hardware, a
/// simulated tree in tests). Offsets are register byte offsets; dword
/// accesses are naturally aligned.
pub trait ConfigAccess {
    fn read32(&mut self, bus: u8, device: u8, function: u8, offset: u8) -> u32;
    fn write32(&mut self, bus: u8, device: u8, function: u8, offset: u8, value: u32);

    fn read16(&mut self, bus: u8, device: u8, function: u8, offset: u8) -> u16 {
        let dword = self.read32(bus, device, function, offset & !3);
        ((dword >> ((offset & 2) * 8)) & 0xFFFF) as u16
    }

    fn read8(&mut self, bus: u8, device: u8, function: u8, offset: u8) -> u8 {
        let dword = self.read32(bus, device, function, offset & !3);
        ((dword >> ((offset & 3) * 8)) & 0xFF) as u8
    }

    fn write16(&mut self, bus: u8, device: u8, function: u8, offset: u8, value: u16) {
        let aligned = offset & !3;
        let shift = ((offset & 2) * 8) as u32;
        let orig = self.read32(bus, device, function, aligned);
        let merged = (orig & !(0xFFFFu32 << shift)) | ((value as u32) << shift);
        self.write32(bus, device, function, aligned, merged);
    }

    fn write8(&mut self, bus: u8, device: u8, function: u8, offset: u8, value: u8) {
        let aligned = offset & !3;
        let shift = ((offset & 3) * 8) as u32;
        let orig = self.read32(bus, device, function, aligned);
        let merged = (orig & !(0xFFu32 << shift)) | ((value as u32) << shift);
        self.write32(bus, device, function, aligned, merged);
    }
}

/// Legacy configuration mechanism #1.
#[cfg(target_os = "none")]
pub struct PortConfig;

#[cfg(target_os = "none")]
impl PortConfig {
    fn address(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
        (1u32 << 31)
            | ((bus as u32) << 16)
            | ((device as u32) << 11)
            | ((function as u32) << 8)
            | (offset as u32 & 0xFC)
    }
}

#[cfg(target_os = "none")]
impl ConfigAccess for PortConfig {
    fn read32(&mut self, bus: u8, device: u8, function: u8, offset: u8) -> u32 {
        // SAFETY: mechanism #1 address/data ports; serialized by the
        // PCI_BUS lock around every enumeration path.
        unsafe {
            crate::arch::outl(0xCF8, Self::address(bus, device, function, offset));
            crate::arch::inl(0xCFC)
        }
    }

    fn write32(&mut self, bus: u8, device: u8, function: u8, offset: u8, value: u32) {
        // SAFETY: see read32.
        unsafe {
            crate::arch::outl(0xCF8, Self::address(bus, device, function, offset));
            crate::arch::outl(0xCFC, value);
        }
    }
}

/// Result of sizing one BAR slot.
struct BarProbe {
    addr: u64,
    size: u64,
    is_io: bool,
    is_64bit: bool,
}

/// Standard sizing dance: save, write all-ones, read mask, restore.
/// 64-bit memory BARs consume the adjacent high slot.
fn probe_bar(cfg: &mut dyn ConfigAccess, bus: u8, dev: u8, func: u8, index: usize) -> BarProbe {
    let offset = 0x10 + (index as u8) * 4;
    let orig = cfg.read32(bus, dev, func, offset);
    if orig == 0 {
        return BarProbe {
            addr: 0,
            size: 0,
            is_io: false,
            is_64bit: false,
        };
    }

    if orig & 1 != 0 {
        // I/O BAR
        cfg.write32(bus, dev, func, offset, 0xFFFF_FFFF);
        let mask = cfg.read32(bus, dev, func, offset) & 0xFFFF_FFFC;
        cfg.write32(bus, dev, func, offset, orig);
        BarProbe {
            addr: (orig & 0xFFFF_FFFC) as u64,
            size: (!(mask as u64) + 1) & 0xFFFF_FFFF,
            is_io: true,
            is_64bit: false,
        }
    } else if (orig >> 1) & 0x3 == 0x2 {
        // 64-bit memory BAR: size across both halves, restore both.
        let orig_hi = cfg.read32(bus, dev, func, offset + 4);
        cfg.write32(bus, dev, func, offset, 0xFFFF_FFFF);
        cfg.write32(bus, dev, func, offset + 4, 0xFFFF_FFFF);
        let mask_lo = cfg.read32(bus, dev, func, offset) & 0xFFFF_FFF0;
        let mask_hi = cfg.read32(bus, dev, func, offset + 4);
        cfg.write32(bus, dev, func, offset, orig);
        cfg.write32(bus, dev, func, offset + 4, orig_hi);

        let mask = ((mask_hi as u64) << 32) | mask_lo as u64;
        BarProbe {
            addr: ((orig_hi as u64) << 32) | (orig & 0xFFFF_FFF0) as u64,
            size: !mask + 1,
            is_io: false,
            is_64bit: true,
        }
    } else {
        cfg.write32(bus, dev, func, offset, 0xFFFF_FFFF);
        let mask = cfg.read32(bus, dev, func, offset) & 0xFFFF_FFF0;
        cfg.write32(bus, dev, func, offset, orig);
        BarProbe {
            addr: (orig & 0xFFFF_FFF0) as u64,
            size: (!(mask as u64) + 1) & 0xFFFF_FFFF,
            is_io: false,
            is_64bit: false,
        }
    }
}

/// The enumerated bus: descriptor table plus the scanned-bus set that
/// guards bridge recursion against loops.
pub struct PciBus {
    devices: Vec<PciDevice>,
    scanned: [bool; 256],
}

impl PciBus {
    pub const fn new() -> Self {
        Self {
            devices: Vec::new(),
            scanned: [false; 256],
        }
    }

    /// Enumerate everything reachable from bus 0.
    pub fn scan(&mut self, cfg: &mut dyn ConfigAccess) {
        self.devices.clear();
        self.scanned = [false; 256];
        self.scan_bus(cfg, 0);
    }

    fn scan_bus(&mut self, cfg: &mut dyn ConfigAccess, bus: u8) {
        if self.scanned[bus as usize] {
            return;
        }
        self.scanned[bus as usize] = true;

        for dev in 0..32u8 {
            let vendor = cfg.read16(bus, dev, 0, 0x00);
            if vendor == 0xFFFF {
                continue;
            }
            let header_type = cfg.read8(bus, dev, 0, 0x0E);
            let max_func = if header_type & 0x80 != 0 { 8 } else { 1 };

            for func in 0..max_func {
                let vendor = cfg.read16(bus, dev, func, 0x00);
                if vendor == 0xFFFF {
                    continue;
                }
                let device_id = cfg.read16(bus, dev, func, 0x02);
                let class_dword = cfg.read32(bus, dev, func, 0x08);
                let class_code = (class_dword >> 24) as u8;
                let subclass = (class_dword >> 16) as u8;
                let prog_if = (class_dword >> 8) as u8;

                let mut descriptor = PciDevice {
                    bus,
                    device: dev,
                    function: func,
                    vendor_id: vendor,
                    device_id,
                    class_code,
                    subclass,
                    prog_if,
                    header_type: cfg.read8(bus, dev, func, 0x0E),
                    bar: [0; 6],
                    bar_size: [0; 6],
                    bar_is_io: [false; 6],
                    bar_virt: [0; 6],
                };

                let mut b = 0;
                while b < 6 {
                    let probe = probe_bar(cfg, bus, dev, func, b);
                    descriptor.bar[b] = probe.addr;
                    descriptor.bar_size[b] = probe.size;
                    descriptor.bar_is_io[b] = probe.is_io;
                    // The high half of a 64-bit pair stays zeroed.
                    b += if probe.is_64bit { 2 } else { 1 };
                }

                self.devices.push(descriptor);
                if self.devices.len() >= PCI_MAX_DEVICES {
                    return;
                }

                if class_code == CLASS_BRIDGE && subclass == SUBCLASS_PCI_BRIDGE {
                    let secondary = cfg.read8(bus, dev, func, 0x19);
                    if secondary != 0 && secondary != bus && !self.scanned[secondary as usize] {
                        self.scan_bus(cfg, secondary);
                        if self.devices.len() >= PCI_MAX_DEVICES {
                            return;
                        }
                    }
                }
            }
        }
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device(&self, index: usize) -> Option<&PciDevice> {
        self.devices.get(index)
    }

    pub fn device_mut(&mut self, index: usize) -> Option<&mut PciDevice> {
        self.devices.get_mut(index)
    }

    pub fn devices(&self) -> &[PciDevice] {
        &self.devices
    }
}

/// Probe callback; `Ok(())` claims the device for device-specific
/// drivers, informational for class drivers.
pub type ProbeFn = fn(&PciDevice) -> KernelResult<()>;

struct ClassDriver {
    class: u8,
    /// 0xFF matches any subclass.
    subclass: u8,
    probe: ProbeFn,
}

struct DeviceDriver {
    vendor: u16,
    /// [`PCI_DEVICE_ANY`] matches any device ID of the vendor.
    device: u16,
    probe: ProbeFn,
}

/// Two-tier driver registry.
pub struct DriverRegistry {
    class_drivers: Vec<ClassDriver>,
    device_drivers: Vec<DeviceDriver>,
}

impl DriverRegistry {
    pub const fn new() -> Self {
        Self {
            class_drivers: Vec::new(),
            device_drivers: Vec::new(),
        }
    }

    pub fn register_class_driver(
        &mut self,
        class: u8,
        subclass: u8,
        probe: ProbeFn,
    ) -> KernelResult<()> {
        if self.class_drivers.len() >= MAX_PCI_DRIVERS {
            return Err(KernelError::ResourceExhausted {
                resource: "PCI class driver",
            });
        }
        self.class_drivers.push(ClassDriver {
            class,
            subclass,
            probe,
        });
        Ok(())
    }

    pub fn register_device_driver(
        &mut self,
        vendor: u16,
        device: u16,
        probe: ProbeFn,
    ) -> KernelResult<()> {
        if self.device_drivers.len() >= MAX_PCI_DRIVERS {
            return Err(KernelError::ResourceExhausted {
                resource: "PCI device driver",
            });
        }
        self.device_drivers.push(DeviceDriver {
            vendor,
            device,
            probe,
        });
        Ok(())
    }

    /// Visit every device. Device-specific drivers run first; the first
    /// success marks the device handled and skips class drivers. Class
    /// probes run in registration order, results informational.
    pub fn probe_all(&self, devices: &[PciDevice]) {
        for dev in devices {
            let mut handled = false;
            for drv in &self.device_drivers {
                if drv.vendor == dev.vendor_id
                    && (drv.device == PCI_DEVICE_ANY || drv.device == dev.device_id)
                {
                    let result = (drv.probe)(dev);
                    log::debug!(
                        "[PCI] device probe {:?} for {:04x}:{:04x} at {:02x}:{:02x}.{}",
                        result.is_ok(),
                        dev.vendor_id,
                        dev.device_id,
                        dev.bus,
                        dev.device,
                        dev.function
                    );
                    if result.is_ok() {
                        handled = true;
                        break;
                    }
                }
            }
            if handled {
                continue;
            }

            for drv in &self.class_drivers {
                if drv.class == dev.class_code
                    && (drv.subclass == 0xFF || drv.subclass == dev.subclass)
                {
                    let result = (drv.probe)(dev);
                    log::debug!(
                        "[PCI] class probe {:?} for {:02x}:{:02x}.{}",
                        result.is_ok(),
                        dev.bus,
                        dev.device,
                        dev.function
                    );
                }
            }
        }
    }
}

/// Map every memory BAR of `dev`: prefer the direct map for BARs under
/// 4 GiB whose translation verifies, otherwise install 4 KiB mappings
/// from the MMIO bump region.
pub fn map_device_bars_with(
    dev: &mut PciDevice,
    space: &mut crate::mm::vmm::AddressSpace,
    frames: &mut dyn FrameSource,
    mmio_next: &mut u64,
    hhdm_base: u64,
) {
    for b in 0..6 {
        dev.bar_virt[b] = 0;
        if dev.bar_size[b] == 0 || dev.bar_is_io[b] {
            continue;
        }
        let phys = dev.bar[b];
        let size = dev.bar_size[b];

        if phys < 0x1_0000_0000 {
            let candidate = hhdm_base + phys;
            if space.translate(candidate).is_some() {
                dev.bar_virt[b] = candidate;
            }
        }

        if dev.bar_virt[b] == 0 {
            dev.bar_virt[b] = map_mmio(space, frames, mmio_next, phys, size);
            if dev.bar_virt[b] != 0 {
                log::info!(
                    "[PCI] mapped BAR{} phys={:#x} -> virt={:#x} size={:#x}",
                    b,
                    phys,
                    dev.bar_virt[b],
                    size
                );
            }
        }
    }
}

/// Install page mappings for an MMIO window from the bump region.
/// Returns the virtual address of `phys`, or 0 on mapping failure.
fn map_mmio(
    space: &mut crate::mm::vmm::AddressSpace,
    frames: &mut dyn FrameSource,
    mmio_next: &mut u64,
    phys: u64,
    size: u64,
) -> u64 {
    if size == 0 {
        return 0;
    }
    let page = PAGE_SIZE as u64;
    let phys_base = mm::align_down(phys, page);
    let offset = phys - phys_base;
    let map_size = mm::align_up(size + offset, page);

    let virt_base = mm::align_up(*mmio_next, page);
    *mmio_next = virt_base + map_size;

    let mut mapped = 0;
    while mapped < map_size {
        if space
            .map_page(
                virt_base + mapped,
                phys_base + mapped,
                PageFlags::WRITABLE | PageFlags::NO_CACHE,
                frames,
            )
            .is_err()
        {
            log::error!(
                "[PCI] MMIO map failed virt={:#x} phys={:#x}",
                virt_base + mapped,
                phys_base + mapped
            );
            return 0;
        }
        mapped += page;
    }

    virt_base + offset
}

// ---------------------------------------------------------------------------
// Globals
// ---------------------------------------------------------------------------

static PCI_BUS: Mutex<PciBus> = Mutex::new(PciBus::new());
static DRIVERS: Mutex<DriverRegistry> = Mutex::new(DriverRegistry::new());

/// Next virtual address for explicitly mapped MMIO windows; starts a safe
/// distance above the kernel image.
static MMIO_NEXT: Mutex<u64> = Mutex::new(0);

/// Enumerate the bus hierarchy (boot glue only).
#[cfg(target_os = "none")]
pub fn init() {
    extern "C" {
        static _kernel_end: u8;
    }
    // SAFETY: linker-provided end-of-image symbol.
    let kernel_end = unsafe { &_kernel_end as *const u8 as u64 };
    *MMIO_NEXT.lock() = mm::align_up(kernel_end, PAGE_SIZE as u64) + 0x20_0000;

    let mut bus = PCI_BUS.lock();
    bus.scan(&mut PortConfig);
    log::info!("[PCI] enumeration found {} functions", bus.device_count());
}

/// Number of enumerated devices.
pub fn device_count() -> usize {
    PCI_BUS.lock().device_count()
}

/// Copy of the descriptor at `index`.
pub fn device(index: usize) -> Option<PciDevice> {
    PCI_BUS.lock().device(index).cloned()
}

/// Register a class-based driver.
pub fn register_class_driver(class: u8, subclass: u8, probe: ProbeFn) -> KernelResult<()> {
    DRIVERS.lock().register_class_driver(class, subclass, probe)
}

/// Register a device-specific driver (takes precedence over classes).
pub fn register_device_driver(vendor: u16, device: u16, probe: ProbeFn) -> KernelResult<()> {
    DRIVERS.lock().register_device_driver(vendor, device, probe)
}

/// Run all registered probes over the enumerated devices.
pub fn probe_all() {
    // Snapshot so probes can re-enter the PCI API.
    let devices: Vec<PciDevice> = PCI_BUS.lock().devices().to_vec();
    DRIVERS.lock().probe_all(&devices);
}

/// Map the BARs of every enumerated device (boot glue only).
#[cfg(target_os = "none")]
pub fn map_all_bars() {
    let mut bus = PCI_BUS.lock();
    let mut mmio_next = MMIO_NEXT.lock();
    let mut space = crate::mm::vmm::kernel_space_lock();
    let mut frames = crate::mm::pmm::FRAME_ALLOCATOR.lock();
    let hhdm = mm::hhdm_base();
    for i in 0..bus.device_count() {
        if let Some(dev) = bus.device_mut(i) {
            map_device_bars_with(dev, &mut space, &mut *frames, &mut mmio_next, hhdm);
        }
    }
}

/// Enable I/O, memory decoding, and bus mastering for a device.
#[cfg(target_os = "none")]
pub fn enable_device(dev: &PciDevice) {
    let mut cfg = PortConfig;
    let cmd = cfg.read16(dev.bus, dev.device, dev.function, 0x04);
    cfg.write16(
        dev.bus,
        dev.device,
        dev.function,
        0x04,
        cmd | command::IO_SPACE | command::MEMORY_SPACE | command::BUS_MASTER,
    );
}

fn class_name(class: u8, subclass: u8, prog_if: u8) -> &'static str {
    match class {
        0x00 => "Unclassified",
        0x01 => match subclass {
            0x01 => "IDE controller",
            0x06 if prog_if == 0x01 => "AHCI (SATA)",
            0x06 => "Mass storage controller",
            0x08 => "NVM Express",
            _ => "Mass storage controller",
        },
        0x02 => "Network controller",
        0x03 => match subclass {
            0x00 => "VGA-compatible controller",
            _ => "Display controller",
        },
        0x04 => "Multimedia controller",
        0x06 => "Bridge device",
        0x0C => match subclass {
            0x03 => "USB controller",
            _ => "Serial bus controller",
        },
        _ => "Unknown",
    }
}

/// Dump the descriptor table to the console.
pub fn print_devices() {
    let bus = PCI_BUS.lock();
    crate::println!("PCI devices: {}", bus.device_count());
    for (i, d) in bus.devices().iter().enumerate() {
        crate::println!(
            "[{:02}] {:02x}:{:02x}.{} {} vendor={:#06x} device={:#06x}",
            i,
            d.bus,
            d.device,
            d.function,
            class_name(d.class_code, d.subclass, d.prog_if),
            d.vendor_id,
            d.device_id
        );
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Simulated config space: a handful of functions with sizing
    /// semantics on their BAR registers.
    #[derive(Default)]
    struct MockConfig {
        funcs: HashMap<(u8, u8, u8), MockFunction>,
    }

    struct MockFunction {
        vendor: u16,
        device: u16,
        class: u8,
        subclass: u8,
        prog_if: u8,
        header_type: u8,
        secondary_bus: u8,
        /// (original BAR register value, size) per slot; size 0 = unused.
        bars: [(u32, u64); 6],
        /// Live register file for the BAR slots.
        bar_regs: [u32; 6],
    }

    impl MockFunction {
        fn new(vendor: u16, device: u16, class: u8, subclass: u8) -> Self {
            Self {
                vendor,
                device,
                class,
                subclass,
                prog_if: 0,
                header_type: 0,
                secondary_bus: 0,
                bars: [(0, 0); 6],
                bar_regs: [0; 6],
            }
        }

        fn with_mem_bar64(mut self, slot: usize, base: u64, size: u64) -> Self {
            let low = (base as u32 & 0xFFFF_FFF0) | 0x4; // type=10 (64-bit)
            let high = (base >> 32) as u32;
            self.bars[slot] = (low, size);
            self.bars[slot + 1] = (high, u64::MAX); // marker: high half
            self.bar_regs[slot] = low;
            self.bar_regs[slot + 1] = high;
            self
        }

        fn with_io_bar(mut self, slot: usize, base: u32, size: u64) -> Self {
            let reg = (base & 0xFFFF_FFFC) | 1;
            self.bars[slot] = (reg, size);
            self.bar_regs[slot] = reg;
            self
        }
    }

    impl ConfigAccess for MockConfig {
        fn read32(&mut self, bus: u8, device: u8, function: u8, offset: u8) -> u32 {
            let Some(f) = self.funcs.get(&(bus, device, function)) else {
                return 0xFFFF_FFFF;
            };
            match offset {
                0x00 => (f.device as u32) << 16 | f.vendor as u32,
                0x08 => {
                    (f.class as u32) << 24 | (f.subclass as u32) << 16 | (f.prog_if as u32) << 8
                }
                0x0C => (f.header_type as u32) << 16,
                0x18 => (f.secondary_bus as u32) << 8,
                0x10..=0x24 => f.bar_regs[(offset as usize - 0x10) / 4],
                _ => 0,
            }
        }

        fn write32(&mut self, bus: u8, device: u8, function: u8, offset: u8, value: u32) {
            let Some(f) = self.funcs.get_mut(&(bus, device, function)) else {
                return;
            };
            if !(0x10..=0x24).contains(&offset) {
                return;
            }
            let slot = (offset as usize - 0x10) / 4;
            let (orig, size) = f.bars[slot];
            if size == 0 {
                return;
            }
            if value == 0xFFFF_FFFF {
                // Sizing write: expose the mask, keeping the flag bits.
                f.bar_regs[slot] = if size == u64::MAX {
                    // High half of the 64-bit pair below this slot.
                    let (_, pair_size) = f.bars[slot - 1];
                    (!(pair_size - 1) >> 32) as u32
                } else if orig & 1 != 0 {
                    (!(size - 1) as u32 & 0xFFFF_FFFC) | (orig & 0x3)
                } else {
                    (!(size - 1) as u32 & 0xFFFF_FFF0) | (orig & 0xF)
                };
            } else {
                f.bar_regs[slot] = value;
            }
        }
    }

    fn sample_tree() -> MockConfig {
        let mut cfg = MockConfig::default();
        // An AHCI controller with a 64-bit BAR4/5 pair and an I/O BAR0.
        cfg.funcs.insert(
            (0, 1, 0),
            MockFunction::new(0x8086, 0x2922, 0x01, 0x06)
                .with_io_bar(0, 0xC000, 0x20)
                .with_mem_bar64(4, 0x3_8000_0000, 0x4000_0000),
        );
        // A bridge to bus 1.
        let mut bridge = MockFunction::new(0x8086, 0x244E, 0x06, 0x04);
        bridge.secondary_bus = 1;
        cfg.funcs.insert((0, 2, 0), bridge);
        // A network device behind the bridge.
        cfg.funcs
            .insert((1, 0, 0), MockFunction::new(0x10EC, 0x8139, 0x02, 0x00));
        // An NVMe-style function with a small 64-bit BAR above 4 GiB.
        cfg.funcs.insert(
            (0, 3, 0),
            MockFunction::new(0x1B36, 0x0010, 0x01, 0x08)
                .with_mem_bar64(0, 0x3_9000_0000, 0x4000),
        );
        cfg
    }

    #[test]
    fn scan_finds_devices_behind_bridges() {
        let mut cfg = sample_tree();
        let mut bus = PciBus::new();
        bus.scan(&mut cfg);
        assert_eq!(bus.device_count(), 4);
        let net = bus
            .devices()
            .iter()
            .find(|d| d.vendor_id == 0x10EC)
            .expect("device behind bridge enumerated");
        assert_eq!(net.bus, 1);
    }

    #[test]
    fn sizes_64bit_bar_pair_as_one_descriptor() {
        let mut cfg = sample_tree();
        let mut bus = PciBus::new();
        bus.scan(&mut cfg);
        let ahci = bus
            .devices()
            .iter()
            .find(|d| d.device_id == 0x2922)
            .unwrap();
        assert_eq!(ahci.bar[4], 0x3_8000_0000);
        assert_eq!(ahci.bar_size[4], 0x4000_0000);
        assert!(!ahci.bar_is_io[4]);
        assert_eq!(ahci.bar_size[5], 0);
        assert_eq!(ahci.bar_virt[4], 0);
    }

    #[test]
    fn sizing_probe_restores_original_values() {
        let mut cfg = sample_tree();
        let mut bus = PciBus::new();
        bus.scan(&mut cfg);
        let f = &cfg.funcs[&(0, 1, 0)];
        assert_eq!(f.bar_regs[0], (0xC000 & 0xFFFF_FFFC) | 1);
        assert_eq!(f.bar_regs[4], 0x8000_0000 | 0x4);
        assert_eq!(f.bar_regs[5], 0x3);
    }

    #[test]
    fn io_bar_classified_and_sized() {
        let mut cfg = sample_tree();
        let mut bus = PciBus::new();
        bus.scan(&mut cfg);
        let ahci = bus
            .devices()
            .iter()
            .find(|d| d.device_id == 0x2922)
            .unwrap();
        assert!(ahci.bar_is_io[0]);
        assert_eq!(ahci.bar[0], 0xC000);
        assert_eq!(ahci.bar_size[0], 0x20);
    }

    #[test]
    fn mapped_bar_translates_to_its_physical_base() {
        let mut cfg = sample_tree();
        let mut bus = PciBus::new();
        bus.scan(&mut cfg);
        let nvme_idx = bus
            .devices()
            .iter()
            .position(|d| d.device_id == 0x0010)
            .unwrap();
        let ahci_idx = bus
            .devices()
            .iter()
            .position(|d| d.device_id == 0x2922)
            .unwrap();

        // Enough arena for the ~515 table frames behind a 1 GiB window.
        let (mut space, mut frames) = crate::mm::vmm::test_support::fake_space(700);
        let hhdm = space.hhdm_for_tests();
        let mut mmio_next = 0xFFFF_C000_0000_0000u64;
        let dev = bus.device_mut(nvme_idx).unwrap();
        map_device_bars_with(dev, &mut space, &mut frames, &mut mmio_next, hhdm);

        // The BAR is above 4 GiB, so it cannot use the direct map; its
        // pages must be explicitly mapped and translate back to the BAR
        // physical base.
        assert_ne!(dev.bar_virt[0], 0);
        assert_eq!(space.translate(dev.bar_virt[0]), Some(0x3_9000_0000));

        // Same for the AHCI function's 1 GiB 64-bit BAR4, while its I/O
        // BAR0 is never mapped.
        let ahci = bus.device_mut(ahci_idx).unwrap();
        map_device_bars_with(ahci, &mut space, &mut frames, &mut mmio_next, hhdm);
        assert_ne!(ahci.bar_virt[4], 0);
        assert_eq!(space.translate(ahci.bar_virt[4]), Some(0x3_8000_0000));
        assert_eq!(
            space.translate(ahci.bar_virt[4] + 0x3FFF_F000),
            Some(0x3_8000_0000 + 0x3FFF_F000)
        );
        assert_eq!(ahci.bar_virt[0], 0);
    }

    static DEVICE_PROBES: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);
    static CLASS_PROBES: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);

    fn claiming_device_probe(_dev: &PciDevice) -> KernelResult<()> {
        DEVICE_PROBES.fetch_add(1, core::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn class_probe(_dev: &PciDevice) -> KernelResult<()> {
        CLASS_PROBES.fetch_add(1, core::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    #[test]
    fn device_driver_success_skips_class_drivers() {
        use core::sync::atomic::Ordering;
        let mut cfg = sample_tree();
        let mut bus = PciBus::new();
        bus.scan(&mut cfg);

        let mut registry = DriverRegistry::new();
        registry
            .register_device_driver(0x8086, PCI_DEVICE_ANY, claiming_device_probe)
            .unwrap();
        registry.register_class_driver(0x01, 0x06, class_probe).unwrap();
        registry.register_class_driver(0x02, 0xFF, class_probe).unwrap();

        DEVICE_PROBES.store(0, Ordering::SeqCst);
        CLASS_PROBES.store(0, Ordering::SeqCst);
        registry.probe_all(bus.devices());

        // Both 8086 functions are claimed by the vendor wildcard; only
        // the network device reaches its class driver.
        assert_eq!(DEVICE_PROBES.load(Ordering::SeqCst), 2);
        assert_eq!(CLASS_PROBES.load(Ordering::SeqCst), 1);
    }
}
