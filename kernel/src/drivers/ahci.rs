//! AHCI port/command engine
//!
//! Drives AHCI 1.3 HBAs found by PCI probing. Each active port gets four
//! persistent physical frames -- the 32-entry command list, the FIS
//! receive area, one command table, and a 4 KiB data bounce buffer --
//! allocated on first identify and never freed. Commands are issued by
//! building the header/table/PRDT in those frames and OR-ing the slot bit
//! into PxCI behind a release fence; completion is a bounded poll on the
//! CI bit with one COMRESET retry after a task-file error.
//!
//! Reads are serialized per port through the single bounce buffer, which
//! caps transfers at 8 sectors. `find_cmdslot` still scans all 32 slots
//! (SACT|CI); exploiting higher-slot concurrency would need per-slot
//! buffers first.
//!
//! Register access goes through the [`HbaMmio`] capability, so the whole
//! command protocol also runs against a mock HBA off-target.

use alloc::string::String;

use core::sync::atomic::{fence, Ordering};

#[cfg(target_os = "none")]
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::mm::FrameSource;

/// Sector size used throughout the SATA path.
pub const SECTOR_SIZE: usize = 512;

/// Largest read per command: the shared bounce buffer is one 4 KiB frame.
pub const MAX_READ_SECTORS: u16 = 8;

#[cfg(target_os = "none")]
const MAX_CONTROLLERS: usize = 4;
const PORTS_PER_HBA: usize = 32;

// HBA global registers.
#[cfg(target_os = "none")]
const HBA_PI: usize = 0x0C;

// Per-port register block: 0x80 bytes each from 0x100.
const PORT_BASE: usize = 0x100;
const PORT_SIZE: usize = 0x80;

const PX_CLB: usize = 0x00;
const PX_CLBU: usize = 0x04;
const PX_FB: usize = 0x08;
const PX_FBU: usize = 0x0C;
const PX_IS: usize = 0x10;
const PX_CMD: usize = 0x18;
const PX_TFD: usize = 0x20;
const PX_SIG: usize = 0x24;
const PX_SSTS: usize = 0x28;
const PX_SCTL: usize = 0x2C;
const PX_SERR: usize = 0x30;
const PX_SACT: usize = 0x34;
const PX_CI: usize = 0x38;

// PxCMD bits.
const CMD_ST: u32 = 1 << 0;
const CMD_FRE: u32 = 1 << 4;
const CMD_CR: u32 = 1 << 15;

// PxTFD bits.
const TFD_DRQ: u32 = 1 << 3;
const TFD_BSY: u32 = 1 << 7;

/// PxIS task-file error status.
const IS_TFES: u32 = 1 << 30;

/// SATA drive signature for ATAPI devices.
const SIG_ATAPI: u32 = 0xEB14_0101;

// ATA commands.
const ATA_CMD_READ_DMA_EXT: u8 = 0x25;
const ATA_CMD_PACKET: u8 = 0xA0;
const ATA_CMD_IDENTIFY_PACKET: u8 = 0xA1;
const ATA_CMD_IDENTIFY: u8 = 0xEC;

/// H2D register FIS type.
const FIS_TYPE_REG_H2D: u8 = 0x27;

// Spin bounds for the hardware waits.
const SPIN_ENGINE: u32 = 1_000_000;
const SPIN_COMMAND: u32 = 2_000_000;
const SPIN_PRESENCE: u32 = 500_000;

/// Raw 32-bit register access relative to an ABAR.
///
/// The hardware implementation wraps the mapped ABAR in volatile
/// loads/stores; tests substitute a simulated HBA.
pub trait HbaMmio {
    fn read(&self, offset: usize) -> u32;
    fn write(&mut self, offset: usize, value: u32);
}

/// MMIO over a mapped ABAR.
pub struct AbarMmio {
    base: *mut u8,
}

impl AbarMmio {
    /// # Safety
    ///
    /// `base` must be the virtual base of a mapped AHCI register window.
    pub unsafe fn new(base: u64) -> Self {
        Self {
            base: base as *mut u8,
        }
    }
}

impl HbaMmio for AbarMmio {
    fn read(&self, offset: usize) -> u32 {
        // SAFETY: offset stays within the HBA register file of a mapped
        // BAR; volatile prevents the access from being elided.
        unsafe { core::ptr::read_volatile(self.base.add(offset) as *const u32) }
    }

    fn write(&mut self, offset: usize, value: u32) {
        // SAFETY: see read.
        unsafe { core::ptr::write_volatile(self.base.add(offset) as *mut u32, value) }
    }
}

/// Persistent per-port DMA frames. Once `initialized`, these frames
/// belong to the port for the lifetime of the kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortState {
    clb_phys: u64,
    fb_phys: u64,
    ct_phys: u64,
    buf_phys: u64,
    initialized: bool,
}

/// Per-controller port states, keyed by ABAR.
#[cfg(target_os = "none")]
struct Controller {
    abar: u64,
    ports: [PortState; PORTS_PER_HBA],
}

#[cfg(target_os = "none")]
impl Controller {
    const fn new() -> Self {
        Self {
            abar: 0,
            ports: [PortState {
                clb_phys: 0,
                fb_phys: 0,
                ct_phys: 0,
                buf_phys: 0,
                initialized: false,
            }; PORTS_PER_HBA],
        }
    }
}

#[cfg(target_os = "none")]
static CONTROLLERS: Mutex<[Controller; MAX_CONTROLLERS]> =
    Mutex::new([const { Controller::new() }; MAX_CONTROLLERS]);

/// Identify results for one port.
#[derive(Debug, Clone)]
pub struct IdentifyInfo {
    pub model: String,
    pub sectors: u64,
    pub atapi: bool,
}

/// The command engine over one HBA register file.
pub struct AhciEngine<'a> {
    hba: &'a mut dyn HbaMmio,
    hhdm_base: u64,
}

impl<'a> AhciEngine<'a> {
    pub fn new(hba: &'a mut dyn HbaMmio, hhdm_base: u64) -> Self {
        Self { hba, hhdm_base }
    }

    fn preg(port: usize, reg: usize) -> usize {
        PORT_BASE + port * PORT_SIZE + reg
    }

    fn pread(&self, port: usize, reg: usize) -> u32 {
        self.hba.read(Self::preg(port, reg))
    }

    fn pwrite(&mut self, port: usize, reg: usize, value: u32) {
        self.hba.write(Self::preg(port, reg), value);
    }

    /// Start the port command engine: stop a previously running engine,
    /// then FRE, then ST, then wait for CR.
    fn start_port(&mut self, port: usize) -> KernelResult<()> {
        if self.pread(port, PX_CMD) & CMD_CR != 0 {
            let cmd = self.pread(port, PX_CMD) & !CMD_ST;
            self.pwrite(port, PX_CMD, cmd);
            let mut spin = 100_000;
            while self.pread(port, PX_CMD) & CMD_CR != 0 && spin > 0 {
                spin -= 1;
                core::hint::spin_loop();
            }
        }

        let cmd = self.pread(port, PX_CMD) | CMD_FRE;
        self.pwrite(port, PX_CMD, cmd);
        let cmd = self.pread(port, PX_CMD) | CMD_ST;
        self.pwrite(port, PX_CMD, cmd);

        let mut spin = SPIN_ENGINE;
        while self.pread(port, PX_CMD) & CMD_CR == 0 {
            if spin == 0 {
                log::error!(
                    "[AHCI] start_port timeout (CMD={:#010x} SSTS={:#010x})",
                    self.pread(port, PX_CMD),
                    self.pread(port, PX_SSTS)
                );
                return Err(KernelError::DeviceTimeout {
                    device: "ahci port start",
                });
            }
            spin -= 1;
            core::hint::spin_loop();
        }
        Ok(())
    }

    /// Stop the command engine: clear ST and FRE, wait for CR to drop.
    fn stop_port(&mut self, port: usize) {
        let cmd = self.pread(port, PX_CMD) & !(CMD_ST | CMD_FRE);
        self.pwrite(port, PX_CMD, cmd);
        let mut spin = SPIN_ENGINE;
        while self.pread(port, PX_CMD) & CMD_CR != 0 && spin > 0 {
            spin -= 1;
            core::hint::spin_loop();
        }
    }

    /// COMRESET the link, clear latched status, restart the engine, and
    /// verify presence (DET=3, IPM=1).
    fn port_reset_and_wait(&mut self, port: usize) -> KernelResult<()> {
        self.stop_port(port);

        let sctl = (self.pread(port, PX_SCTL) & !0xF) | 1; // DET = 1
        self.pwrite(port, PX_SCTL, sctl);
        spin_delay(10_000);
        self.pwrite(port, PX_SCTL, sctl & !0xF);

        let mut spin = SPIN_PRESENCE;
        while spin > 0 {
            let ssts = self.pread(port, PX_SSTS);
            if ssts & 0xF == 3 && (ssts >> 8) & 0xF == 1 {
                break;
            }
            spin -= 1;
            core::hint::spin_loop();
        }

        self.pwrite(port, PX_SERR, u32::MAX);
        self.pwrite(port, PX_IS, u32::MAX);

        self.start_port(port)?;

        let ssts = self.pread(port, PX_SSTS);
        if ssts & 0xF == 3 && (ssts >> 8) & 0xF == 1 {
            Ok(())
        } else {
            self.dump_port_status(port);
            Err(KernelError::NoDevice)
        }
    }

    /// First slot not busy in SACT|CI.
    fn find_cmdslot(&self, port: usize) -> Option<usize> {
        let busy = self.pread(port, PX_SACT) | self.pread(port, PX_CI);
        (0..PORTS_PER_HBA).find(|&slot| busy & (1 << slot) == 0)
    }

    fn dump_port_status(&self, port: usize) {
        log::warn!(
            "[AHCI] port {} status CMD={:#010x} SSTS={:#010x} TFD={:#010x} IS={:#010x} SERR={:#010x}",
            port,
            self.pread(port, PX_CMD),
            self.pread(port, PX_SSTS),
            self.pread(port, PX_TFD),
            self.pread(port, PX_IS),
            self.pread(port, PX_SERR)
        );
    }

    #[inline]
    fn dma_ptr(&self, phys: u64) -> *mut u8 {
        (self.hhdm_base + phys) as *mut u8
    }

    /// Zero a whole DMA frame.
    fn clear_frame(&self, phys: u64) {
        // SAFETY: port-state frames are whole frames owned by this port.
        unsafe { core::ptr::write_bytes(self.dma_ptr(phys), 0, 4096) }
    }

    /// Write command header `slot`: CFIS length in dwords, ATAPI bit,
    /// PRDT count 1, command table base.
    fn build_header(&self, state: &PortState, slot: usize, atapi: bool) {
        let header = self.dma_ptr(state.clb_phys + (slot * 32) as u64) as *mut u32;
        let mut dw0: u32 = 5; // CFIS length: 20 bytes / 4
        if atapi {
            dw0 |= 1 << 5;
        }
        dw0 |= 1 << 16; // PRDTL = 1
        // SAFETY: the command list frame is owned by this port and the
        // slot offset stays inside it.
        unsafe {
            core::ptr::write_bytes(header as *mut u8, 0, 32);
            header.write(dw0);
            header.add(2).write(state.ct_phys as u32);
            header.add(3).write((state.ct_phys >> 32) as u32);
        }
    }

    /// Fill the single PRDT entry: bounce buffer, `bytes` - 1, IOC.
    fn build_prdt(&self, state: &PortState, bytes: u32) {
        let prdt = self.dma_ptr(state.ct_phys + 0x80) as *mut u32;
        // SAFETY: offset 0x80 of the command table frame is the first
        // PRDT entry.
        unsafe {
            prdt.write(state.buf_phys as u32);
            prdt.add(1).write((state.buf_phys >> 32) as u32);
            prdt.add(2).write(0);
            prdt.add(3).write((bytes - 1) | (1 << 31));
        }
    }

    /// CFIS bytes of the command table.
    fn cfis_ptr(&self, state: &PortState) -> *mut u8 {
        self.dma_ptr(state.ct_phys)
    }

    /// Issue the prepared command in `slot` and poll it to completion.
    /// Returns `TaskFileError` if PxIS reports TFES.
    fn issue_and_wait(&mut self, port: usize, slot: usize) -> KernelResult<()> {
        // All header/table/PRDT writes must be visible to the device
        // before the CI bit is set.
        fence(Ordering::Release);
        let ci = self.pread(port, PX_CI);
        self.pwrite(port, PX_CI, ci | (1 << slot));

        let mut spin = SPIN_COMMAND;
        loop {
            if self.pread(port, PX_CI) & (1 << slot) == 0 {
                return Ok(());
            }
            if self.pread(port, PX_IS) & IS_TFES != 0 {
                log::warn!(
                    "[AHCI] TFES on port {} (IS={:#010x} TFD={:#010x})",
                    port,
                    self.pread(port, PX_IS),
                    self.pread(port, PX_TFD)
                );
                return Err(KernelError::TaskFileError { port: port as u32 });
            }
            if spin == 0 {
                log::error!(
                    "[AHCI] command timeout on port {} (CI={:#010x} IS={:#010x} TFD={:#010x})",
                    port,
                    self.pread(port, PX_CI),
                    self.pread(port, PX_IS),
                    self.pread(port, PX_TFD)
                );
                return Err(KernelError::DeviceTimeout {
                    device: "ahci command",
                });
            }
            spin -= 1;
            core::hint::spin_loop();
        }
    }

    /// Identify the device on `port`, allocating the persistent frames on
    /// first use. Falls back to an ATAPI INQUIRY when IDENTIFY comes back
    /// empty.
    pub fn identify_port(
        &mut self,
        state: &mut PortState,
        frames: &mut dyn FrameSource,
        port: usize,
    ) -> KernelResult<IdentifyInfo> {
        if self.pread(port, PX_SSTS) & 0xF != 3 {
            return Err(KernelError::NoDevice);
        }

        if !state.initialized {
            let mut allocated = [0u64; 4];
            for (i, slot) in allocated.iter_mut().enumerate() {
                match frames.alloc_frame() {
                    Some(phys) => *slot = phys,
                    None => {
                        for &phys in &allocated[..i] {
                            frames.free_frame(phys);
                        }
                        return Err(KernelError::OutOfMemory);
                    }
                }
            }
            let [clb, fb, ct, buf] = allocated;
            state.clb_phys = clb;
            state.fb_phys = fb;
            state.ct_phys = ct;
            state.buf_phys = buf;
            for phys in allocated {
                self.clear_frame(phys);
            }

            self.pwrite(port, PX_CLB, state.clb_phys as u32);
            self.pwrite(port, PX_CLBU, (state.clb_phys >> 32) as u32);
            self.pwrite(port, PX_FB, state.fb_phys as u32);
            self.pwrite(port, PX_FBU, (state.fb_phys >> 32) as u32);
            state.initialized = true;
        }

        self.start_port(port)?;

        let sig = self.pread(port, PX_SIG);
        let atapi = sig == SIG_ATAPI;

        // Build slot 0: IDENTIFY (or IDENTIFY PACKET DEVICE for ATAPI),
        // one PRDT entry covering 512 bytes of the bounce buffer.
        self.clear_frame(state.ct_phys);
        self.build_header(state, 0, atapi);
        self.build_prdt(state, SECTOR_SIZE as u32);
        let cfis = self.cfis_ptr(state);
        // SAFETY: CFIS area of the owned command table.
        unsafe {
            core::ptr::write_bytes(cfis, 0, 64);
            cfis.write(FIS_TYPE_REG_H2D);
            cfis.add(1).write(1 << 7); // C bit: command
            cfis.add(2).write(if atapi {
                ATA_CMD_IDENTIFY_PACKET
            } else {
                ATA_CMD_IDENTIFY
            });
        }

        let mut attempt = 0;
        loop {
            self.pwrite(port, PX_IS, u32::MAX);
            let slot = self
                .find_cmdslot(port)
                .ok_or(KernelError::DeviceTimeout { device: "ahci slot" })?;
            // Identify always prepares slot 0; a busy slot 0 means the
            // engine is wedged and the reset below clears it.
            match self.issue_and_wait(port, slot) {
                Ok(()) => break,
                Err(err) => {
                    self.dump_port_status(port);
                    if attempt == 0 && self.port_reset_and_wait(port).is_ok() {
                        attempt += 1;
                        continue;
                    }
                    return Err(err);
                }
            }
        }

        // SAFETY: the device DMA-ed 512 bytes into the owned buffer.
        let words: &[u16] = unsafe {
            core::slice::from_raw_parts(self.dma_ptr(state.buf_phys) as *const u16, 256)
        };

        let mut model = String::new();
        for &word in &words[27..47] {
            for byte in [(word >> 8) as u8, word as u8] {
                if byte != 0 {
                    model.push(byte as char);
                }
            }
        }
        let mut model = String::from(model.trim_end());
        let sectors = words[60] as u64 | ((words[61] as u64) << 16);

        if model.is_empty() || sectors == 0 {
            log::info!(
                "[AHCI] empty IDENTIFY on port {} sig={:#010x}, trying ATAPI INQUIRY",
                port,
                sig
            );
            model = self.atapi_inquiry(state, port)?;
        }

        log::info!("[AHCI] IDENTIFY port {}: model='{}' sectors={}", port, model, sectors);
        Ok(IdentifyInfo {
            model,
            sectors,
            atapi,
        })
    }

    /// SCSI INQUIRY (CDB 0x12) through an ATA PACKET command; 36 bytes
    /// into the bounce buffer. Returns the "vendor product" string.
    fn atapi_inquiry(&mut self, state: &PortState, port: usize) -> KernelResult<String> {
        const INQUIRY_LEN: u8 = 36;

        self.clear_frame(state.ct_phys);
        self.build_header(state, 0, true);
        self.build_prdt(state, INQUIRY_LEN as u32);

        let cfis = self.cfis_ptr(state);
        // SAFETY: CFIS and ACMD areas of the owned command table.
        unsafe {
            core::ptr::write_bytes(cfis, 0, 64);
            cfis.write(FIS_TYPE_REG_H2D);
            cfis.add(1).write(1 << 7);
            cfis.add(2).write(ATA_CMD_PACKET);
            cfis.add(3).write(0x01); // feature: PIO data-in
            cfis.add(5).write(INQUIRY_LEN); // byte count limit low
            cfis.add(6).write(0); // byte count limit high

            let acmd = cfis.add(0x40);
            core::ptr::write_bytes(acmd, 0, 16);
            acmd.write(0x12); // INQUIRY
            acmd.add(4).write(INQUIRY_LEN);
        }

        for attempt in 0..2 {
            self.pwrite(port, PX_IS, u32::MAX);
            let Some(slot) = self.find_cmdslot(port) else {
                continue;
            };
            match self.issue_and_wait(port, slot) {
                Ok(()) => {
                    // SAFETY: 36 INQUIRY bytes landed in the owned buffer.
                    let data: &[u8] = unsafe {
                        core::slice::from_raw_parts(self.dma_ptr(state.buf_phys), 36)
                    };
                    let vendor = trimmed_ascii(&data[8..16]);
                    let product = trimmed_ascii(&data[16..32]);
                    let mut model = String::from(vendor);
                    if !product.is_empty() {
                        if !model.is_empty() {
                            model.push(' ');
                        }
                        model.push_str(product);
                    }
                    return Ok(model);
                }
                Err(_) if attempt == 0 => {
                    self.dump_port_status(port);
                    if self.port_reset_and_wait(port).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        log::warn!("[AHCI] ATAPI INQUIRY failed on port {}", port);
        Ok(String::from("ATAPI device"))
    }

    /// Read `count` sectors at `lba` into `out`.
    ///
    /// `count` must be 1..=8 (the bounce buffer is one frame) and `out`
    /// at least `count * 512` bytes; violations fail before any register
    /// is touched. One COMRESET retry on task-file error.
    pub fn read(
        &mut self,
        state: &PortState,
        port: usize,
        lba: u64,
        count: u16,
        out: &mut [u8],
    ) -> KernelResult<()> {
        if count == 0 || count > MAX_READ_SECTORS {
            return Err(KernelError::InvalidArgument { name: "count" });
        }
        if out.len() < count as usize * SECTOR_SIZE {
            return Err(KernelError::InvalidArgument { name: "out_buf" });
        }
        if !state.initialized {
            return Err(KernelError::NotInitialized {
                subsystem: "ahci port",
            });
        }

        self.start_port(port)?;

        // Wait out a busy device before touching the latches.
        let mut spin = SPIN_ENGINE;
        while self.pread(port, PX_TFD) & (TFD_BSY | TFD_DRQ) != 0 {
            if spin == 0 {
                log::warn!(
                    "[AHCI] port {} stuck busy (TFD={:#010x})",
                    port,
                    self.pread(port, PX_TFD)
                );
                return Err(KernelError::DeviceTimeout { device: "ahci tfd" });
            }
            spin -= 1;
            core::hint::spin_loop();
        }

        for attempt in 0..2 {
            self.pwrite(port, PX_IS, u32::MAX);
            self.pwrite(port, PX_SERR, u32::MAX);

            let slot = self
                .find_cmdslot(port)
                .ok_or(KernelError::DeviceTimeout { device: "ahci slot" })?;

            self.build_header(state, slot, false);
            self.clear_frame(state.ct_phys);
            self.build_prdt(state, count as u32 * SECTOR_SIZE as u32);

            let cfis = self.cfis_ptr(state);
            // SAFETY: CFIS area of the owned command table.
            unsafe {
                core::ptr::write_bytes(cfis, 0, 64);
                cfis.write(FIS_TYPE_REG_H2D);
                cfis.add(1).write(1 << 7);
                cfis.add(2).write(ATA_CMD_READ_DMA_EXT);
                cfis.add(7).write(1 << 6); // LBA mode

                cfis.add(4).write(lba as u8);
                cfis.add(5).write((lba >> 8) as u8);
                cfis.add(6).write((lba >> 16) as u8);
                cfis.add(8).write((lba >> 24) as u8);
                cfis.add(9).write((lba >> 32) as u8);
                cfis.add(10).write((lba >> 40) as u8);

                cfis.add(12).write(count as u8);
                cfis.add(13).write((count >> 8) as u8);
            }

            match self.issue_and_wait(port, slot) {
                Ok(()) => {
                    // SAFETY: the transfer DMA-ed count*512 bytes into
                    // the owned bounce buffer.
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            self.dma_ptr(state.buf_phys),
                            out.as_mut_ptr(),
                            count as usize * SECTOR_SIZE,
                        );
                    }
                    return Ok(());
                }
                Err(KernelError::TaskFileError { .. }) if attempt == 0 => {
                    log::warn!("[AHCI] read TFES on port {}, resetting and retrying", port);
                    self.port_reset_and_wait(port)?;
                }
                Err(err) => return Err(err),
            }
        }
        Err(KernelError::TaskFileError { port: port as u32 })
    }
}

fn trimmed_ascii(bytes: &[u8]) -> &str {
    core::str::from_utf8(bytes)
        .unwrap_or("")
        .trim_end_matches(|c: char| c == ' ' || c == '\0')
}

fn spin_delay(iterations: u32) {
    for _ in 0..iterations {
        core::hint::spin_loop();
    }
}

/// Primary-partition entry parsed from an MBR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbrPartition {
    /// 1-based slot index.
    pub index: usize,
    pub kind: u8,
    pub start_lba: u64,
    pub sectors: u64,
}

/// Check the 0x55AA signature at bytes 510/511.
pub fn mbr_has_signature(sector: &[u8]) -> bool {
    sector.len() >= 512 && sector[510] == 0x55 && sector[511] == 0xAA
}

/// Parse the four primary entries at offset 0x1BE. Empty (type 0) slots
/// are skipped; indices are 1-based like the partition names.
pub fn parse_mbr_partitions(sector: &[u8]) -> [Option<MbrPartition>; 4] {
    let mut out = [None; 4];
    if sector.len() < 512 {
        return out;
    }
    for i in 0..4 {
        let e = &sector[0x1BE + i * 16..0x1BE + (i + 1) * 16];
        let kind = e[4];
        if kind == 0 {
            continue;
        }
        let start = u32::from_le_bytes([e[8], e[9], e[10], e[11]]) as u64;
        let count = u32::from_le_bytes([e[12], e[13], e[14], e[15]]) as u64;
        out[i] = Some(MbrPartition {
            index: i + 1,
            kind,
            start_lba: start,
            sectors: count,
        });
    }
    out
}

/// Find or claim the controller slot for `abar`.
#[cfg(target_os = "none")]
fn controller_slot(abar: u64) -> Option<usize> {
    let mut controllers = CONTROLLERS.lock();
    for (i, c) in controllers.iter_mut().enumerate() {
        if c.abar == abar {
            return Some(i);
        }
        if c.abar == 0 {
            c.abar = abar;
            return Some(i);
        }
    }
    None
}

/// Read sectors from a previously identified port. `abar` is the mapped
/// ABAR virtual base recorded at attach time.
#[cfg(target_os = "none")]
pub fn read(abar: u64, port: usize, lba: u64, count: u16, out: &mut [u8]) -> KernelResult<()> {
    let slot = controller_slot(abar).ok_or(KernelError::ResourceExhausted {
        resource: "AHCI controller",
    })?;
    // Port state is immutable once initialized; a copy is enough. Reads
    // stay serialized per port because only the BSP issues them.
    let state = CONTROLLERS.lock()[slot].ports[port];

    // SAFETY: abar was mapped by PCI BAR mapping and stays mapped.
    let mut mmio = unsafe { AbarMmio::new(abar) };
    let mut engine = AhciEngine::new(&mut mmio, crate::mm::hhdm_base());
    engine.read(&state, port, lba, count, out)
}

/// PCI probe entry: identify every implemented port of the controller,
/// then read its MBR and register the disk, partitions, and device
/// nodes.
#[cfg(target_os = "none")]
pub fn attach(dev: &crate::drivers::pci::PciDevice) -> KernelResult<()> {
    use alloc::sync::Arc;

    let mut abar = 0u64;
    for b in 0..6 {
        if dev.bar_size[b] != 0 && !dev.bar_is_io[b] && dev.bar_virt[b] != 0 {
            abar = dev.bar_virt[b];
            break;
        }
    }
    if abar == 0 {
        return Err(KernelError::NotFound { resource: "ABAR" });
    }

    let slot = controller_slot(abar).ok_or(KernelError::ResourceExhausted {
        resource: "AHCI controller",
    })?;

    // SAFETY: the ABAR window was mapped during BAR mapping.
    let mut mmio = unsafe { AbarMmio::new(abar) };
    let pi = mmio.read(HBA_PI);
    log::info!(
        "[AHCI] attach {:02x}:{:02x}.{} PI={:#010x}",
        dev.bus,
        dev.device,
        dev.function,
        pi
    );

    for port in 0..PORTS_PER_HBA {
        if pi & (1 << port) == 0 {
            continue;
        }

        let mut state = CONTROLLERS.lock()[slot].ports[port];
        let identify = {
            let mut frames = crate::mm::pmm::FRAME_ALLOCATOR.lock();
            let mut engine = AhciEngine::new(&mut mmio, crate::mm::hhdm_base());
            engine.identify_port(&mut state, &mut *frames, port)
        };
        CONTROLLERS.lock()[slot].ports[port] = state;

        let info = match identify {
            Ok(info) => info,
            Err(KernelError::NoDevice) => continue,
            Err(err) => {
                log::warn!("[AHCI] identify failed on port {}: {}", port, err);
                continue;
            }
        };

        let mut mbr = [0u8; SECTOR_SIZE];
        if read(abar, port, 0, 1, &mut mbr).is_err() {
            log::warn!("[AHCI] MBR read failed on port {}", port);
            continue;
        }

        let disk_name = next_disk_name();
        let disk = Arc::new(AhciDisk { abar, port });
        if crate::fs::blockdev::register_disk(&disk_name, disk).is_err() {
            log::warn!("[AHCI] block table full, skipping {}", disk_name);
            continue;
        }
        log::info!(
            "[AHCI] disk {} on port {}: '{}' ({} sectors)",
            disk_name,
            port,
            info.model,
            info.sectors
        );

        if !mbr_has_signature(&mbr) {
            log::warn!("[AHCI] {}: no MBR signature, skipping partitions", disk_name);
            continue;
        }
        for part in parse_mbr_partitions(&mbr).into_iter().flatten() {
            log::info!(
                "[AHCI] partition {}: type={:#04x} start={} count={}",
                part.index,
                part.kind,
                part.start_lba,
                part.sectors
            );
            if crate::fs::blockdev::register_partition(
                &disk_name,
                part.index,
                part.start_lba,
                part.sectors,
            )
            .is_ok()
            {
                let mut node = String::from("/dev/");
                node.push_str(&disk_name);
                node.push((b'0' + part.index as u8) as char);
                crate::fs::devfs::register(&node, crate::fs::devfs::DevType::Block, None, 0).ok();
            }
        }
    }

    Ok(())
}

/// Global disk-letter counter: the first identified disk is `sda`.
#[cfg(target_os = "none")]
fn next_disk_name() -> String {
    use core::sync::atomic::AtomicUsize;
    static DISK_INDEX: AtomicUsize = AtomicUsize::new(0);
    let index = DISK_INDEX.fetch_add(1, Ordering::SeqCst);
    let mut name = String::from("sd");
    name.push((b'a' + (index as u8 % 26)) as char);
    name
}

/// Sector-read capability handed to the block registry: reads go back
/// through the port engine.
#[cfg(target_os = "none")]
pub struct AhciDisk {
    abar: u64,
    port: usize,
}

#[cfg(target_os = "none")]
impl crate::fs::blockdev::SectorRead for AhciDisk {
    fn read_sectors(&self, lba: u64, count: u16, out: &mut [u8]) -> KernelResult<()> {
        read(self.abar, self.port, lba, count, out)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::vmm::test_support::ArenaFrames;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::vec::Vec;

    /// Simulated single-port HBA: executes IDENTIFY and READ DMA EXT
    /// against a byte image, with optional task-file error injection.
    struct MockHba {
        regs: RefCell<HashMap<usize, u32>>,
        hhdm: u64,
        disk: Vec<u8>,
        fail_reads: RefCell<usize>,
        resets: RefCell<usize>,
        ci_writes: RefCell<usize>,
        model: &'static str,
    }

    impl MockHba {
        fn new(hhdm: u64, disk: Vec<u8>) -> Self {
            let hba = Self {
                regs: RefCell::new(HashMap::new()),
                hhdm,
                disk,
                fail_reads: RefCell::new(0),
                resets: RefCell::new(0),
                ci_writes: RefCell::new(0),
                model: "QEMU HARDDISK",
            };
            // Device present: DET=3, IPM=1; SATA signature.
            hba.regs
                .borrow_mut()
                .insert(AhciEngine::preg(0, PX_SSTS), 3 | (1 << 8));
            hba.regs
                .borrow_mut()
                .insert(AhciEngine::preg(0, PX_SIG), 0x0000_0101);
            hba
        }

        fn reg(&self, offset: usize) -> u32 {
            *self.regs.borrow().get(&offset).unwrap_or(&0)
        }

        fn set_reg(&self, offset: usize, value: u32) {
            self.regs.borrow_mut().insert(offset, value);
        }

        fn dma(&self, phys: u64) -> *mut u8 {
            (self.hhdm + phys) as *mut u8
        }

        /// Execute the command prepared in `slot`.
        fn execute(&self, slot: usize) {
            let clb = self.reg(AhciEngine::preg(0, PX_CLB)) as u64
                | ((self.reg(AhciEngine::preg(0, PX_CLBU)) as u64) << 32);
            let header = self.dma(clb + (slot * 32) as u64) as *const u32;
            let (ctba, prdtl) = unsafe {
                (
                    (*header.add(2)) as u64 | (((*header.add(3)) as u64) << 32),
                    (*header) >> 16,
                )
            };
            assert_eq!(prdtl, 1, "engine always posts one PRDT entry");

            let cfis = self.dma(ctba);
            let prdt = self.dma(ctba + 0x80) as *const u32;
            let (dba, dbc) = unsafe {
                (
                    (*prdt) as u64 | (((*prdt.add(1)) as u64) << 32),
                    (*prdt.add(3)) & 0x3F_FFFF,
                )
            };
            let bytes = (dbc + 1) as usize;

            let command = unsafe { *cfis.add(2) };
            match command {
                ATA_CMD_IDENTIFY => {
                    let mut words = [0u16; 256];
                    let model = self.model.as_bytes();
                    for i in 0..20 {
                        let hi = *model.get(i * 2).unwrap_or(&b' ');
                        let lo = *model.get(i * 2 + 1).unwrap_or(&b' ');
                        words[27 + i] = ((hi as u16) << 8) | lo as u16;
                    }
                    let sectors = (self.disk.len() / SECTOR_SIZE) as u32;
                    words[60] = sectors as u16;
                    words[61] = (sectors >> 16) as u16;
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            words.as_ptr() as *const u8,
                            self.dma(dba),
                            512.min(bytes),
                        );
                    }
                }
                ATA_CMD_READ_DMA_EXT => {
                    if *self.fail_reads.borrow() > 0 {
                        *self.fail_reads.borrow_mut() -= 1;
                        let is = AhciEngine::preg(0, PX_IS);
                        self.set_reg(is, self.reg(is) | IS_TFES);
                        // Leave CI set: the command never completes.
                        return;
                    }
                    let lba = unsafe {
                        (*cfis.add(4)) as u64
                            | ((*cfis.add(5)) as u64) << 8
                            | ((*cfis.add(6)) as u64) << 16
                            | ((*cfis.add(8)) as u64) << 24
                            | ((*cfis.add(9)) as u64) << 32
                            | ((*cfis.add(10)) as u64) << 40
                    };
                    let start = lba as usize * SECTOR_SIZE;
                    let end = (start + bytes).min(self.disk.len());
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            self.disk[start..end].as_ptr(),
                            self.dma(dba),
                            end - start,
                        );
                    }
                }
                other => panic!("mock HBA got unexpected command {:#x}", other),
            }

            // Command retired: clear the CI bit.
            let ci_off = AhciEngine::preg(0, PX_CI);
            self.set_reg(ci_off, self.reg(ci_off) & !(1 << slot));
        }
    }

    impl HbaMmio for MockHba {
        fn read(&self, offset: usize) -> u32 {
            self.reg(offset)
        }

        fn write(&mut self, offset: usize, value: u32) {
            let cmd_off = AhciEngine::preg(0, PX_CMD);
            if offset == cmd_off {
                // Mirror ST into CR and FRE into FR immediately.
                let mut v = value & !(CMD_CR);
                if v & CMD_ST != 0 {
                    v |= CMD_CR;
                }
                self.set_reg(offset, v);
                return;
            }
            if offset == AhciEngine::preg(0, PX_SCTL) {
                if value & 0xF == 1 {
                    *self.resets.borrow_mut() += 1;
                }
                self.set_reg(offset, value);
                return;
            }
            if offset == AhciEngine::preg(0, PX_IS) || offset == AhciEngine::preg(0, PX_SERR) {
                // Write-1-to-clear.
                self.set_reg(offset, self.reg(offset) & !value);
                return;
            }
            if offset == AhciEngine::preg(0, PX_CI) {
                *self.ci_writes.borrow_mut() += 1;
                let previous = self.reg(offset);
                self.set_reg(offset, value);
                for slot in 0..32 {
                    if value & (1 << slot) != 0 && previous & (1 << slot) == 0 {
                        self.execute(slot);
                    }
                }
                return;
            }
            self.set_reg(offset, value);
        }
    }

    fn arena(pages: usize) -> (u64, ArenaFrames) {
        let bytes = pages * 4096;
        let layout = std::alloc::Layout::from_size_align(bytes, 4096).unwrap();
        let base = unsafe { std::alloc::alloc_zeroed(layout) } as u64;
        (
            base,
            ArenaFrames {
                next: 0,
                limit: bytes as u64,
                freed: Vec::new(),
            },
        )
    }

    fn test_disk(sectors: usize) -> Vec<u8> {
        let mut disk = vec![0u8; sectors * SECTOR_SIZE];
        for (i, chunk) in disk.chunks_mut(SECTOR_SIZE).enumerate() {
            for (j, byte) in chunk.iter_mut().enumerate() {
                *byte = (i * 7 + j) as u8;
            }
        }
        disk
    }

    fn identified_port(hba: &mut MockHba, frames: &mut ArenaFrames) -> PortState {
        let hhdm = hba.hhdm;
        let mut engine = AhciEngine::new(hba, hhdm);
        let mut state = PortState::default();
        engine.identify_port(&mut state, frames, 0).unwrap();
        state
    }

    #[test]
    fn identify_reports_model_and_sector_count() {
        let (hhdm, mut frames) = arena(16);
        let mut hba = MockHba::new(hhdm, test_disk(2048));
        let mut state = PortState::default();
        let mut engine = AhciEngine::new(&mut hba, hhdm);
        let info = engine.identify_port(&mut state, &mut frames, 0).unwrap();
        assert_eq!(info.model, "QEMU HARDDISK");
        assert_eq!(info.sectors, 2048);
        assert!(!info.atapi);
        assert!(state.initialized);
    }

    #[test]
    fn identify_allocates_persistent_frames_once() {
        let (hhdm, mut frames) = arena(16);
        let mut hba = MockHba::new(hhdm, test_disk(64));
        let mut state = PortState::default();
        {
            let mut engine = AhciEngine::new(&mut hba, hhdm);
            engine.identify_port(&mut state, &mut frames, 0).unwrap();
        }
        let after_first = frames.next;
        {
            let mut engine = AhciEngine::new(&mut hba, hhdm);
            engine.identify_port(&mut state, &mut frames, 0).unwrap();
        }
        assert_eq!(frames.next, after_first, "frames persist across identifies");
        assert!(frames.freed.is_empty());
    }

    #[test]
    fn read_copies_the_requested_sectors() {
        let (hhdm, mut frames) = arena(16);
        let disk = test_disk(64);
        let expected = disk[5 * SECTOR_SIZE..7 * SECTOR_SIZE].to_vec();
        let mut hba = MockHba::new(hhdm, disk);
        let state = identified_port(&mut hba, &mut frames);

        let mut out = vec![0u8; 2 * SECTOR_SIZE];
        let mut engine = AhciEngine::new(&mut hba, hhdm);
        engine.read(&state, 0, 5, 2, &mut out).unwrap();
        assert_eq!(out, expected);
    }

    #[test]
    fn read_validates_arguments_before_touching_ci() {
        let (hhdm, mut frames) = arena(16);
        let mut hba = MockHba::new(hhdm, test_disk(64));
        let state = identified_port(&mut hba, &mut frames);
        let ci_before = *hba.ci_writes.borrow();

        let mut small = [0u8; 256];
        let mut ok = [0u8; 4096];
        {
            let mut engine = AhciEngine::new(&mut hba, hhdm);
            assert!(matches!(
                engine.read(&state, 0, 0, 0, &mut ok),
                Err(KernelError::InvalidArgument { .. })
            ));
            assert!(matches!(
                engine.read(&state, 0, 0, 9, &mut ok),
                Err(KernelError::InvalidArgument { .. })
            ));
            assert!(matches!(
                engine.read(&state, 0, 0, 1, &mut small),
                Err(KernelError::InvalidArgument { .. })
            ));
        }
        assert_eq!(*hba.ci_writes.borrow(), ci_before);
    }

    #[test]
    fn read_requires_an_initialized_port() {
        let (hhdm, _frames) = arena(4);
        let mut hba = MockHba::new(hhdm, test_disk(8));
        let state = PortState::default();
        let mut out = [0u8; 512];
        let mut engine = AhciEngine::new(&mut hba, hhdm);
        assert!(matches!(
            engine.read(&state, 0, 0, 1, &mut out),
            Err(KernelError::NotInitialized { .. })
        ));
    }

    #[test]
    fn tfes_triggers_comreset_and_retry() {
        let (hhdm, mut frames) = arena(16);
        let disk = test_disk(16);
        let expected = disk[..SECTOR_SIZE].to_vec();
        let mut hba = MockHba::new(hhdm, disk);
        let state = identified_port(&mut hba, &mut frames);
        *hba.fail_reads.borrow_mut() = 1;

        let mut out = vec![0u8; SECTOR_SIZE];
        let mut engine = AhciEngine::new(&mut hba, hhdm);
        engine.read(&state, 0, 0, 1, &mut out).unwrap();
        assert_eq!(out, expected);
        assert_eq!(*hba.resets.borrow(), 1, "exactly one COMRESET issued");
    }

    #[test]
    fn persistent_tfes_is_reported_after_one_retry() {
        let (hhdm, mut frames) = arena(16);
        let mut hba = MockHba::new(hhdm, test_disk(16));
        let state = identified_port(&mut hba, &mut frames);
        *hba.fail_reads.borrow_mut() = 2;

        let mut out = vec![0u8; SECTOR_SIZE];
        let mut engine = AhciEngine::new(&mut hba, hhdm);
        assert!(matches!(
            engine.read(&state, 0, 0, 1, &mut out),
            Err(KernelError::TaskFileError { .. })
        ));
    }

    #[test]
    fn mbr_parser_extracts_primary_partitions() {
        let mut sector = vec![0u8; 512];
        sector[510] = 0x55;
        sector[511] = 0xAA;
        // Partition 1: type 0x83, start 2048, 200000 sectors.
        let e = 0x1BE;
        sector[e + 4] = 0x83;
        sector[e + 8..e + 12].copy_from_slice(&2048u32.to_le_bytes());
        sector[e + 12..e + 16].copy_from_slice(&200_000u32.to_le_bytes());
        // Partition 3: type 0x0C.
        let e3 = 0x1BE + 2 * 16;
        sector[e3 + 4] = 0x0C;
        sector[e3 + 8..e3 + 12].copy_from_slice(&300_000u32.to_le_bytes());
        sector[e3 + 12..e3 + 16].copy_from_slice(&1000u32.to_le_bytes());

        assert!(mbr_has_signature(&sector));
        let parts = parse_mbr_partitions(&sector);
        assert_eq!(
            parts[0],
            Some(MbrPartition {
                index: 1,
                kind: 0x83,
                start_lba: 2048,
                sectors: 200_000
            })
        );
        assert!(parts[1].is_none());
        assert_eq!(parts[2].unwrap().start_lba, 300_000);
        assert!(parts[3].is_none());

        sector[510] = 0;
        assert!(!mbr_has_signature(&sector));
    }
}
