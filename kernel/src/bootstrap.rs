//! Startup orchestration
//!
//! Takes the machine from the Multiboot2 handoff to the idle loop:
//! descriptor tables and the PIC, the PIT, memory management, ACPI/APIC
//! discovery, PCI enumeration and driver probing, filesystem mounts
//! driven by the command line, and finally AP bring-up.

#![cfg(target_os = "none")]

use alloc::boxed::Box;

use crate::arch::x86_64::{acpi, apic, multiboot, smp, timer};
use crate::fs::{self, blockdev, devfs, ext2::Ext2Fs, fstab, ustar::UstarFs};
use crate::{cmdline, drivers, logger, mm};

pub fn kernel_main(boot: &'static multiboot::BootInfo) -> ! {
    logger::init();
    log::info!("vanadium-kernel v{}", env!("CARGO_PKG_VERSION"));

    crate::arch::x86_64::init();
    timer::init();

    mm::init(boot);

    acpi::init(boot);
    apic::init(acpi::madt());
    for ioapic in &acpi::madt().ioapics {
        log::info!(
            "[IOAPIC] id={} at {:#x}, GSI base {}",
            ioapic.id,
            ioapic.addr,
            ioapic.gsi_base
        );
    }
    // Prepare the PIT redirection masked; the remapped PIC stays the
    // delivery path during bring-up.
    apic::map_irq(apic::apic().id(), 0, 32, true);

    // The CPU table must exist before timer calibration records its
    // ticks into the BSP descriptor.
    {
        let mut cpus = smp::CPUS.lock();
        cpus.populate(acpi::madt(), apic::apic().id());
        log::info!("[SMP] {} CPUs discovered", cpus.count);
    }
    apic::timer_calibrate();

    drivers::pci::init();
    drivers::pci::print_devices();
    drivers::pci::map_all_bars();
    drivers::register_builtin();
    drivers::pci::probe_all();

    let root = cmdline::boot_get("root");
    match root {
        Some(root) => log::info!("[BOOT] root={}", root),
        None => log::info!("[BOOT] no root= on the command line"),
    }
    if let Some(level) = cmdline::boot_get("loglevel") {
        match level.parse::<u8>() {
            Ok(level) => {
                logger::set_loglevel(level);
                log::info!("[BOOT] loglevel={}", level);
            }
            Err(_) => log::warn!("[BOOT] unparseable loglevel={}", level),
        }
    }

    // The initrd module, when present, is always exposed as /dev/initrd
    // and mounted at /initrd, independent of the root choice.
    let initrd = boot.modules[0].map(|module| {
        // SAFETY: module memory is reserved from the PMM and direct-
        // mapped for the kernel lifetime.
        unsafe { boot.module_bytes(&module) }
    });
    if let Some(data) = initrd {
        if devfs::register("/dev/initrd", devfs::DevType::Special, Some(data), 0).is_ok() {
            match UstarFs::mount(data) {
                Ok(fs) => {
                    if fs::mount("/initrd", Box::new(fs)).is_ok() {
                        let mut buf = [0u8; 256];
                        match fs::read_all("/initrd/test.txt", &mut buf) {
                            Ok(n) => log::info!(
                                "[BOOT] /initrd/test.txt: {}",
                                core::str::from_utf8(&buf[..n]).unwrap_or("<binary>")
                            ),
                            Err(_) => log::info!("[BOOT] /initrd/test.txt not found"),
                        }
                    }
                }
                Err(err) => log::warn!("[BOOT] initrd mount failed: {}", err),
            }
        }
    }

    mount_root(root, initrd);

    // With / mounted, pick up any additional fstab mounts and show the
    // result of the canonical smoke-test read.
    fstab::parse_and_mount("/etc/fstab").ok();
    fs::list_dir("/mnt/data").ok();
    let mut buf = [0u8; 512];
    match fs::read_all("/test.txt", &mut buf) {
        Ok(n) => log::info!(
            "[BOOT] /test.txt: {}",
            core::str::from_utf8(&buf[..n]).unwrap_or("<binary>")
        ),
        Err(_) => log::info!("[BOOT] /test.txt not found"),
    }
    if let Ok(fd) = fs::fd_open("/test.txt") {
        let mut fd_buf = [0u8; 256];
        if let Ok(n) = fs::fd_read(fd, &mut fd_buf, 0) {
            log::debug!("[BOOT] fd read {} bytes", n);
        }
        fs::fd_close(fd).ok();
    }

    smp::CPUS.lock().build_mp_info(smp::ap_park);
    smp::start_aps();

    log::info!(
        "[BOOT] up: {} CPUs running, {} frames free",
        smp::started_count(),
        mm::pmm::free_count()
    );

    loop {
        crate::arch::x86_64::wait_for_interrupt();
    }
}

/// Mount the root filesystem per `root=`:
/// - `/dev/<name>`: ext2 on that partition, falling back to the initrd
///   archive if the mount fails;
/// - `initrd` or nothing: the first module as a ustar archive.
fn mount_root(root: Option<&str>, initrd: Option<&'static [u8]>) {
    match root {
        Some(root) if root.starts_with("/dev/") => {
            let devname = &root[5..];
            match blockdev::get_partition(devname) {
                Ok((start, count)) => {
                    log::info!(
                        "[BOOT] root partition {} start={} count={}",
                        devname,
                        start,
                        count
                    );
                    match Ext2Fs::mount(devname) {
                        Ok(fs) => {
                            if fs::mount("/", Box::new(fs)).is_ok() {
                                log::info!("[BOOT] ext2 mounted on / from {}", devname);
                                return;
                            }
                        }
                        Err(err) => {
                            log::warn!("[BOOT] ext2 mount failed on {}: {}", devname, err)
                        }
                    }
                    mount_initrd_root(initrd);
                }
                Err(_) => {
                    log::warn!("[BOOT] partition {} not found", devname);
                    mount_initrd_root(initrd);
                }
            }
        }
        Some("initrd") => mount_initrd_root(initrd),
        Some(other) => {
            log::warn!("[BOOT] unrecognized root={}, trying initrd", other);
            mount_initrd_root(initrd);
        }
        None => mount_initrd_root(initrd),
    }
}

fn mount_initrd_root(initrd: Option<&'static [u8]>) {
    let Some(data) = initrd else {
        log::warn!("[BOOT] no initrd module; leaving / unmounted");
        return;
    };
    match UstarFs::mount(data) {
        Ok(fs) => {
            if fs::mount("/", Box::new(fs)).is_ok() {
                log::info!("[BOOT] ustar initrd mounted on /");
            }
        }
        Err(err) => log::warn!("[BOOT] initrd root mount failed: {}", err),
    }
}
