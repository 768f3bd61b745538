//! SMP bring-up
//!
//! Application processors are woken with the INIT-SIPI-SIPI sequence.
//! The real-mode trampoline is copied to physical 0x7000 (inside the low
//! 1 MiB, which the PMM keeps reserved); the 32-bit far-jump target and
//! the CR3/stack/entry slots inside the copy are patched before the
//! first SIPI. Each AP lands in [`ap_entry`], bumps the shared started
//! counter, locates its MP-info slot by LAPIC ID, enables SSE, loads the
//! GDT/IDT, and jumps to its configured entry function.

use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use super::acpi::MadtInfo;

/// CPU descriptor table capacity.
pub const MAX_CPUS: usize = 64;

/// Physical destination of the trampoline copy; the SIPI vector is its
/// page number.
const TRAMPOLINE_PHYS: u64 = 0x7000;

/// One discovered CPU.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuDescriptor {
    pub apic_id: u32,
    pub processor_id: u32,
    pub is_bsp: bool,
    /// LAPIC timer ticks per millisecond, written by calibration.
    pub apic_timer_ticks: u32,
}

/// Per-CPU bring-up record: where the AP should go once it is in long
/// mode, plus an opaque argument word.
#[derive(Debug, Clone, Copy, Default)]
pub struct MpInfo {
    pub processor_id: u32,
    pub lapic_id: u32,
    pub entry: Option<fn(&MpInfo)>,
    pub argument: u64,
}

/// Discovered CPUs plus their MP-info mirror.
pub struct CpuTable {
    pub cpus: [CpuDescriptor; MAX_CPUS],
    pub mp_info: [MpInfo; MAX_CPUS],
    pub count: usize,
}

impl CpuTable {
    pub const fn new() -> Self {
        Self {
            cpus: [CpuDescriptor {
                apic_id: 0,
                processor_id: 0,
                is_bsp: false,
                apic_timer_ticks: 0,
            }; MAX_CPUS],
            mp_info: [MpInfo {
                processor_id: 0,
                lapic_id: 0,
                entry: None,
                argument: 0,
            }; MAX_CPUS],
            count: 0,
        }
    }

    /// Fill from the MADT, keeping enabled CPUs only and flagging the
    /// one whose APIC ID matches `bsp_apic_id`.
    pub fn populate(&mut self, madt: &MadtInfo, bsp_apic_id: u32) {
        self.count = 0;
        for cpu in madt.cpus.iter().filter(|c| c.enabled) {
            if self.count >= MAX_CPUS {
                log::warn!("[SMP] more than {} CPUs, ignoring the rest", MAX_CPUS);
                break;
            }
            self.cpus[self.count] = CpuDescriptor {
                apic_id: cpu.apic_id as u32,
                processor_id: cpu.processor_id as u32,
                is_bsp: cpu.apic_id as u32 == bsp_apic_id,
                apic_timer_ticks: 0,
            };
            self.count += 1;
        }
    }

    /// Build the MP-info mirror: every non-BSP CPU gets `entry`, with
    /// its own slot address as the argument.
    pub fn build_mp_info(&mut self, entry: fn(&MpInfo)) {
        for i in 0..self.count {
            let cpu = self.cpus[i];
            self.mp_info[i] = MpInfo {
                processor_id: cpu.processor_id,
                lapic_id: cpu.apic_id,
                entry: if cpu.is_bsp { None } else { Some(entry) },
                argument: 0,
            };
        }
    }
}

pub static CPUS: Mutex<CpuTable> = Mutex::new(CpuTable::new());

/// CPUs running, BSP included. APs increment this from `ap_entry`.
pub static STARTED_COUNT: AtomicU32 = AtomicU32::new(1);

pub fn started_count() -> u32 {
    STARTED_COUNT.load(Ordering::SeqCst)
}

/// Record LAPIC-timer calibration for the CPU with `apic_id`.
pub fn set_timer_ticks(apic_id: u32, ticks: u32) {
    let mut table = CPUS.lock();
    for i in 0..table.count {
        if table.cpus[i].apic_id == apic_id {
            table.cpus[i].apic_timer_ticks = ticks;
            return;
        }
    }
}

/// Patch the far-jump instruction inside a trampoline copy:
/// `66 EA <target32> <selector16>`.
pub fn patch_far_jump(trampoline: &mut [u8], instr_offset: usize, target: u32, selector: u16) {
    trampoline[instr_offset] = 0x66;
    trampoline[instr_offset + 1] = 0xEA;
    trampoline[instr_offset + 2..instr_offset + 6].copy_from_slice(&target.to_le_bytes());
    trampoline[instr_offset + 6..instr_offset + 8].copy_from_slice(&selector.to_le_bytes());
}

// The 16-bit entry the SIPI lands on, its protected-mode continuation,
// and the long-mode hop to `ap_entry`. Patch slots for CR3, the stack
// pointer, and the entry address sit at the end of the blob.
#[cfg(target_os = "none")]
core::arch::global_asm!(
    r#"
.section .text.ap_trampoline, "ax"
.code16
.global ap_trampoline_start
ap_trampoline_start:
    cli
    xor ax, ax
    mov ds, ax
    // The descriptor base fits in 24 bits (the copy lives at 0x7000),
    // so the 16-bit lgdt form is sufficient.
    lgdt [0x7000 + ap_tramp_gdt_desc - ap_trampoline_start]

    mov eax, cr0
    or eax, 1
    mov cr0, eax

.global ap_trampoline_jmp_instr
ap_trampoline_jmp_instr:
    // Rewritten at copy time with `66 EA <phys of ap_trampoline_pm> 0x08`.
    .byte 0x66, 0xEA
    .long 0
    .word 0x08

.align 16
ap_tramp_gdt:
    .quad 0x0000000000000000        // null
    .quad 0x00CF9A000000FFFF        // 0x08: 32-bit code
    .quad 0x00CF92000000FFFF        // 0x10: data
    .quad 0x00AF9A000000FFFF        // 0x18: 64-bit code
ap_tramp_gdt_desc:
    .word ap_tramp_gdt_desc - ap_tramp_gdt - 1
    .long 0x7000 + ap_tramp_gdt - ap_trampoline_start

.code32
.global ap_trampoline_pm
ap_trampoline_pm:
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov ss, ax

    mov eax, cr4
    or eax, 1 << 5                  // PAE
    mov cr4, eax

    mov eax, [0x7000 + ap_trampoline_cr3 - ap_trampoline_start]
    mov cr3, eax

    mov ecx, 0xC0000080             // EFER
    rdmsr
    or eax, 1 << 8                  // LME
    wrmsr

    mov eax, cr0
    or eax, 1 << 31                 // PG
    mov cr0, eax

    push 0x18
    push 0x7000 + ap_trampoline_long - ap_trampoline_start
    retf

.code64
ap_trampoline_long:
    mov rsp, [0x7000 + ap_trampoline_stack - ap_trampoline_start]
    mov rax, [0x7000 + ap_trampoline_entry - ap_trampoline_start]
    jmp rax

.align 8
.global ap_trampoline_cr3
ap_trampoline_cr3:
    .long 0
.align 8
.global ap_trampoline_stack
ap_trampoline_stack:
    .quad 0
.global ap_trampoline_entry
ap_trampoline_entry:
    .quad 0
.global ap_trampoline_end
ap_trampoline_end:
"#
);

#[cfg(target_os = "none")]
extern "C" {
    static ap_trampoline_start: u8;
    static ap_trampoline_jmp_instr: u8;
    static ap_trampoline_pm: u8;
    static ap_trampoline_cr3: u8;
    static ap_trampoline_stack: u8;
    static ap_trampoline_entry: u8;
    static ap_trampoline_end: u8;
}


/// Copy and patch the trampoline, then wake every non-BSP CPU with
/// INIT-SIPI-SIPI, polling the started counter and falling back to a
/// broadcast SIPI when an AP stays silent.
#[cfg(target_os = "none")]
pub fn start_aps() {
    use super::apic::{apic, IPI_OTHERS};
    use super::timer::wait_ms;

    // SAFETY: symbol addresses of the trampoline blob linked into the
    // kernel image.
    let (blob_base, jmp_off, pm_off, cr3_off, stack_off, entry_off, blob_len) = unsafe {
        let base = &ap_trampoline_start as *const u8 as usize;
        (
            base,
            &ap_trampoline_jmp_instr as *const u8 as usize - base,
            &ap_trampoline_pm as *const u8 as usize - base,
            &ap_trampoline_cr3 as *const u8 as usize - base,
            &ap_trampoline_stack as *const u8 as usize - base,
            &ap_trampoline_entry as *const u8 as usize - base,
            &ap_trampoline_end as *const u8 as usize - base,
        )
    };

    // SAFETY: 0x7000 is inside the reserved low 1 MiB, covered by the
    // HHDM and never handed out by the PMM.
    let dest: &mut [u8] = unsafe {
        core::slice::from_raw_parts_mut(crate::mm::phys_to_virt(TRAMPOLINE_PHYS), blob_len)
    };
    // SAFETY: the blob is plain bytes in the kernel image.
    unsafe {
        core::ptr::copy_nonoverlapping(blob_base as *const u8, dest.as_mut_ptr(), blob_len);
    }

    patch_far_jump(dest, jmp_off, (TRAMPOLINE_PHYS as u32) + pm_off as u32, 0x08);
    dest[cr3_off..cr3_off + 4]
        .copy_from_slice(&(crate::mm::vmm::pml4_phys() as u32).to_le_bytes());
    dest[entry_off..entry_off + 8].copy_from_slice(&(ap_entry as usize as u64).to_le_bytes());

    let vector = (TRAMPOLINE_PHYS >> 12) as u32 & 0xFF;
    log::info!(
        "[SMP] trampoline ({} bytes) at {:#x}, SIPI vector {:#04x}",
        blob_len,
        TRAMPOLINE_PHYS,
        vector
    );

    let cpu_count = CPUS.lock().count;
    for i in 0..cpu_count {
        let cpu = CPUS.lock().cpus[i];
        if cpu.is_bsp {
            continue;
        }

        // One fresh stack frame per AP; written into the shared slot
        // before its SIPIs, safe because APs are started one at a time.
        let Some(stack_phys) = crate::mm::pmm::alloc_frame() else {
            log::error!("[SMP] no frame for AP {} stack, skipping", cpu.apic_id);
            continue;
        };
        let stack_top = crate::mm::hhdm_base() + stack_phys + 4096;
        dest[stack_off..stack_off + 8].copy_from_slice(&stack_top.to_le_bytes());

        log::info!("[SMP] starting AP {} (APIC ID {})", i, cpu.apic_id);

        // INIT assert, deassert, then two SIPIs.
        let init_assert = (5 << 8) | (1 << 14) | (1 << 15);
        apic().ipi(cpu.apic_id, init_assert, 0);
        wait_ms(10);
        apic().ipi(cpu.apic_id, 5 << 8, 0);
        wait_ms(10);

        let sipi = (6 << 8) | vector;
        apic().ipi(cpu.apic_id, sipi, 0);
        wait_ms(5);
        apic().ipi(cpu.apic_id, sipi, 0);

        let before = started_count();
        let mut started = false;
        for _ in 0..400 {
            wait_ms(1);
            if started_count() > before {
                started = true;
                break;
            }
        }

        if started {
            log::info!(
                "[SMP] APIC {} started (running={})",
                cpu.apic_id,
                started_count()
            );
        } else {
            log::warn!("[SMP] APIC {} silent, trying broadcast SIPI", cpu.apic_id);
            apic().ipi(0, sipi | IPI_OTHERS, 0);
            for _ in 0..200 {
                wait_ms(1);
                if started_count() > before {
                    started = true;
                    break;
                }
            }
            if !started {
                log::error!("[SMP] broadcast SIPI failed for APIC {}", cpu.apic_id);
            }
        }
    }
}

/// Default AP entry: report in and halt.
pub fn ap_park(info: &MpInfo) {
    log::info!(
        "[SMP] CPU online: processor {} LAPIC {}",
        info.processor_id,
        info.lapic_id
    );
    crate::arch::halt_loop();
}

/// First Rust code an AP executes, entered from the trampoline in long
/// mode with a private stack.
#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn ap_entry() -> ! {
    crate::arch::x86_64::enable_sse();
    STARTED_COUNT.fetch_add(1, Ordering::SeqCst);

    let lapic = super::apic::apic().id();

    let info = {
        let table = CPUS.lock();
        (0..table.count)
            .map(|i| table.mp_info[i])
            .find(|mp| mp.lapic_id == lapic)
    };

    match info {
        Some(info) => {
            super::gdt::init();
            super::idt::reload();
            if let Some(entry) = info.entry {
                entry(&info);
            }
            log::warn!("[SMP] AP {} entry returned; halting", lapic);
        }
        None => {
            log::error!("[SMP] no MP info for LAPIC {}; halting", lapic);
        }
    }
    crate::arch::halt_loop();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::arch::x86_64::acpi::CpuInfo;

    fn madt_with_cpus(cpus: &[(u8, u8, bool)]) -> MadtInfo {
        MadtInfo {
            lapic_addr: 0xFEE0_0000,
            ioapics: vec![],
            overrides: vec![],
            cpus: cpus
                .iter()
                .map(|&(proc_id, apic_id, enabled)| CpuInfo {
                    processor_id: proc_id,
                    apic_id,
                    enabled,
                    online_capable: false,
                })
                .collect(),
        }
    }

    #[test]
    fn populate_keeps_enabled_cpus_and_marks_the_bsp() {
        let madt = madt_with_cpus(&[(0, 0, true), (1, 1, true), (2, 2, false), (3, 3, true)]);
        let mut table = CpuTable::new();
        table.populate(&madt, 0);
        assert_eq!(table.count, 3);
        assert!(table.cpus[0].is_bsp);
        assert!(!table.cpus[1].is_bsp);
        assert_eq!(table.cpus[2].apic_id, 3);
    }

    #[test]
    fn mp_info_assigns_entries_to_aps_only() {
        let madt = madt_with_cpus(&[(0, 0, true), (1, 1, true)]);
        let mut table = CpuTable::new();
        table.populate(&madt, 0);
        table.build_mp_info(ap_park);
        assert!(table.mp_info[0].entry.is_none(), "BSP has no AP entry");
        assert!(table.mp_info[1].entry.is_some());
        assert_eq!(table.mp_info[1].lapic_id, 1);
    }

    #[test]
    fn far_jump_patch_encodes_target_and_selector() {
        let mut blob = vec![0u8; 32];
        patch_far_jump(&mut blob, 4, 0x7040, 0x08);
        assert_eq!(&blob[4..12], &[0x66, 0xEA, 0x40, 0x70, 0, 0, 0x08, 0]);
    }

    #[test]
    fn sipi_vector_is_the_trampoline_page() {
        assert_eq!((TRAMPOLINE_PHYS >> 12) & 0xFF, 0x07);
    }
}
