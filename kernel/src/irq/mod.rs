//! IRQ dispatch and capture
//!
//! The legacy PICs are remapped so IRQs 0..15 arrive on vectors 32..47.
//! The IRQ bridge records `(vector, RIP)` for the most recent delivery of
//! each line into a fixed log and acknowledges the PIC. Handlers never
//! allocate; the log is plain atomics so recording is safe in interrupt
//! context.

use core::sync::atomic::{AtomicU64, Ordering};

#[cfg(target_os = "none")]
use pic8259::ChainedPics;
#[cfg(target_os = "none")]
use spin::Mutex;

/// Vector base for the master PIC (IRQ 0..7 -> 32..39).
pub const PIC_1_OFFSET: u8 = 32;
/// Vector base for the slave PIC (IRQ 8..15 -> 40..47).
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// Number of legacy IRQ lines.
pub const IRQ_LINES: usize = 16;

#[cfg(target_os = "none")]
pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Captured record of the last delivery on one IRQ line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqRecord {
    pub vector: u8,
    pub rip: u64,
}

// Slot i holds the vector (0 = never fired) and RIP of IRQ line i.
static IRQ_VECTOR: [AtomicU64; IRQ_LINES] = [const { AtomicU64::new(0) }; IRQ_LINES];
static IRQ_RIP: [AtomicU64; IRQ_LINES] = [const { AtomicU64::new(0) }; IRQ_LINES];

/// Remap the PICs to vectors 32..47 and unmask them.
#[cfg(target_os = "none")]
pub fn init() {
    // SAFETY: the ICW1..ICW4 sequence on ports 0x20/0x21/0xA0/0xA1 is the
    // architected remap procedure; offsets 32/40 keep IRQs clear of the
    // exception vectors. The mask leaves the PIT (IRQ0) and the cascade
    // line (IRQ2) open.
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        pics.write_masks(0b1111_1010, 0b1111_1111);
    }
    log::info!(
        "[IRQ] PIC remapped to vectors {}..{}",
        PIC_1_OFFSET,
        PIC_1_OFFSET + IRQ_LINES as u8 - 1
    );
}

/// Record an IRQ delivery. Called from the vector 32..47 bridge handlers.
pub fn record(vector: u8, rip: u64) {
    if (PIC_1_OFFSET..PIC_1_OFFSET + IRQ_LINES as u8).contains(&vector) {
        let idx = (vector - PIC_1_OFFSET) as usize;
        IRQ_VECTOR[idx].store(vector as u64, Ordering::Relaxed);
        IRQ_RIP[idx].store(rip, Ordering::Relaxed);
    }
}

/// The last captured record for IRQ line `line`, if it ever fired.
pub fn last_record(line: usize) -> Option<IrqRecord> {
    if line >= IRQ_LINES {
        return None;
    }
    let vector = IRQ_VECTOR[line].load(Ordering::Relaxed);
    if vector == 0 {
        return None;
    }
    Some(IrqRecord {
        vector: vector as u8,
        rip: IRQ_RIP[line].load(Ordering::Relaxed),
    })
}

/// Acknowledge an IRQ at the PIC.
#[cfg(target_os = "none")]
pub fn eoi(vector: u8) {
    // SAFETY: the vector was delivered through these PICs; signalling EOI
    // for it is the required acknowledgement.
    unsafe {
        PICS.lock().notify_end_of_interrupt(vector);
    }
}
