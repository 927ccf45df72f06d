//! riscv64 hardware backend.

use riscv::register::satp::{self, Mode};

/// Loads a root page table into `satp` and flushes the local TLB.
///
/// # Safety
/// The caller must ensure:
/// - The table identity-maps the code currently executing and the kernel stack
/// - The table maps the trampoline at its fixed address
/// - No other hart is relying on this hart's stale translations
pub unsafe fn activate(satp_value: usize) {
    let root_frame = satp_value & ((1 << 44) - 1);
    // SAFETY: Caller guarantees the table is a valid Sv39 root.
    unsafe {
        satp::set(Mode::Sv39, 0, root_frame);
        riscv::asm::sfence_vma_all();
    }
}
