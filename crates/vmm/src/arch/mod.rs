//! Sv39 paging constants and the architecture backends.
//!
//! The page-table format is identical for every backend; only physical memory access and
//! activation differ. On riscv64 kernels activation writes `satp` and fences the TLB. Under
//! tests (or with the `software-emulation` feature) physical memory is a host buffer and
//! activation is recorded instead of performed.

// NOTE: We DO include the hardware module during tests on riscv64 so that rust-analyzer can see it.
#[cfg(target_arch = "riscv64")]
mod riscv64;
#[cfg(all(target_arch = "riscv64", not(test), not(feature = "software-emulation")))]
pub use riscv64::activate;

#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;

/// Other targets can build and inspect page tables but have no MMU to load them into.
///
/// # Safety
/// Never returns.
#[cfg(all(not(target_arch = "riscv64"), not(test), not(feature = "software-emulation")))]
pub unsafe fn activate(satp_value: usize) {
    panic!("activate: no Sv39 MMU on this target (satp {satp_value:#x})");
}

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Number of bits in the in-page offset.
pub const PAGE_SHIFT: usize = 12;

/// Number of entries in one page table (9-bit index).
pub const ENTRY_COUNT: usize = 512;

/// Number of page table levels in Sv39 (level 2 is the root, level 0 holds leaves).
pub const PAGE_TABLE_LEVELS: usize = 3;

/// Maximum number of bits in a physical address under Sv39.
pub const MAX_PHYSICAL_BITS: usize = 56;

/// One past the highest usable virtual address.
///
/// Sv39 allows 39 bits, but addresses with bit 38 set would have to be sign-extended. We only
/// use the lower half so that no address ever needs sign extension.
pub const MAX_VIRTUAL: usize = 1 << (9 + 9 + 9 + PAGE_SHIFT - 1);

/// `satp.MODE` value selecting Sv39 translation.
pub const SATP_MODE_SV39: usize = 8;

/// Returns the page table index for a given virtual address at the specified level.
///
/// - Level 0: Bits 12-20 (leaf table)
/// - Level 1: Bits 21-29
/// - Level 2: Bits 30-38 (root)
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "level out of range for Sv39 (0-2)");
    let shift = PAGE_SHIFT + (level * 9);
    (address >> shift) & (ENTRY_COUNT - 1)
}

/// Returns the number of bytes covered by one entry at the given level.
#[inline]
pub const fn level_span(level: usize) -> usize {
    PAGE_SIZE << (level * 9)
}

/// Validates a physical address for Sv39.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr >> MAX_PHYSICAL_BITS == 0
}

/// Rounds a byte count or address up to the next page boundary.
#[inline]
pub const fn page_round_up(value: usize) -> usize {
    (value + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Rounds a byte count or address down to a page boundary.
#[inline]
pub const fn page_round_down(value: usize) -> usize {
    value & !(PAGE_SIZE - 1)
}

/// Builds the `satp` value selecting Sv39 with the given root frame number and ASID 0.
#[inline]
pub const fn make_satp(root_frame: usize) -> usize {
    (SATP_MODE_SV39 << 60) | root_frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexes_each_level() {
        // 0b000000001_000000010_000000011 followed by a 12-bit offset
        let va = (1 << 30) | (2 << 21) | (3 << 12) | 0x45;
        assert_eq!(page_index(va, 2), 1);
        assert_eq!(page_index(va, 1), 2);
        assert_eq!(page_index(va, 0), 3);
    }

    #[test]
    fn trampoline_lives_in_last_root_slot() {
        let top_page = MAX_VIRTUAL - PAGE_SIZE;
        assert_eq!(page_index(top_page, 2), 255);
        assert_eq!(page_index(top_page, 1), 511);
        assert_eq!(page_index(top_page, 0), 511);
    }

    #[test]
    fn rounds_to_pages() {
        assert_eq!(page_round_up(0), 0);
        assert_eq!(page_round_up(1), PAGE_SIZE);
        assert_eq!(page_round_up(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(page_round_down(PAGE_SIZE + 7), PAGE_SIZE);
    }

    #[test]
    fn level_spans() {
        assert_eq!(level_span(0), 4096);
        assert_eq!(level_span(1), 2 * 1024 * 1024);
        assert_eq!(level_span(2), 1024 * 1024 * 1024);
    }

    #[test]
    fn satp_encodes_mode_and_root() {
        assert_eq!(make_satp(0x80000), (8 << 60) | 0x80000);
    }
}
