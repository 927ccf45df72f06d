//! Sv39 page table entries.

use core::fmt;

use crate::{FrameNumber, PhysicalAddress, flags::PteFlags};

/// A single Sv39 page table entry.
///
/// The entry format:
/// - Bits 0-7: Flags (V, R, W, X, U, G, A, D)
/// - Bits 8-9: Reserved for software
/// - Bits 10-53: Physical frame number
/// - Bits 54-63: Reserved (must be zero)
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageEntry(u64);

/// The decoded meaning of a [`PageEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Nothing is mapped here.
    Invalid,
    /// Points at the next-level page table.
    Table(PhysicalAddress),
    /// Maps a data frame with the given flags (`VALID` included).
    Leaf(PhysicalAddress, PteFlags),
}

impl PageEntry {
    /// Number of low bits occupied by flags and software bits.
    const PPN_SHIFT: u32 = 10;

    /// Mask of the 44-bit frame number once shifted down.
    const PPN_MASK: u64 = (1 << 44) - 1;

    /// Flag bits mask (bits 0-9).
    const FLAGS_MASK: u64 = (1 << Self::PPN_SHIFT) - 1;

    /// An entry with every bit clear.
    pub const INVALID: Self = Self(0);

    /// Creates a leaf entry mapping `address` with `flags`.
    ///
    /// # Panics
    /// Panics if `address` is not page-aligned or `flags` holds none of R/W/X.
    pub fn leaf(address: PhysicalAddress, flags: PteFlags) -> Self {
        assert!(
            flags.is_leaf_permission(),
            "leaf entry needs at least one of R/W/X"
        );
        Self::encode(address, flags | PteFlags::VALID)
    }

    /// Creates an entry pointing at the next-level table stored at `address`.
    pub fn table(address: PhysicalAddress) -> Self {
        Self::encode(address, PteFlags::VALID)
    }

    fn encode(address: PhysicalAddress, flags: PteFlags) -> Self {
        debug_assert!(
            address.page_offset() == 0,
            "physical address must be page-aligned"
        );
        let ppn = address.frame_number().as_usize() as u64;
        Self((ppn << Self::PPN_SHIFT) | (flags.bits() & Self::FLAGS_MASK))
    }

    /// Decodes this entry.
    pub fn kind(self) -> EntryKind {
        let flags = self.flags();
        if !flags.contains(PteFlags::VALID) {
            EntryKind::Invalid
        } else if flags.is_leaf_permission() {
            EntryKind::Leaf(self.address(), flags)
        } else {
            EntryKind::Table(self.address())
        }
    }

    /// Returns the physical address stored in this entry, whatever its kind.
    pub fn address(self) -> PhysicalAddress {
        FrameNumber::new(((self.0 >> Self::PPN_SHIFT) & Self::PPN_MASK) as usize).start()
    }

    /// Returns the flags for this entry.
    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & Self::FLAGS_MASK)
    }

    /// Returns whether this entry is valid.
    pub fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::VALID)
    }

    /// Clears this entry (sets it to zero).
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Returns the raw value of this entry.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Creates an entry from a raw value.
    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }
}

impl Default for PageEntry {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageEntry({:#018x}, {:?})", self.0, self.kind())
    }
}
