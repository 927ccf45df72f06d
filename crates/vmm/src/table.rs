//! One level of an Sv39 page table.

use crate::{arch::ENTRY_COUNT, entry::PageEntry};

/// A page table: 512 entries filling exactly one physical frame.
///
/// Tables are never constructed on the stack or heap; they only ever exist inside frames
/// obtained from the frame allocator, viewed through [`AddressTranslator`](crate::AddressTranslator).
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; ENTRY_COUNT],
}

const _: () = assert!(core::mem::size_of::<PageTable>() == crate::arch::PAGE_SIZE);

impl PageTable {
    /// Returns the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 512.
    pub fn entry(&self, index: usize) -> PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        self.entries[index]
    }

    /// Returns a mutable reference to the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 512.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        &mut self.entries[index]
    }

    /// Returns an iterator over `(index, entry)` for every valid entry.
    pub fn valid_entries(&self) -> impl Iterator<Item = (usize, PageEntry)> + '_ {
        self.entries
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, entry)| entry.is_valid())
    }

    /// Returns true if no entry is valid.
    pub fn is_empty(&self) -> bool {
        self.valid_entries().next().is_none()
    }
}
