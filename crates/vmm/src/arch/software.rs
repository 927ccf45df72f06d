//! Software emulation backend for testing and development.
//!
//! Physical memory is a page-aligned host buffer standing in for a contiguous RAM bank at an
//! arbitrary physical base, so tests can use realistic addresses such as `0x8000_0000`.
//! Activation does not touch hardware; the last loaded `satp` value and the number of TLB
//! flushes are recorded per thread so tests can observe them.

use core::cell::Cell;

use std::alloc::{Layout, alloc_zeroed, dealloc};

use super::PAGE_SIZE;

/// Emulated physical memory for software simulation.
pub struct EmulatedMemory {
    /// Physical address of the first byte of the buffer.
    base: usize,
    /// The underlying memory buffer.
    memory: *mut u8,
    /// Size of the buffer in bytes.
    size: usize,
}

impl EmulatedMemory {
    /// Creates a new emulated RAM bank of `size` bytes at physical address `base`.
    ///
    /// # Panics
    /// Panics if `base` or `size` is not page-aligned, or `size` is zero.
    pub fn new(base: usize, size: usize) -> Self {
        assert!(base % PAGE_SIZE == 0, "emulated memory base must be page-aligned");
        assert!(
            size > 0 && size % PAGE_SIZE == 0,
            "emulated memory size must be a non-zero multiple of the page size"
        );
        let layout = Self::layout(size);
        // SAFETY: The layout has a non-zero size.
        let memory = unsafe { alloc_zeroed(layout) };
        assert!(!memory.is_null(), "failed to allocate emulated memory");
        Self { base, memory, size }
    }

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size, PAGE_SIZE).expect("valid emulated memory layout")
    }

    /// Translates a physical address to a host pointer into the buffer.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(
            phys >= self.base && phys < self.base + self.size,
            "physical address {phys:#x} out of bounds"
        );
        // SAFETY: The offset was checked against the size of the allocation.
        unsafe { self.memory.add(phys - self.base) }
    }

    /// Translates a host pointer back to a physical address.
    pub fn ptr_to_phys(&self, ptr: *const u8) -> usize {
        let start = self.memory as usize;
        let addr = ptr as usize;
        assert!(
            addr >= start && addr < start + self.size,
            "pointer not within emulated memory"
        );
        self.base + (addr - start)
    }

}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: `memory` was allocated in `new` with this exact layout.
        unsafe { dealloc(self.memory, Self::layout(self.size)) };
    }
}

std::thread_local! {
    static ACTIVE_SATP: Cell<Option<usize>> = const { Cell::new(None) };
    static TLB_FLUSHES: Cell<usize> = const { Cell::new(0) };
}

/// Records `satp_value` as the active root and counts one TLB flush.
///
/// # Safety
/// Always safe in emulation; the signature matches the hardware backend.
pub unsafe fn activate(satp_value: usize) {
    ACTIVE_SATP.with(|satp| satp.set(Some(satp_value)));
    TLB_FLUSHES.with(|count| count.set(count.get() + 1));
}

/// Returns the `satp` value most recently loaded on this thread.
pub fn active_satp() -> Option<usize> {
    ACTIVE_SATP.with(Cell::get)
}

/// Returns how many TLB flushes this thread has performed.
pub fn tlb_flushes() -> usize {
    TLB_FLUSHES.with(Cell::get)
}
