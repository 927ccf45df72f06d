//! Owned physical frames.

use core::fmt;

use crate::{AddressTranslator, PhysicalAddress, arch::PAGE_SIZE};

/// Exclusive ownership of one physical page frame.
///
/// A `Frame` is produced by [`FrameAllocator::allocate`](crate::FrameAllocator::allocate) and
/// consumed by [`FrameAllocator::free`](crate::FrameAllocator::free). While a frame is installed
/// in a page table the table owns it; [`Frame::into_address`] hands ownership over and
/// [`Frame::from_address`] takes it back. Dropping a `Frame` leaks it.
#[must_use = "dropping a frame leaks it; return it with FrameAllocator::free"]
pub struct Frame(PhysicalAddress);

impl Frame {
    /// Reclaims ownership of the frame at `address`.
    ///
    /// # Safety
    /// `address` must be a page-aligned frame that was handed out by the frame allocator and
    /// that nothing else owns any more (typically it was just removed from a page table).
    /// Alignment is checked when the frame is returned to the allocator.
    pub unsafe fn from_address(address: PhysicalAddress) -> Self {
        Self(address)
    }

    /// Returns the physical address of the frame.
    pub fn address(&self) -> PhysicalAddress {
        self.0
    }

    /// Gives up ownership, returning the physical address for a page table to hold.
    pub fn into_address(self) -> PhysicalAddress {
        self.0
    }

    /// Returns the frame contents.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: We own the frame, and the translator maps the whole page.
        unsafe { page_bytes(self.0) }
    }

    /// Returns the frame contents mutably.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: We own the frame exclusively, and the translator maps the whole page.
        unsafe { page_bytes_mut(self.0) }
    }

    /// Fills the frame with zeroes.
    pub fn zero(&mut self) {
        self.fill(0);
    }

    /// Fills every byte of the frame with `byte`.
    pub fn fill(&mut self, byte: u8) {
        self.as_bytes_mut().fill(byte);
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({:#x})", self.0.as_usize())
    }
}

/// Views the page at `address` as bytes.
///
/// # Safety
/// The page must be backed by RAM reachable through the current translator, and nothing may
/// write to it for the lifetime of the returned slice.
pub(crate) unsafe fn page_bytes<'a>(address: PhysicalAddress) -> &'a [u8] {
    let ptr = AddressTranslator::current().phys_to_ptr::<u8>(address);
    // SAFETY: Caller guarantees the page is mapped and not concurrently written.
    unsafe { core::slice::from_raw_parts(ptr, PAGE_SIZE) }
}

/// Views the page at `address` as mutable bytes.
///
/// # Safety
/// The page must be backed by RAM reachable through the current translator, and the caller
/// must have exclusive access to it for the lifetime of the returned slice.
pub(crate) unsafe fn page_bytes_mut<'a>(address: PhysicalAddress) -> &'a mut [u8] {
    let ptr = AddressTranslator::current().phys_to_ptr::<u8>(address);
    // SAFETY: Caller guarantees exclusivity.
    unsafe { core::slice::from_raw_parts_mut(ptr, PAGE_SIZE) }
}
