#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]
#![feature(step_trait)]

//! # Sv39 Virtual Memory Manager (VMM)
//!
//! The virtual memory core of a small RISC-V kernel. It provides:
//!
//! - A LIFO free-list allocator for physical page frames.
//! - A three-level Sv39 page table walker with map, unmap, translate and teardown.
//! - The kernel address space, identity mapped once at boot.
//! - Per-process address spaces made of a user table and a kernel shadow table.
//! - Copying bytes and strings between kernel buffers and user virtual addresses.
//! - Software emulation for testing in non-kernel environments.
//!
//! Boot order is: set the [`AddressTranslator`], then call [`init`] with the board's
//! [`KernelLayout`]. Everything else hangs off the returned [`KernelSpace`].

mod address;
mod address_space;
pub mod arch;
mod entry;
mod error;
mod flags;
mod frame;
mod frame_allocator;
pub mod kernel_space;
mod layout;
mod numbers;
mod page_directory;
mod table;
mod user_copy;

#[cfg(test)]
mod testing;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::AddressSpace;
pub use entry::{EntryKind, PageEntry};
pub use error::VmError;
pub use flags::PteFlags;
pub use frame::Frame;
pub use frame_allocator::{ALLOC_POISON, AllocError, FREE_POISON, FrameAllocator};
pub use kernel_space::KernelSpace;
pub use layout::{DeviceWindow, KernelLayout, QEMU_VIRT_DEVICES, TRAMPOLINE, USER_SLOT_END};
pub use numbers::{FrameNumber, PageNumber};
pub use page_directory::{PageDirectory, PageTableDump};
pub use table::PageTable;
pub use user_copy::{CopyError, copy_from_user, copy_string_from_user, copy_to_user};

pub use arch::{MAX_VIRTUAL, PAGE_SIZE};

/// Brings up physical and virtual memory.
///
/// Hands every frame in `[layout.kernel_end, layout.phys_top)` to the frame allocator, then
/// builds and installs the global kernel address space. The [`AddressTranslator`] must already
/// be set. The kernel table is not activated; call [`KernelSpace::activate`] on each hart.
///
/// # Panics
///
/// Panics if called more than once, or if the layout is inconsistent.
pub fn init(layout: KernelLayout) -> Result<&'static KernelSpace, VmError> {
    FrameAllocator::init(layout.kernel_end, layout.phys_top);
    kernel_space::init(layout)
}
