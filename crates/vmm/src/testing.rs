//! Emulated machines for unit tests.
//!
//! Every test runs on its own thread, and the translator, frame allocator and kernel space
//! are thread-local under `cfg(test)`, so each test gets a fresh machine.

use crate::{
    AddressTranslator, FrameAllocator, KernelLayout, KernelSpace, PhysicalAddress,
    arch::PAGE_SIZE,
};

/// Physical address of the first byte of emulated RAM.
pub const RAM_BASE: usize = 0x8000_0000;

/// Backs `frames` pages of RAM at [`RAM_BASE`] with host memory.
pub fn emulate_ram(frames: usize) {
    AddressTranslator::set_current(AddressTranslator::emulated(RAM_BASE, frames * PAGE_SIZE));
}

/// Physical address of the `index`th frame of emulated RAM.
pub fn ram_frame(index: usize) -> PhysicalAddress {
    PhysicalAddress::new(RAM_BASE + index * PAGE_SIZE)
}

/// Emulates `frames` pages of RAM and hands all of them to the frame allocator.
pub fn setup_allocator(frames: usize) -> &'static FrameAllocator {
    emulate_ram(frames);
    FrameAllocator::init(ram_frame(0), ram_frame(frames))
}

/// A QEMU `virt` layout with `frames` pages of RAM: one page of kernel text that also holds
/// the trampoline, one page of kernel data, and the rest free.
pub fn test_layout(frames: usize) -> KernelLayout {
    KernelLayout {
        phys_top: ram_frame(frames),
        ..KernelLayout::qemu_virt(ram_frame(1), ram_frame(2), ram_frame(0))
    }
}

/// Emulates `frames` pages of RAM and boots the memory subsystem on it.
pub fn boot(frames: usize) -> &'static KernelSpace {
    emulate_ram(frames);
    match crate::init(test_layout(frames)) {
        Ok(kernel) => kernel,
        Err(err) => panic!("boot failed: {err}"),
    }
}
