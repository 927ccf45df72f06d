//! Boot-time memory layout.
//!
//! The kernel binary describes the board to this crate with a [`KernelLayout`]: where the
//! devices are, where its own image lives, where RAM ends and which frame holds the
//! trampoline code.

use crate::{
    PhysicalAddress, VirtualAddress,
    arch::{self, MAX_VIRTUAL, PAGE_SIZE},
};

/// Virtual address of the trampoline page: the highest page below [`MAX_VIRTUAL`], mapped
/// at the same address in the kernel and in every user table.
pub const TRAMPOLINE: VirtualAddress = VirtualAddress::new(MAX_VIRTUAL - PAGE_SIZE);

/// End of the range covered by root slot 0.
///
/// User memory and the shadow-table device mirrors live below this address. Every other
/// root slot of a shadow table is shared with the kernel table.
pub const USER_SLOT_END: usize = arch::level_span(2);

/// A memory-mapped device register window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceWindow {
    /// Short name used in log messages.
    pub name: &'static str,
    /// Physical address of the first register; the window is identity mapped.
    pub base: PhysicalAddress,
    /// Length of the window in bytes.
    pub size: usize,
    /// Whether the window is also identity mapped in each process's shadow table.
    pub shadowed: bool,
}

impl DeviceWindow {
    pub const fn new(name: &'static str, base: usize, size: usize, shadowed: bool) -> Self {
        Self {
            name,
            base: PhysicalAddress::new(base),
            size,
            shadowed,
        }
    }

    /// Number of pages the window spans.
    pub const fn pages(&self) -> usize {
        arch::page_round_up(self.size) / PAGE_SIZE
    }

    /// The window's identity-mapped virtual address.
    pub const fn virtual_base(&self) -> VirtualAddress {
        VirtualAddress::new(self.base.as_usize())
    }

    /// One past the last byte of the window.
    pub const fn end(&self) -> usize {
        self.base.as_usize() + self.size
    }
}

/// Device windows of the QEMU `virt` board.
///
/// The CLINT sits at 32 MiB, inside the range user memory may grow into, so it is only
/// reachable through the kernel table.
pub const QEMU_VIRT_DEVICES: &[DeviceWindow] = &[
    DeviceWindow::new("uart0", 0x1000_0000, PAGE_SIZE, true),
    DeviceWindow::new("virtio0", 0x1000_1000, PAGE_SIZE, true),
    DeviceWindow::new("clint", 0x0200_0000, 0x1_0000, false),
    DeviceWindow::new("plic", 0x0c00_0000, 0x40_0000, true),
];

/// Physical memory layout handed over by the boot code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelLayout {
    pub devices: &'static [DeviceWindow],
    /// First byte of the kernel image (start of text).
    pub kernel_base: PhysicalAddress,
    /// End of kernel text; page-aligned by the linker script.
    pub kernel_text_end: PhysicalAddress,
    /// End of the kernel image; free RAM starts here.
    pub kernel_end: PhysicalAddress,
    /// One past the last byte of RAM.
    pub phys_top: PhysicalAddress,
    /// Frame holding the trampoline code.
    pub trampoline: PhysicalAddress,
}

impl KernelLayout {
    /// Load address of the kernel on QEMU `virt`.
    pub const QEMU_KERNEL_BASE: usize = 0x8000_0000;

    /// Amount of RAM the kernel assumes on QEMU `virt`.
    pub const QEMU_RAM_SIZE: usize = 128 * 1024 * 1024;

    /// The QEMU `virt` layout, given the linker-provided image boundaries.
    pub const fn qemu_virt(
        kernel_text_end: PhysicalAddress,
        kernel_end: PhysicalAddress,
        trampoline: PhysicalAddress,
    ) -> Self {
        Self {
            devices: QEMU_VIRT_DEVICES,
            kernel_base: PhysicalAddress::new(Self::QEMU_KERNEL_BASE),
            kernel_text_end,
            kernel_end,
            phys_top: PhysicalAddress::new(Self::QEMU_KERNEL_BASE + Self::QEMU_RAM_SIZE),
            trampoline,
        }
    }

    /// Device windows mirrored into shadow tables.
    pub fn shadowed_devices(&self) -> impl Iterator<Item = &DeviceWindow> + '_ {
        self.devices.iter().filter(|window| window.shadowed)
    }

    /// Largest size a user address space may reach: the lowest shadowed device window, or
    /// the end of root slot 0 if nothing is shadowed.
    pub fn user_limit(&self) -> usize {
        self.shadowed_devices()
            .map(|window| window.base.as_usize())
            .fold(USER_SLOT_END, usize::min)
    }

    /// Checks the layout for consistency.
    ///
    /// # Panics
    /// Panics if the image boundaries are out of order or misaligned, if the kernel image
    /// shares root slot 0 with user memory, or if a shadowed window lies outside slot 0.
    pub fn validate(&self) {
        assert!(
            self.kernel_base <= self.kernel_text_end
                && self.kernel_text_end <= self.kernel_end
                && self.kernel_end <= self.phys_top,
            "layout: kernel image boundaries out of order"
        );
        assert!(
            self.kernel_base.is_aligned(PAGE_SIZE) && self.kernel_text_end.is_aligned(PAGE_SIZE),
            "layout: kernel text must be page-aligned"
        );
        assert!(
            self.trampoline.is_aligned(PAGE_SIZE),
            "layout: trampoline frame must be page-aligned"
        );
        assert!(
            self.kernel_base.as_usize() >= USER_SLOT_END,
            "layout: kernel image must lie above the user root slot"
        );
        assert!(
            self.phys_top.as_usize() <= TRAMPOLINE.as_usize(),
            "layout: physical memory overlaps the trampoline"
        );
        for window in self.devices {
            assert!(
                window.size > 0 && window.base.is_aligned(PAGE_SIZE),
                "layout: device window {} must be page-aligned and non-empty",
                window.name
            );
            if window.shadowed {
                assert!(
                    window.end() <= USER_SLOT_END,
                    "layout: shadowed window {} outside the user root slot",
                    window.name
                );
            }
        }
    }
}
