//! The kernel address space.
//!
//! One table, built at boot and never modified afterwards. It identity maps every device
//! window, the kernel image and all remaining RAM, and maps the trampoline at the top of the
//! virtual address space. Shadow tables borrow its upper root slots by value.

use crate::{
    KernelLayout, PageDirectory, PhysicalAddress, TRAMPOLINE, VirtualAddress, VmError,
    arch::PAGE_SIZE, flags::PteFlags,
};

/// The kernel's page table together with the layout it was built from.
pub struct KernelSpace {
    directory: PageDirectory,
    layout: KernelLayout,
}

impl KernelSpace {
    /// Builds the kernel table for `layout`.
    ///
    /// Allocation failures are returned to the caller, which has nothing left to do but halt;
    /// tables built so far are not reclaimed.
    ///
    /// # Panics
    /// Panics if the layout fails [`KernelLayout::validate`].
    pub fn build(layout: KernelLayout) -> Result<Self, VmError> {
        layout.validate();

        let mut directory = PageDirectory::new()?;

        for window in layout.devices {
            log::debug!(
                "kernel: {} at {} ({} pages)",
                window.name,
                window.base,
                window.pages()
            );
            identity_map(&mut directory, window.base, window.size, PteFlags::READ_WRITE)?;
        }

        let text = layout.kernel_text_end - layout.kernel_base;
        log::debug!("kernel: text [{}, {})", layout.kernel_base, layout.kernel_text_end);
        identity_map(&mut directory, layout.kernel_base, text, PteFlags::READ_EXECUTE)?;

        let data = layout.phys_top - layout.kernel_text_end;
        log::debug!("kernel: data and RAM [{}, {})", layout.kernel_text_end, layout.phys_top);
        identity_map(&mut directory, layout.kernel_text_end, data, PteFlags::READ_WRITE)?;

        log::debug!("kernel: trampoline {} -> {}", TRAMPOLINE, layout.trampoline);
        directory.map(TRAMPOLINE, layout.trampoline, PAGE_SIZE, PteFlags::READ_EXECUTE)?;

        log::info!("kernel address space ready, root {}", directory.root());
        Ok(Self { directory, layout })
    }

    /// The kernel page table.
    pub fn directory(&self) -> &PageDirectory {
        &self.directory
    }

    /// The layout the table was built from.
    pub fn layout(&self) -> &KernelLayout {
        &self.layout
    }

    /// The `satp` value selecting the kernel table.
    pub fn satp(&self) -> usize {
        self.directory.satp()
    }

    /// Switches this hart to the kernel table.
    ///
    /// # Safety
    /// Paging must be safe to enable: the code performing the switch is mapped at its
    /// current address (it is, since the kernel is identity mapped).
    pub unsafe fn activate(&self) {
        // SAFETY: Forwarded to the caller.
        unsafe { self.directory.activate() }
    }
}

fn identity_map(
    directory: &mut PageDirectory,
    start: PhysicalAddress,
    size: usize,
    flags: PteFlags,
) -> Result<(), VmError> {
    if size == 0 {
        return Ok(());
    }
    directory.map(VirtualAddress::new(start.as_usize()), start, size, flags)?;
    Ok(())
}

/// Builds the global kernel address space.
///
/// The frame allocator must already be initialized.
///
/// # Panics
///
/// Panics if the kernel address space has already been initialized.
pub fn init(layout: KernelLayout) -> Result<&'static KernelSpace, VmError> {
    #[cfg(not(any(test, feature = "software-emulation")))]
    {
        if KERNEL_SPACE.get().is_some() {
            panic!("kernel address space already initialized");
        }
        let space = KernelSpace::build(layout)?;
        Ok(KERNEL_SPACE.call_once(|| space))
    }

    #[cfg(any(test, feature = "software-emulation"))]
    {
        KERNEL_SPACE.with(|k| {
            if k.get().is_some() {
                panic!("kernel address space already initialized");
            }
        });
        let space = KernelSpace::build(layout)?;
        KERNEL_SPACE.with(|k| {
            k.call_once(|| space);
        });
        Ok(get())
    }
}

/// Returns the global kernel address space.
///
/// # Panics
///
/// Panics if [`init`] has not been called.
pub fn get() -> &'static KernelSpace {
    #[cfg(not(any(test, feature = "software-emulation")))]
    {
        KERNEL_SPACE
            .get()
            .expect("kernel address space not initialized")
    }

    #[cfg(any(test, feature = "software-emulation"))]
    {
        KERNEL_SPACE.with(|k| {
            let space = k.get().expect("kernel address space not initialized");
            // SAFETY: The thread-local is set once and lives as long as the thread.
            unsafe { &*(space as *const KernelSpace) }
        })
    }
}

/// Global kernel address space; thread-local under emulation, like the frame allocator.
#[cfg(not(any(test, feature = "software-emulation")))]
static KERNEL_SPACE: spin::Once<KernelSpace> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static KERNEL_SPACE: spin::Once<KernelSpace> = spin::Once::new();
}
