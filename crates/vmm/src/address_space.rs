//! Process address spaces.
//!
//! Each process owns two page tables:
//!
//! - The *user* table, loaded while the process runs in user mode. It maps the process image
//!   at `[0, size)` with `USER` set, and the trampoline (kernel-only) at [`TRAMPOLINE`].
//! - The *shadow* table, loaded while the kernel runs on the process's behalf. Root slots 1
//!   and up are copied from the kernel table, so kernel code, RAM and the trampoline are all
//!   visible. Slot 0 is private: it holds a read-only mirror of user memory plus identity
//!   mappings of the shadowed device windows.
//!
//! Because user memory is mirrored without the `USER` flag, the kernel can read user data
//! without toggling `sstatus.SUM` on every trap.

use crate::{
    AllocError, DeviceWindow, EntryKind, FrameAllocator, KernelSpace, PageDirectory, PageEntry,
    PageNumber, TRAMPOLINE, USER_SLOT_END, VirtualAddress, VmError,
    arch::{self, ENTRY_COUNT, PAGE_SIZE},
    flags::PteFlags,
    frame::page_bytes,
};

/// Flags for a shadow mirror of a user leaf with `flags`.
fn shadow_flags(flags: PteFlags) -> PteFlags {
    (flags - (PteFlags::USER | PteFlags::WRITE | PteFlags::EXECUTE)) | PteFlags::READ
}

/// A process's user and kernel-shadow page tables, plus the size of its image.
pub struct AddressSpace {
    user: PageDirectory,
    shadow: PageDirectory,
    /// Bytes of user memory; every page in `[0, size)` is mapped.
    size: usize,
    user_limit: usize,
    devices: &'static [DeviceWindow],
}

impl AddressSpace {
    /// Creates an empty address space: the user table holds only the trampoline, the shadow
    /// table shares the kernel's upper root slots and mirrors the shadowed devices.
    pub fn new(kernel: &KernelSpace) -> Result<Self, VmError> {
        let layout = kernel.layout();

        let mut user = PageDirectory::new()?;
        if let Err(err) = user.map(
            TRAMPOLINE,
            layout.trampoline,
            PAGE_SIZE,
            PteFlags::READ_EXECUTE,
        ) {
            user.destroy();
            return Err(err.into());
        }

        let shadow = match build_shadow(kernel) {
            Ok(shadow) => shadow,
            Err(err) => {
                user.unmap(TRAMPOLINE, 1, false);
                user.destroy();
                return Err(err.into());
            }
        };

        Ok(Self {
            user,
            shadow,
            size: 0,
            user_limit: layout.user_limit(),
            devices: layout.devices,
        })
    }

    /// Loads the first process image into page 0 and sets the size to one page.
    ///
    /// # Panics
    /// Panics if `image` is a page or larger, or if the address space is not empty.
    pub fn init(&mut self, image: &[u8]) -> Result<(), VmError> {
        assert!(image.len() < PAGE_SIZE, "init: more than a page");
        assert_eq!(self.size, 0, "init: address space already populated");

        let first = PageNumber::new(0);
        if let Err(err) = self.add_user_page(first.start(), image, PteFlags::USER_RWX) {
            self.discard_user_pages(first, first);
            return Err(err.into());
        }
        if let Err(err) = self.mirror(first, first + 1) {
            self.discard_user_pages(first, first + 1);
            return Err(err.into());
        }

        self.size = PAGE_SIZE;
        Ok(())
    }

    /// Grows user memory to `new_size` bytes with zeroed, user-accessible pages.
    ///
    /// Returns the new size. Asking for less than the current size changes nothing. On
    /// failure every page added by this call is removed again and the size is unchanged.
    pub fn grow(&mut self, new_size: usize) -> Result<usize, VmError> {
        if new_size <= self.size {
            return Ok(self.size);
        }
        if new_size > self.user_limit {
            return Err(VmError::SizeLimit {
                requested: new_size,
                limit: self.user_limit,
            });
        }

        log::trace!("grow: {:#x} -> {:#x}", self.size, new_size);
        let start = PageNumber::at_or_above(self.size);
        let end = PageNumber::at_or_above(new_size);

        for page in start..end {
            if let Err(err) = self.add_user_page(page.start(), &[], PteFlags::USER_RWX) {
                log::warn!("grow: {err} at {}, rolling back to {:#x}", page.start(), self.size);
                self.discard_user_pages(start, page);
                return Err(err.into());
            }
        }

        if let Err(err) = self.mirror(start, end) {
            log::warn!("grow: {err} while mirroring, rolling back to {:#x}", self.size);
            self.discard_user_pages(start, end);
            return Err(err.into());
        }

        self.size = new_size;
        Ok(new_size)
    }

    /// Shrinks user memory to `new_size` bytes, freeing the trailing pages.
    ///
    /// Returns the new size. Asking for more than the current size changes nothing.
    pub fn shrink(&mut self, new_size: usize) -> usize {
        if new_size >= self.size {
            return self.size;
        }

        log::trace!("shrink: {:#x} -> {:#x}", self.size, new_size);
        let keep = PageNumber::at_or_above(new_size);
        let end = PageNumber::at_or_above(self.size);
        if end > keep {
            self.shadow.unmap(keep.start(), end - keep, false);
            self.discard_user_pages(keep, end);
        }

        self.size = new_size;
        new_size
    }

    /// Creates a child address space holding a private copy of this one's user memory.
    ///
    /// Page flags are copied as they are, so a guard page stays a guard page. On failure the
    /// partially built child is torn down.
    ///
    /// # Panics
    /// Panics if a page inside `[0, size)` is not mapped.
    pub fn fork_copy(&self, kernel: &KernelSpace) -> Result<AddressSpace, VmError> {
        let mut child = AddressSpace::new(kernel)?;
        let start = PageNumber::new(0);
        let end = PageNumber::at_or_above(self.size);

        for page in start..end {
            let va = page.start();
            let Some(EntryKind::Leaf(frame, flags)) = self.user.walk(va).map(PageEntry::kind)
            else {
                panic!("fork: {va} not mapped in parent");
            };
            // SAFETY: The parent owns this frame and `&self` keeps it mapped.
            let contents = unsafe { page_bytes(frame) };
            if let Err(err) = child.add_user_page(va, contents, flags) {
                log::warn!("fork: {err} copying {va}");
                child.discard_user_pages(start, page);
                child.destroy();
                return Err(err.into());
            }
        }

        if let Err(err) = child.mirror(start, end) {
            log::warn!("fork: {err} while mirroring");
            child.discard_user_pages(start, end);
            child.destroy();
            return Err(err.into());
        }

        child.size = self.size;
        Ok(child)
    }

    /// Makes the page containing `va` inaccessible from user mode, as for a stack guard page.
    ///
    /// # Panics
    /// Panics if `va` is not mapped.
    pub fn clear_user_access(&mut self, va: VirtualAddress) {
        self.user
            .update_leaf_flags(va.align_down(PAGE_SIZE), |flags| flags - PteFlags::USER);
    }

    /// Frees all user memory and both page tables.
    pub fn destroy(self) {
        let Self {
            mut user,
            mut shadow,
            size,
            devices,
            ..
        } = self;
        let zero = VirtualAddress::new(0);
        let pages = arch::page_round_up(size) / PAGE_SIZE;

        shadow.unmap(zero, pages, false);
        for window in devices.iter().filter(|window| window.shadowed) {
            shadow.unmap(window.virtual_base(), window.pages(), false);
        }
        shadow.detach_root_entries(1..ENTRY_COUNT);
        shadow.destroy();

        user.unmap(zero, pages, true);
        user.unmap(TRAMPOLINE, 1, false);
        user.destroy();
    }

    /// Switches this hart to the shadow table.
    ///
    /// # Safety
    /// The address space must stay alive while its shadow table is loaded.
    pub unsafe fn activate(&self) {
        // SAFETY: Forwarded to the caller.
        unsafe { self.shadow.activate() }
    }

    /// The table loaded in user mode.
    pub fn user(&self) -> &PageDirectory {
        &self.user
    }

    /// The table loaded while the kernel works for this process.
    pub fn shadow(&self) -> &PageDirectory {
        &self.shadow
    }

    /// Size of user memory in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Largest size [`AddressSpace::grow`] accepts.
    pub fn user_limit(&self) -> usize {
        self.user_limit
    }

    /// The `satp` value the trampoline loads when returning to user mode.
    pub fn user_satp(&self) -> usize {
        self.user.satp()
    }

    /// Maps a fresh frame at `va` holding `contents` followed by zeroes.
    fn add_user_page(
        &mut self,
        va: VirtualAddress,
        contents: &[u8],
        flags: PteFlags,
    ) -> Result<(), AllocError> {
        let allocator = FrameAllocator::current();
        let mut frame = allocator.allocate()?;
        let bytes = frame.as_bytes_mut();
        bytes[..contents.len()].copy_from_slice(contents);
        bytes[contents.len()..].fill(0);

        match self.user.map(va, frame.address(), PAGE_SIZE, flags) {
            Ok(()) => {
                frame.into_address();
                Ok(())
            }
            Err(err) => {
                allocator.free(frame);
                Err(err)
            }
        }
    }

    /// Frees user pages `[start, end)` and drops any page tables left empty above `start`.
    /// Their shadow mirrors must already be gone.
    fn discard_user_pages(&mut self, start: PageNumber, end: PageNumber) {
        self.user.unmap(start.start(), end - start, true);
        let from = start.start();
        let to = VirtualAddress::new(USER_SLOT_END);
        self.user.prune(from, to);
        self.shadow.prune(from, to);
    }

    /// Mirrors user pages `[start, end)` into the shadow table. On failure the mirrors added
    /// by this call are removed again.
    fn mirror(&mut self, start: PageNumber, end: PageNumber) -> Result<(), AllocError> {
        for page in start..end {
            let va = page.start();
            let Some(EntryKind::Leaf(frame, flags)) = self.user.walk(va).map(PageEntry::kind)
            else {
                panic!("mirror: {va} not mapped in user table");
            };
            if let Err(err) = self.shadow.map(va, frame, PAGE_SIZE, shadow_flags(flags)) {
                self.shadow.unmap(start.start(), page - start, false);
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Builds a shadow root for `kernel`. On failure nothing is left allocated.
fn build_shadow(kernel: &KernelSpace) -> Result<PageDirectory, AllocError> {
    let mut shadow = PageDirectory::new()?;
    for index in 1..ENTRY_COUNT {
        let entry = kernel.directory().root_entry(index);
        if entry.is_valid() {
            shadow.share_root_entry(index, entry);
        }
    }

    let layout = kernel.layout();
    for (mapped, window) in layout.shadowed_devices().enumerate() {
        if let Err(err) = map_window(&mut shadow, window) {
            for done in layout.shadowed_devices().take(mapped) {
                shadow.unmap(done.virtual_base(), done.pages(), false);
            }
            shadow.detach_root_entries(1..ENTRY_COUNT);
            shadow.destroy();
            return Err(err);
        }
    }

    Ok(shadow)
}

/// Identity maps `window` read-write, one page at a time, unwinding on failure.
fn map_window(table: &mut PageDirectory, window: &DeviceWindow) -> Result<(), AllocError> {
    for page in 0..window.pages() {
        let offset = page * PAGE_SIZE;
        if let Err(err) = table.map(
            window.virtual_base() + offset,
            window.base + offset,
            PAGE_SIZE,
            PteFlags::READ_WRITE,
        ) {
            table.unmap(window.virtual_base(), page, false);
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        CopyError, Frame, PhysicalAddress, QEMU_VIRT_DEVICES, copy_from_user, copy_to_user,
        testing::{RAM_BASE, boot},
    };

    const RX: PteFlags = PteFlags::READ_EXECUTE.union(PteFlags::VALID);
    const RW: PteFlags = PteFlags::READ_WRITE.union(PteFlags::VALID);
    const MIRROR: PteFlags = PteFlags::READ.union(PteFlags::VALID);

    fn kind(table: &PageDirectory, va: usize) -> EntryKind {
        table
            .walk(VirtualAddress::new(va))
            .map_or(EntryKind::Invalid, PageEntry::kind)
    }

    fn page(index: usize) -> VirtualAddress {
        VirtualAddress::new(index * PAGE_SIZE)
    }

    /// Allocates frames until only `n` remain free.
    fn leave_free(n: usize) -> Vec<Frame> {
        let allocator = FrameAllocator::current();
        let mut hog = Vec::new();
        while allocator.free_frames() > n {
            hog.push(allocator.allocate().unwrap());
        }
        hog
    }

    #[test]
    fn user_table_holds_only_the_trampoline() {
        let kernel = boot(256);
        let space = AddressSpace::new(kernel).unwrap();

        assert_eq!(
            kind(space.user(), TRAMPOLINE.as_usize()),
            EntryKind::Leaf(kernel.layout().trampoline, RX)
        );
        assert_eq!(space.user().translate(TRAMPOLINE), None);
        assert_eq!(kind(space.user(), RAM_BASE), EntryKind::Invalid);
        assert_eq!(space.size(), 0);
    }

    #[test]
    fn shadow_shares_upper_kernel_slots() {
        let kernel = boot(256);
        let space = AddressSpace::new(kernel).unwrap();

        for index in 1..ENTRY_COUNT {
            assert_eq!(
                space.shadow().root_entry(index),
                kernel.directory().root_entry(index)
            );
        }
        assert_ne!(
            space.shadow().root_entry(0),
            kernel.directory().root_entry(0)
        );
        assert_eq!(
            kind(space.shadow(), RAM_BASE),
            kind(kernel.directory(), RAM_BASE)
        );
        assert_eq!(
            kind(space.shadow(), TRAMPOLINE.as_usize()),
            EntryKind::Leaf(kernel.layout().trampoline, RX)
        );
    }

    #[test]
    fn shadow_maps_only_shadowed_devices() {
        let kernel = boot(256);
        let space = AddressSpace::new(kernel).unwrap();

        for window in QEMU_VIRT_DEVICES {
            let expected = if window.shadowed {
                EntryKind::Leaf(window.base, RW)
            } else {
                EntryKind::Invalid
            };
            assert_eq!(kind(space.shadow(), window.base.as_usize()), expected, "{}", window.name);
        }
        assert_eq!(space.user_limit(), 0x0c00_0000);
    }

    #[test]
    fn new_rolls_back_when_shadow_devices_fail() {
        let kernel = boot(256);
        for remaining in [2, 5, 7] {
            let hog = leave_free(remaining);
            assert_eq!(AddressSpace::new(kernel).err(), Some(VmError::OutOfMemory));
            assert_eq!(FrameAllocator::current().free_frames(), remaining);
            for frame in hog {
                FrameAllocator::current().free(frame);
            }
        }
    }

    #[test]
    fn init_loads_image_at_zero() {
        let kernel = boot(256);
        let mut space = AddressSpace::new(kernel).unwrap();

        space.init(b"\x17\x05\x00\x00initcode").unwrap();

        assert_eq!(space.size(), PAGE_SIZE);
        let mut buf = [0xffu8; 16];
        copy_from_user(space.user(), &mut buf, page(0)).unwrap();
        assert_eq!(&buf, b"\x17\x05\x00\x00initcode\0\0\0\0");

        let frame = space.user().translate(page(0)).unwrap();
        assert_eq!(kind(space.shadow(), 0), EntryKind::Leaf(frame, MIRROR));
    }

    #[test]
    #[should_panic(expected = "init: more than a page")]
    fn init_rejects_large_image() {
        let kernel = boot(256);
        let mut space = AddressSpace::new(kernel).unwrap();
        let _ = space.init(&[0; PAGE_SIZE]);
    }

    #[test]
    #[should_panic(expected = "init: address space already populated")]
    fn init_rejects_populated_space() {
        let kernel = boot(256);
        let mut space = AddressSpace::new(kernel).unwrap();
        space.grow(PAGE_SIZE).unwrap();
        let _ = space.init(b"x");
    }

    #[test]
    fn grow_maps_zeroed_user_pages() {
        let kernel = boot(256);
        let mut space = AddressSpace::new(kernel).unwrap();

        assert_eq!(space.grow(3 * PAGE_SIZE + 10), Ok(3 * PAGE_SIZE + 10));
        assert_eq!(space.size(), 3 * PAGE_SIZE + 10);

        for index in 0..4 {
            let frame = space.user().translate(page(index)).unwrap();
            assert_eq!(kind(space.shadow(), page(index).as_usize()), EntryKind::Leaf(frame, MIRROR));
        }
        assert_eq!(space.user().translate(page(4)), None);

        let mut buf = [0xffu8; 64];
        copy_from_user(space.user(), &mut buf, page(2) + 100).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn grow_to_smaller_size_is_a_no_op() {
        let kernel = boot(256);
        let mut space = AddressSpace::new(kernel).unwrap();
        space.grow(2 * PAGE_SIZE).unwrap();
        let free = FrameAllocator::current().free_frames();

        assert_eq!(space.grow(PAGE_SIZE), Ok(2 * PAGE_SIZE));
        assert_eq!(space.size(), 2 * PAGE_SIZE);
        assert_eq!(FrameAllocator::current().free_frames(), free);
    }

    #[test]
    fn grow_partial_page_then_finish_it() {
        let kernel = boot(256);
        let mut space = AddressSpace::new(kernel).unwrap();
        space.grow(100).unwrap();
        let free = FrameAllocator::current().free_frames();

        // Still inside the first page: no new frames.
        space.grow(PAGE_SIZE).unwrap();
        assert_eq!(FrameAllocator::current().free_frames(), free);

        space.grow(PAGE_SIZE + 1).unwrap();
        assert!(space.user().translate(page(1)).is_some());
    }

    #[test]
    fn grow_then_shrink_restores_free_count() {
        let kernel = boot(256);
        let mut space = AddressSpace::new(kernel).unwrap();
        let free = FrameAllocator::current().free_frames();

        space.grow(5 * PAGE_SIZE).unwrap();
        assert_eq!(space.shrink(0), 0);

        assert_eq!(FrameAllocator::current().free_frames(), free);
        for index in 0..5 {
            assert_eq!(space.user().translate(page(index)), None);
            assert_eq!(kind(space.shadow(), page(index).as_usize()), EntryKind::Invalid);
        }
    }

    #[test]
    fn shrink_keeps_partial_page() {
        let kernel = boot(256);
        let mut space = AddressSpace::new(kernel).unwrap();
        space.grow(4 * PAGE_SIZE).unwrap();

        assert_eq!(space.shrink(PAGE_SIZE + 1), PAGE_SIZE + 1);

        assert!(space.user().translate(page(1)).is_some());
        assert_eq!(space.user().translate(page(2)), None);
        assert_eq!(kind(space.shadow(), page(2).as_usize()), EntryKind::Invalid);
        assert_eq!(space.shrink(3 * PAGE_SIZE), PAGE_SIZE + 1);
    }

    #[test]
    fn grow_past_user_limit_is_rejected() {
        let kernel = boot(256);
        let mut space = AddressSpace::new(kernel).unwrap();
        let limit = space.user_limit();

        assert_eq!(
            space.grow(limit + 1),
            Err(VmError::SizeLimit {
                requested: limit + 1,
                limit
            })
        );
        assert_eq!(space.size(), 0);
    }

    #[test]
    fn grow_failure_rolls_back_user_pages() {
        let kernel = boot(256);
        let mut space = AddressSpace::new(kernel).unwrap();
        space.init(b"init").unwrap();
        let _hog = leave_free(3);

        assert_eq!(space.grow(10 * PAGE_SIZE), Err(VmError::OutOfMemory));

        assert_eq!(space.size(), PAGE_SIZE);
        assert_eq!(FrameAllocator::current().free_frames(), 3);
        assert_eq!(space.user().translate(page(1)), None);
        assert!(space.user().translate(page(0)).is_some());
    }

    #[test]
    fn grow_failure_while_mirroring_rolls_back() {
        let kernel = boot(256);
        let mut space = AddressSpace::new(kernel).unwrap();
        // Enough for the user page and its two tables, not for the shadow's table.
        let _hog = leave_free(3);

        assert_eq!(space.grow(PAGE_SIZE), Err(VmError::OutOfMemory));

        assert_eq!(space.size(), 0);
        assert_eq!(FrameAllocator::current().free_frames(), 3);
        assert_eq!(space.user().translate(page(0)), None);
    }

    #[test]
    fn fork_copies_into_disjoint_frames() {
        let kernel = boot(256);
        let mut parent = AddressSpace::new(kernel).unwrap();
        parent.grow(3 * PAGE_SIZE).unwrap();
        let data: Vec<u8> = (0..=255).cycle().take(3 * PAGE_SIZE).collect();
        copy_to_user(parent.user(), page(0), &data).unwrap();

        let child = parent.fork_copy(kernel).unwrap();

        assert_eq!(child.size(), parent.size());
        for index in 0..3 {
            assert_ne!(
                child.user().translate(page(index)),
                parent.user().translate(page(index))
            );
        }
        let mut copied = vec![0u8; 3 * PAGE_SIZE];
        copy_from_user(child.user(), &mut copied, page(0)).unwrap();
        assert_eq!(copied, data);

        copy_to_user(child.user(), page(1), b"child").unwrap();
        let mut original = [0u8; 5];
        copy_from_user(parent.user(), &mut original, page(1)).unwrap();
        assert_eq!(&original, &data[PAGE_SIZE..PAGE_SIZE + 5]);
    }

    #[test]
    fn fork_preserves_guard_page() {
        let kernel = boot(256);
        let mut parent = AddressSpace::new(kernel).unwrap();
        parent.grow(2 * PAGE_SIZE).unwrap();
        parent.clear_user_access(page(0));

        let child = parent.fork_copy(kernel).unwrap();

        assert_eq!(child.user().translate(page(0)), None);
        assert!(child.user().translate(page(1)).is_some());
    }

    #[test]
    fn fork_failure_releases_child() {
        let kernel = boot(256);
        let mut parent = AddressSpace::new(kernel).unwrap();
        parent.grow(3 * PAGE_SIZE).unwrap();
        let _hog = leave_free(10);

        assert_eq!(parent.fork_copy(kernel).err(), Some(VmError::OutOfMemory));
        assert_eq!(FrameAllocator::current().free_frames(), 10);
    }

    #[test]
    #[should_panic(expected = "fork: 0x1000 not mapped in parent")]
    fn fork_with_hole_is_fatal() {
        let kernel = boot(256);
        let mut parent = AddressSpace::new(kernel).unwrap();
        parent.grow(2 * PAGE_SIZE).unwrap();
        parent.shadow.unmap(page(1), 1, false);
        parent.user.unmap(page(1), 1, true);

        let _ = parent.fork_copy(kernel);
    }

    #[test]
    fn guard_page_is_not_user_accessible() {
        let kernel = boot(256);
        let mut space = AddressSpace::new(kernel).unwrap();
        space.grow(2 * PAGE_SIZE).unwrap();
        let frame = space.user().translate(page(0)).unwrap();

        space.clear_user_access(page(0) + 123);

        assert_eq!(space.user().translate(page(0)), None);
        assert_eq!(
            kind(space.user(), 0),
            EntryKind::Leaf(frame, RW | PteFlags::EXECUTE)
        );
        assert_eq!(
            copy_to_user(space.user(), page(0), b"smash"),
            Err(CopyError::Unmapped(page(0)))
        );
        copy_to_user(space.user(), page(1), b"fine").unwrap();
    }

    #[test]
    #[should_panic(expected = "no page table")]
    fn clear_user_access_on_unmapped_page_is_fatal() {
        let kernel = boot(256);
        let mut space = AddressSpace::new(kernel).unwrap();
        space.clear_user_access(page(0));
    }

    #[test]
    fn destroy_returns_every_frame() {
        let kernel = boot(256);
        let free = FrameAllocator::current().free_frames();

        let mut space = AddressSpace::new(kernel).unwrap();
        space.init(b"init").unwrap();
        space.grow(5 * PAGE_SIZE).unwrap();
        space.clear_user_access(page(3));
        let child = space.fork_copy(kernel).unwrap();
        space.destroy();
        child.destroy();

        assert_eq!(FrameAllocator::current().free_frames(), free);
        assert_eq!(
            kind(kernel.directory(), RAM_BASE),
            EntryKind::Leaf(PhysicalAddress::new(RAM_BASE), RX)
        );
    }

    #[test]
    fn activate_loads_shadow_table() {
        let kernel = boot(256);
        let space = AddressSpace::new(kernel).unwrap();

        unsafe { space.activate() };

        assert_eq!(arch::active_satp(), Some(space.shadow().satp()));
        assert_eq!(space.user_satp(), space.user().satp());
        assert_ne!(space.user_satp(), space.shadow().satp());
    }
}
