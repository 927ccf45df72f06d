//! Sv39 page table management.
//!
//! This module provides the `PageDirectory` type, which owns the root of a three-level page
//! table and provides the operations for mapping, unmapping, translating and tearing down
//! virtual addresses. Intermediate and root tables live in frames taken from the global
//! [`FrameAllocator`].
//!
//! Contract violations (remapping a live page, unmapping something that is not a leaf,
//! destroying a tree that still holds leaves) are bugs in the caller and panic.

use core::fmt;

use crate::{
    AddressTranslator, AllocError, Frame, FrameAllocator, PhysicalAddress, VirtualAddress,
    arch::{self, ENTRY_COUNT, PAGE_SIZE, PAGE_TABLE_LEVELS},
    entry::{EntryKind, PageEntry},
    flags::PteFlags,
    table::PageTable,
};

/// Allocates a zeroed frame for use as a page table.
fn alloc_page_table() -> Result<PhysicalAddress, AllocError> {
    let mut frame = FrameAllocator::current().allocate()?;
    frame.zero();
    Ok(frame.into_address())
}

/// Returns a frame that held a page table to the allocator.
fn free_page_table(table: PhysicalAddress) {
    // SAFETY: The caller has unlinked the table from its parent, so it owns the frame.
    FrameAllocator::current().free(unsafe { Frame::from_address(table) });
}

/// Views the page table stored in the frame at `phys`.
///
/// # Safety
/// The frame must hold a page table owned by the caller's tree, and no other reference to
/// that table may be live for the returned lifetime.
unsafe fn table_at<'a>(phys: PhysicalAddress) -> &'a mut PageTable {
    let ptr = AddressTranslator::current().phys_to_ptr::<PageTable>(phys);
    // SAFETY: Caller guarantees this frame holds a page table and is not aliased.
    unsafe { &mut *ptr }
}

/// The root of one Sv39 page table tree.
///
/// The directory exclusively owns its root frame and every intermediate table reachable from
/// it, except root entries installed with [`PageDirectory::share_root_entry`], which refer to
/// tables owned by another directory and must be detached before [`PageDirectory::destroy`].
/// Leaf frames are owned by whoever mapped them.
pub struct PageDirectory {
    root: PhysicalAddress,
}

impl PageDirectory {
    /// Creates a page directory with a fresh, zeroed root table.
    pub fn new() -> Result<Self, AllocError> {
        Ok(Self {
            root: alloc_page_table()?,
        })
    }

    /// Returns the physical address of the root table.
    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Returns the `satp` value that selects this table.
    pub fn satp(&self) -> usize {
        arch::make_satp(self.root.frame_number().as_usize())
    }

    /// Loads this table into the MMU and flushes stale translations.
    ///
    /// # Safety
    /// The table must map everything the caller is about to touch, including the code
    /// currently running, and must outlive its time as the active table.
    pub unsafe fn activate(&self) {
        // SAFETY: Forwarded to the caller.
        unsafe { arch::activate(self.satp()) }
    }

    /// Looks up the leaf-level entry for `va` without creating tables.
    ///
    /// Returns `None` if an intermediate table is missing.
    ///
    /// # Panics
    /// Panics if `va` is not below [`MAX_VIRTUAL`].
    pub fn walk(&self, va: VirtualAddress) -> Option<PageEntry> {
        assert!(va.is_valid(), "walk: virtual address {va} beyond Sv39 range");

        let mut table = self.root;
        for level in (1..PAGE_TABLE_LEVELS).rev() {
            // SAFETY: `table` is a page table in our tree; we only read through it.
            let entry = unsafe { table_at(table) }.entry(va.page_index(level));
            match entry.kind() {
                EntryKind::Table(child) => table = child,
                EntryKind::Invalid => return None,
                EntryKind::Leaf(..) => panic!("walk: unexpected leaf at level {level} for {va}"),
            }
        }

        // SAFETY: As above.
        Some(unsafe { table_at(table) }.entry(va.page_index(0)))
    }

    /// Walks to the leaf-level entry for `va` without creating tables.
    fn walk_mut(&mut self, va: VirtualAddress) -> Option<&mut PageEntry> {
        assert!(va.is_valid(), "walk: virtual address {va} beyond Sv39 range");

        let mut table = self.root;
        for level in (1..PAGE_TABLE_LEVELS).rev() {
            // SAFETY: `table` is a page table in our tree and `&mut self` excludes aliases.
            let entry = unsafe { table_at(table) }.entry(va.page_index(level));
            match entry.kind() {
                EntryKind::Table(child) => table = child,
                EntryKind::Invalid => return None,
                EntryKind::Leaf(..) => panic!("walk: unexpected leaf at level {level} for {va}"),
            }
        }

        // SAFETY: As above.
        Some(unsafe { table_at(table) }.entry_mut(va.page_index(0)))
    }

    /// Walks to the leaf-level entry for `va`, allocating zeroed intermediate tables as needed.
    ///
    /// Tables created before an allocation failure are left in place.
    fn walk_or_create(&mut self, va: VirtualAddress) -> Result<&mut PageEntry, AllocError> {
        assert!(va.is_valid(), "walk: virtual address {va} beyond Sv39 range");

        let mut table = self.root;
        for level in (1..PAGE_TABLE_LEVELS).rev() {
            // SAFETY: `table` is a page table in our tree and `&mut self` excludes aliases.
            let entry = unsafe { table_at(table) }.entry_mut(va.page_index(level));
            table = match entry.kind() {
                EntryKind::Table(child) => child,
                EntryKind::Invalid => {
                    let child = alloc_page_table()?;
                    *entry = PageEntry::table(child);
                    child
                }
                EntryKind::Leaf(..) => panic!("walk: unexpected leaf at level {level} for {va}"),
            };
        }

        // SAFETY: As above.
        Ok(unsafe { table_at(table) }.entry_mut(va.page_index(0)))
    }

    /// Maps `[va, va + size)` to physical memory starting at `pa` with the given permissions.
    ///
    /// `va` is rounded down to a page boundary and pages are mapped one at a time. If an
    /// intermediate table cannot be allocated the pages mapped so far stay mapped.
    ///
    /// # Panics
    /// Panics if `size` is zero, if `flags` has none of R/W/X, or if any page in the range is
    /// already mapped ("remap").
    pub fn map(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        size: usize,
        flags: PteFlags,
    ) -> Result<(), AllocError> {
        assert!(size > 0, "map: zero size");
        assert!(
            flags.is_leaf_permission(),
            "map: permissions {flags:?} do not describe a leaf"
        );

        let mut page = va.align_down(PAGE_SIZE);
        let last = (va + (size - 1)).align_down(PAGE_SIZE);
        let mut frame = pa;
        loop {
            let entry = self.walk_or_create(page)?;
            if entry.is_valid() {
                panic!("remap: {page} is already mapped ({entry:?})");
            }
            *entry = PageEntry::leaf(frame, flags);

            if page == last {
                return Ok(());
            }
            page = page + PAGE_SIZE;
            frame = frame + PAGE_SIZE;
        }
    }

    /// Removes `count` leaf mappings starting at the page-aligned address `va`.
    ///
    /// When `release` is true the mapped frames are returned to the frame allocator.
    ///
    /// # Panics
    /// Panics if `va` is misaligned, or any page in the range is not mapped by a leaf.
    pub fn unmap(&mut self, va: VirtualAddress, count: usize, release: bool) {
        assert!(va.is_aligned(PAGE_SIZE), "unmap: not aligned: {va}");

        for i in 0..count {
            let page = va + i * PAGE_SIZE;
            let Some(entry) = self.walk_mut(page) else {
                panic!("unmap: no page table for {page}");
            };
            match entry.kind() {
                EntryKind::Leaf(frame, _) => {
                    if release {
                        // SAFETY: The leaf owned this frame; clearing the entry below ends that.
                        FrameAllocator::current().free(unsafe { Frame::from_address(frame) });
                    }
                    entry.clear();
                }
                EntryKind::Invalid => panic!("unmap: not mapped: {page}"),
                EntryKind::Table(_) => panic!("unmap: not a leaf: {page}"),
            }
        }
    }

    /// Resolves a user virtual address to the physical frame backing its page.
    ///
    /// Returns `None` unless the page is mapped by a valid leaf carrying the `USER` flag; this
    /// is what keeps user-supplied pointers from reaching kernel-only pages. Unlike
    /// [`PageDirectory::walk`], addresses beyond the Sv39 range return `None`.
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        if !va.is_valid() {
            return None;
        }
        match self.walk(va)?.kind() {
            EntryKind::Leaf(frame, flags) if flags.contains(PteFlags::USER) => Some(frame),
            _ => None,
        }
    }

    /// Applies `update` to the flags of the existing leaf mapping `va`.
    ///
    /// # Panics
    /// Panics if `va` is not mapped by a leaf, or if the new flags are not a leaf permission.
    pub(crate) fn update_leaf_flags(
        &mut self,
        va: VirtualAddress,
        update: impl FnOnce(PteFlags) -> PteFlags,
    ) {
        let Some(entry) = self.walk_mut(va) else {
            panic!("update: no page table for {va}");
        };
        let EntryKind::Leaf(frame, flags) = entry.kind() else {
            panic!("update: {va} is not mapped by a leaf");
        };
        *entry = PageEntry::leaf(frame, update(flags));
    }

    /// Returns the root entry at `index`.
    pub(crate) fn root_entry(&self, index: usize) -> PageEntry {
        // SAFETY: The root is ours; read-only access.
        unsafe { table_at(self.root) }.entry(index)
    }

    /// Installs `entry` at root `index`, referring to a subtree owned by another directory.
    ///
    /// # Panics
    /// Panics if the slot is already in use.
    pub(crate) fn share_root_entry(&mut self, index: usize, entry: PageEntry) {
        // SAFETY: The root is ours and `&mut self` excludes aliases.
        let slot = unsafe { table_at(self.root) }.entry_mut(index);
        assert!(!slot.is_valid(), "share: root slot {index} already in use");
        *slot = entry;
    }

    /// Clears root entries `range` without touching what they point at.
    ///
    /// Used to drop subtrees installed with [`PageDirectory::share_root_entry`].
    pub(crate) fn detach_root_entries(&mut self, range: core::ops::Range<usize>) {
        // SAFETY: The root is ours and `&mut self` excludes aliases.
        let root = unsafe { table_at(self.root) };
        for index in range {
            root.entry_mut(index).clear();
        }
    }

    /// Releases intermediate tables that hold no valid entries and lie entirely inside
    /// `[start, end)`. The root is never released.
    pub fn prune(&mut self, start: VirtualAddress, end: VirtualAddress) {
        prune_table(
            self.root,
            PAGE_TABLE_LEVELS - 1,
            0,
            start.as_usize(),
            end.as_usize(),
        );
    }

    /// Frees every table frame in the tree, including the root.
    ///
    /// # Panics
    /// Panics if any leaf mapping remains; callers must unmap leaves first.
    pub fn destroy(self) {
        free_tree(self.root, PAGE_TABLE_LEVELS - 1);
    }

    /// Writes a textual dump of every valid entry.
    ///
    /// The first line is `page table <root>`; each valid entry follows on its own line,
    /// prefixed by one `..` per depth, and tables are descended into.
    pub fn dump(&self, out: &mut impl fmt::Write) -> fmt::Result {
        writeln!(out, "page table {:p}", self.root)?;
        dump_table(out, self.root, 1)
    }

    /// Returns an adapter that formats the dump through `Display`.
    pub fn display(&self) -> PageTableDump<'_> {
        PageTableDump(self)
    }
}

/// `Display` adapter for [`PageDirectory::dump`].
pub struct PageTableDump<'a>(&'a PageDirectory);

impl fmt::Display for PageTableDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.dump(f)
    }
}

fn free_tree(table: PhysicalAddress, level: usize) {
    // SAFETY: `table` is owned by the tree being destroyed.
    let node = unsafe { table_at(table) };
    for index in 0..ENTRY_COUNT {
        match node.entry(index).kind() {
            EntryKind::Invalid => {}
            EntryKind::Table(child) => {
                assert!(level > 0, "destroy: table entry in a leaf-level table");
                free_tree(child, level - 1);
                node.entry_mut(index).clear();
            }
            EntryKind::Leaf(..) => panic!("destroy: leaf at level {level} index {index}"),
        }
    }
    free_page_table(table);
}

/// Prunes empty children of `table`, whose first entry maps `base`. Returns true if `table`
/// itself ended up empty.
fn prune_table(table: PhysicalAddress, level: usize, base: usize, start: usize, end: usize) -> bool {
    // SAFETY: `table` belongs to the tree being pruned and `&mut` access is exclusive.
    let node = unsafe { table_at(table) };
    if level > 0 {
        let span = arch::level_span(level);
        for index in 0..ENTRY_COUNT {
            let child_base = base + index * span;
            if child_base + span <= start || child_base >= end {
                continue;
            }
            let EntryKind::Table(child) = node.entry(index).kind() else {
                continue;
            };
            let emptied = prune_table(child, level - 1, child_base, start, end);
            if emptied && child_base >= start && child_base + span <= end {
                node.entry_mut(index).clear();
                free_page_table(child);
            }
        }
    }
    node.is_empty()
}

fn dump_table(out: &mut impl fmt::Write, table: PhysicalAddress, depth: usize) -> fmt::Result {
    if depth > PAGE_TABLE_LEVELS {
        return Ok(());
    }
    // SAFETY: `table` is part of the tree being dumped; read-only access.
    let node = unsafe { table_at(table) };
    for (index, entry) in node.valid_entries() {
        for marker in 0..depth {
            if marker > 0 {
                out.write_char(' ')?;
            }
            out.write_str("..")?;
        }
        writeln!(
            out,
            "{}: pte {:#018x} pa {:p}",
            index,
            entry.as_u64(),
            entry.address()
        )?;
        if let EntryKind::Table(child) = entry.kind() {
            dump_table(out, child, depth + 1)?;
        }
    }
    Ok(())
}
