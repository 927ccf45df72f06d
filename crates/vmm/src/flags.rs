//! Sv39 page table entry flags.

bitflags::bitflags! {
    /// The low ten bits of an Sv39 page table entry.
    ///
    /// An entry with `VALID` set and none of `READ`, `WRITE`, `EXECUTE` points at the next
    /// level table; with any of them set it is a leaf.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u64 {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
        const USER_RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits() | Self::USER.bits();
    }
}

impl PteFlags {
    /// Permission bits that make an entry a leaf.
    pub const LEAF_MASK: Self = Self::READ.union(Self::WRITE).union(Self::EXECUTE);

    /// Returns true if these flags describe a leaf mapping.
    #[inline]
    pub const fn is_leaf_permission(self) -> bool {
        self.intersects(Self::LEAF_MASK)
    }
}
