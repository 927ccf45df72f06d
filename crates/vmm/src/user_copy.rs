//! Copying between kernel buffers and user virtual memory.
//!
//! Each routine resolves user addresses one page at a time through
//! [`PageDirectory::translate`] and touches the backing frames through the kernel's direct
//! map. Only pages with the `USER` flag are reachable, so a guard page stops a copy just like
//! an unmapped one.

use crate::{
    PageDirectory, VirtualAddress,
    arch::PAGE_SIZE,
    frame::{page_bytes, page_bytes_mut},
};

/// Errors from copies to or from user memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CopyError {
    /// The page containing this address is not mapped for user access.
    #[error("user address {0} is not mapped")]
    Unmapped(VirtualAddress),

    /// No NUL byte was found within the allowed length.
    #[error("user string is not terminated")]
    Unterminated,
}

/// Visits the user memory `[start, start + len)` one page-sized piece at a time.
///
/// `visit` receives the offset of the piece within the whole range, the backing frame and
/// the in-page byte range.
fn for_each_chunk(
    table: &PageDirectory,
    start: VirtualAddress,
    len: usize,
    mut visit: impl FnMut(usize, crate::PhysicalAddress, core::ops::Range<usize>),
) -> Result<(), CopyError> {
    let mut done = 0;
    while done < len {
        let va = start + done;
        let frame = table
            .translate(va.align_down(PAGE_SIZE))
            .ok_or(CopyError::Unmapped(va))?;
        let offset = va.page_offset();
        let chunk = (PAGE_SIZE - offset).min(len - done);
        visit(done, frame, offset..offset + chunk);
        done += chunk;
    }
    Ok(())
}

/// Copies `src` into user memory at `dst`.
///
/// Pages before the first unmapped one may already have been written when this fails.
pub fn copy_to_user(
    table: &PageDirectory,
    dst: VirtualAddress,
    src: &[u8],
) -> Result<(), CopyError> {
    for_each_chunk(table, dst, src.len(), |done, frame, range| {
        let len = range.len();
        // SAFETY: `translate` only returns frames owned by this user address space.
        let page = unsafe { page_bytes_mut(frame) };
        page[range].copy_from_slice(&src[done..done + len]);
    })
}

/// Fills `dst` from user memory at `src`.
pub fn copy_from_user(
    table: &PageDirectory,
    dst: &mut [u8],
    src: VirtualAddress,
) -> Result<(), CopyError> {
    for_each_chunk(table, src, dst.len(), |done, frame, range| {
        let len = range.len();
        // SAFETY: `translate` only returns frames owned by this user address space.
        let page = unsafe { page_bytes(frame) };
        dst[done..done + len].copy_from_slice(&page[range]);
    })
}

/// Copies a NUL-terminated string from user memory at `src` into `dst`.
///
/// At most `max` bytes (and never more than `dst.len()`) are read, the NUL included. On
/// success `dst` holds the string followed by its NUL and the string length is returned.
pub fn copy_string_from_user(
    table: &PageDirectory,
    dst: &mut [u8],
    src: VirtualAddress,
    max: usize,
) -> Result<usize, CopyError> {
    let limit = max.min(dst.len());
    let mut copied = 0;

    while copied < limit {
        let va = src + copied;
        let frame = table
            .translate(va.align_down(PAGE_SIZE))
            .ok_or(CopyError::Unmapped(va))?;
        let offset = va.page_offset();
        let chunk = (PAGE_SIZE - offset).min(limit - copied);

        // SAFETY: `translate` only returns frames owned by this user address space.
        let page = unsafe { page_bytes(frame) };
        for &byte in &page[offset..offset + chunk] {
            dst[copied] = byte;
            if byte == 0 {
                return Ok(copied);
            }
            copied += 1;
        }
    }

    Err(CopyError::Unterminated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrameAllocator, PhysicalAddress, PteFlags, testing::setup_allocator};

    /// A user table with `pages` zeroed pages mapped from address 0.
    fn user_table(pages: usize) -> (PageDirectory, Vec<PhysicalAddress>) {
        setup_allocator(32);
        let mut table = PageDirectory::new().unwrap();
        let frames: Vec<_> = (0..pages)
            .map(|page| {
                let mut frame = FrameAllocator::current().allocate().unwrap();
                frame.zero();
                let pa = frame.into_address();
                table
                    .map(VirtualAddress::new(page * PAGE_SIZE), pa, PAGE_SIZE, PteFlags::USER_RWX)
                    .unwrap();
                pa
            })
            .collect();
        (table, frames)
    }

    #[test]
    fn string_stops_at_nul() {
        let (table, _) = user_table(1);
        copy_to_user(&table, VirtualAddress::new(0x10), b"hello\0world").unwrap();

        let mut buf = [0xffu8; 32];
        let len = copy_string_from_user(&table, &mut buf, VirtualAddress::new(0x10), 20).unwrap();

        assert_eq!(len, 5);
        assert_eq!(&buf[..6], b"hello\0");
    }

    #[test]
    fn string_without_nul_within_bound() {
        let (table, _) = user_table(1);
        copy_to_user(&table, VirtualAddress::new(0), b"abcdefghij").unwrap();

        let mut buf = [0u8; 32];
        assert_eq!(
            copy_string_from_user(&table, &mut buf, VirtualAddress::new(0), 5),
            Err(CopyError::Unterminated)
        );
    }

    #[test]
    fn string_bound_is_capped_by_buffer() {
        let (table, _) = user_table(1);
        copy_to_user(&table, VirtualAddress::new(0), b"abcdefghij\0").unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(
            copy_string_from_user(&table, &mut buf, VirtualAddress::new(0), 100),
            Err(CopyError::Unterminated)
        );
    }

    #[test]
    fn string_crosses_page_boundary() {
        let (table, _) = user_table(2);
        let start = VirtualAddress::new(PAGE_SIZE - 3);
        copy_to_user(&table, start, b"spans\0").unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(copy_string_from_user(&table, &mut buf, start, 16), Ok(5));
        assert_eq!(&buf[..5], b"spans");
    }

    #[test]
    fn string_runs_into_unmapped_page() {
        let (table, _) = user_table(1);
        let start = VirtualAddress::new(PAGE_SIZE - 2);
        copy_to_user(&table, start, b"ab").unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(
            copy_string_from_user(&table, &mut buf, start, 16),
            Err(CopyError::Unmapped(VirtualAddress::new(PAGE_SIZE)))
        );
    }

    #[test]
    fn copy_across_pages_lands_in_both_frames() {
        let (table, frames) = user_table(2);
        let data: Vec<u8> = (0..64).collect();
        copy_to_user(&table, VirtualAddress::new(PAGE_SIZE - 32), &data).unwrap();

        let first = unsafe { page_bytes(frames[0]) };
        let second = unsafe { page_bytes(frames[1]) };
        assert_eq!(&first[PAGE_SIZE - 32..], &data[..32]);
        assert_eq!(&second[..32], &data[32..]);

        let mut back = [0u8; 64];
        copy_from_user(&table, &mut back, VirtualAddress::new(PAGE_SIZE - 32)).unwrap();
        assert_eq!(&back[..], &data[..]);
    }

    #[test]
    fn copy_to_unmapped_reports_address() {
        let (table, _) = user_table(1);
        assert_eq!(
            copy_to_user(&table, VirtualAddress::new(PAGE_SIZE + 8), b"x"),
            Err(CopyError::Unmapped(VirtualAddress::new(PAGE_SIZE + 8)))
        );
    }

    #[test]
    fn kernel_only_pages_are_not_copyable() {
        setup_allocator(16);
        let mut table = PageDirectory::new().unwrap();
        let frame = FrameAllocator::current().allocate().unwrap().into_address();
        table
            .map(VirtualAddress::new(0), frame, PAGE_SIZE, PteFlags::READ_WRITE)
            .unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(
            copy_from_user(&table, &mut buf, VirtualAddress::new(0)),
            Err(CopyError::Unmapped(VirtualAddress::new(0)))
        );
    }

    #[test]
    fn addresses_beyond_sv39_are_rejected() {
        let (table, _) = user_table(1);
        let mut buf = [0u8; 4];
        let bogus = VirtualAddress::new(usize::MAX - 1);
        assert_eq!(
            copy_from_user(&table, &mut buf, bogus),
            Err(CopyError::Unmapped(bogus))
        );
    }

    #[test]
    fn empty_copies_touch_nothing() {
        let (table, _) = user_table(0);
        copy_to_user(&table, VirtualAddress::new(0x5000), &[]).unwrap();
        copy_from_user(&table, &mut [], VirtualAddress::new(0x5000)).unwrap();
    }
}
