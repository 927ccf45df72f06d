//! Physical frame allocator.
//!
//! Free frames form an intrusive singly-linked list: each free frame stores the address of
//! the next one in its first bytes. Allocation pops the head, freeing pushes onto it, so the
//! most recently freed frame is always handed out first.
//!
//! With the `poison` feature (on by default) allocated frames are filled with
//! [`ALLOC_POISON`] and freed frames with [`FREE_POISON`], so reads of uninitialized memory
//! and use-after-free show up as recognizable garbage.

use crate::{AddressTranslator, Frame, PhysicalAddress, arch::PAGE_SIZE};

/// Byte pattern written into every frame returned by [`FrameAllocator::allocate`].
pub const ALLOC_POISON: u8 = 0x05;

/// Byte pattern written into every frame passed to [`FrameAllocator::free`].
pub const FREE_POISON: u8 = 0x01;

/// Errors that can occur during physical frame allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// Every frame is in use.
    #[error("physical frames exhausted")]
    Exhausted,
}

/// Link written into the first bytes of a free frame.
#[repr(C)]
struct FreeFrame {
    next: Option<PhysicalAddress>,
}

/// The list head and its length, guarded together.
struct FreeList {
    head: Option<PhysicalAddress>,
    len: usize,
}

/// A LIFO free-list allocator over one contiguous range of physical frames.
pub struct FrameAllocator {
    /// First frame of the managed range.
    start: PhysicalAddress,
    /// One past the last byte of the managed range (the top of physical memory).
    end: PhysicalAddress,
    free: spin::Mutex<FreeList>,
}

impl FrameAllocator {
    /// Creates an allocator managing `[start, end)` with every frame in it free.
    ///
    /// `start` is rounded up to a page boundary; a trailing partial frame is ignored.
    pub fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        let allocator = Self {
            start: start.align_up(PAGE_SIZE),
            end,
            free: spin::Mutex::new(FreeList { head: None, len: 0 }),
        };

        let mut frame = allocator.start;
        while frame.as_usize() + PAGE_SIZE <= end.as_usize() {
            // SAFETY: The range is handed to us at boot; nothing else owns these frames.
            allocator.free(unsafe { Frame::from_address(frame) });
            frame = frame + PAGE_SIZE;
        }

        allocator
    }

    /// Removes the most recently freed frame from the pool.
    ///
    /// The frame is not zeroed. With the `poison` feature its bytes are all [`ALLOC_POISON`].
    pub fn allocate(&self) -> Result<Frame, AllocError> {
        let address = {
            let mut list = self.free.lock();
            let head = list.head.ok_or(AllocError::Exhausted)?;
            // SAFETY: Every frame on the list holds a `FreeFrame` written by `free`.
            list.head = unsafe { self.link(head).read().next };
            list.len -= 1;
            head
        };

        // SAFETY: The frame just left the free list, so we own it.
        #[cfg_attr(not(feature = "poison"), allow(unused_mut))]
        let mut frame = unsafe { Frame::from_address(address) };
        #[cfg(feature = "poison")]
        frame.fill(ALLOC_POISON);
        Ok(frame)
    }

    /// Returns a frame to the pool.
    ///
    /// # Panics
    /// Panics if the frame is misaligned or outside the managed range, or is already at the
    /// head of the free list.
    pub fn free(&self, frame: Frame) {
        let address = frame.address();
        if !address.is_aligned(PAGE_SIZE) || address < self.start || address >= self.end {
            panic!(
                "free: frame {} outside managed range [{}, {})",
                address, self.start, self.end
            );
        }

        #[cfg_attr(not(feature = "poison"), allow(unused_mut))]
        let mut frame = frame;
        let mut list = self.free.lock();
        assert_ne!(list.head, Some(address), "free: double free of frame {address}");

        #[cfg(feature = "poison")]
        frame.fill(FREE_POISON);

        let address = frame.into_address();
        // SAFETY: We own the frame and are turning it into a free-list node.
        unsafe { self.link(address).write(FreeFrame { next: list.head }) };
        list.head = Some(address);
        list.len += 1;
    }

    /// Returns the number of frames currently on the free list.
    pub fn free_frames(&self) -> usize {
        self.free.lock().len
    }

    /// Returns the managed range as `(start, end)`.
    pub fn range(&self) -> (PhysicalAddress, PhysicalAddress) {
        (self.start, self.end)
    }

    fn link(&self, frame: PhysicalAddress) -> *mut FreeFrame {
        AddressTranslator::current().phys_to_ptr(frame)
    }

    /// Initializes the global frame allocator over `[start, end)`.
    ///
    /// This function must be called exactly once, before any page table is built.
    ///
    /// # Panics
    ///
    /// Panics if the allocator has already been initialized.
    pub fn init(start: PhysicalAddress, end: PhysicalAddress) -> &'static FrameAllocator {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if FRAME_ALLOCATOR.get().is_some() {
                panic!("frame allocator already initialized");
            }
            let allocator = FRAME_ALLOCATOR.call_once(|| FrameAllocator::new(start, end));
            log::debug!(
                "frame allocator: {} frames in [{}, {})",
                allocator.free_frames(),
                allocator.start,
                allocator.end
            );
            allocator
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            FRAME_ALLOCATOR.with(|a| {
                if a.get().is_some() {
                    panic!("frame allocator already initialized");
                }
                a.call_once(|| FrameAllocator::new(start, end));
            });
            let allocator = Self::current();
            log::debug!(
                "frame allocator: {} frames in [{}, {})",
                allocator.free_frames(),
                allocator.start,
                allocator.end
            );
            allocator
        }
    }

    /// Returns the global frame allocator.
    ///
    /// # Panics
    ///
    /// Panics if [`FrameAllocator::init`] has not been called.
    pub fn current() -> &'static FrameAllocator {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            FRAME_ALLOCATOR
                .get()
                .expect("frame allocator not initialized; call FrameAllocator::init during boot")
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            FRAME_ALLOCATOR.with(|a| {
                let allocator = a.get().expect(
                    "frame allocator not initialized; call FrameAllocator::init during boot",
                );
                // SAFETY: The thread-local is set once and lives as long as the thread.
                unsafe { &*(allocator as *const FrameAllocator) }
            })
        }
    }
}

/// Global frame allocator.
///
/// In test/software-emulation mode, this is thread-local so that each test owns its own
/// emulated machine.
#[cfg(not(any(test, feature = "software-emulation")))]
static FRAME_ALLOCATOR: spin::Once<FrameAllocator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static FRAME_ALLOCATOR: spin::Once<FrameAllocator> = spin::Once::new();
}
