use crate::{AllocError, CopyError};

/// Errors returned by address-space operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// A frame for data or a page table could not be allocated.
    #[error("out of physical memory")]
    OutOfMemory,

    /// The address space would grow into memory reserved for device mirrors.
    #[error("address space size {requested:#x} exceeds limit {limit:#x}")]
    SizeLimit { requested: usize, limit: usize },

    /// A copy to or from user memory failed.
    #[error("bad user access: {0}")]
    UserAccess(#[from] CopyError),
}

impl From<AllocError> for VmError {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::Exhausted => Self::OutOfMemory,
        }
    }
}
