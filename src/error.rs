//! The error type shared by every allocator in the crate.
//!
//! All conditions are reported synchronously to the caller of the failing
//! operation and are detected before any allocator state is touched, so a
//! returned error always leaves the allocator exactly as it was.

use thiserror::Error;

pub type AllocResult<T> = Result<T, AllocError>;

/// Why a deallocation request was rejected.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeallocFault {
    /// The pointer does not lie inside memory managed by the allocator.
    NotOwned,
    /// A stack deallocation that does not end at the current top.
    OutOfOrder { top: usize },
    /// The pointer is inside the allocator but not at the start of a block.
    Misaligned,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum AllocError {
    /// No memory left and no further growth is allowed.
    #[error("out of memory ({requested} bytes requested)")]
    OutOfMemory { requested: usize },

    #[error("invalid layout (size {size}, alignment {align})")]
    InvalidLayout { size: usize, align: usize },

    #[error("invalid deallocation of {addr:#x}: {fault:?}")]
    InvalidDeallocation { addr: usize, fault: DeallocFault },

    /// The slot or block at `addr` is not currently handed out.
    #[error("double release of {addr:#x}")]
    DoubleRelease { addr: usize },

    /// `size` differs from the size the allocation was made with.
    ///
    /// Only detectable where the allocator keeps enough bookkeeping, see
    /// [`VariableSizePool::deallocate`](crate::VariableSizePool::deallocate).
    #[error("size mismatch on deallocation of {addr:#x} ({size} bytes)")]
    SizeMismatch { addr: usize, size: usize },

    /// Every slot of a fixed-capacity pool is in use.
    #[error("pool exhausted (capacity {capacity})")]
    Exhausted { capacity: usize },
}

impl AllocError {
    #[inline]
    pub(crate) fn not_owned(addr: usize) -> Self {
        AllocError::InvalidDeallocation { addr, fault: DeallocFault::NotOwned }
    }

    #[inline]
    pub(crate) fn misaligned(addr: usize) -> Self {
        AllocError::InvalidDeallocation { addr, fault: DeallocFault::Misaligned }
    }

    /// Returns whether the error reports caller misuse rather than memory exhaustion.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            AllocError::InvalidDeallocation { .. }
                | AllocError::DoubleRelease { .. }
                | AllocError::SizeMismatch { .. }
                | AllocError::InvalidLayout { .. }
        )
    }
}
