//! Defines [`RawChunk`], the unit of memory every growing pool is built from.

use core::alloc::Layout;
use core::ptr::NonNull;

use tracing::debug;

use crate::backing::{Backing, Malloc};
use crate::error::{AllocError, AllocResult};

/// A contiguous, aligned byte region owned by exactly one allocator.
/// The memory goes back to the backing when the chunk is dropped,
/// so a pool's teardown is just dropping its chunk arena.
#[derive(Debug)]
pub(crate) struct RawChunk {
    start: NonNull<u8>,
    layout: Layout,
}

// SAFETY: a chunk exclusively owns its region.
unsafe impl Send for RawChunk {}

impl RawChunk {
    /// Allocates a chunk of `size` bytes aligned to `align`.
    pub(crate) fn new(size: usize, align: usize) -> AllocResult<Self> {
        let layout = Layout::from_size_align(size, align)
            .map_err(|_| AllocError::InvalidLayout { size, align })?;
        let start = unsafe { Malloc.alloc(layout) }
            .map_err(|()| AllocError::OutOfMemory { requested: size })?;
        debug!(start = ?start.as_ptr(), size, align, "Chunk allocated.");
        Ok(RawChunk { start, layout })
    }

    #[inline(always)]
    pub(crate) fn start(&self) -> *mut u8 {
        self.start.as_ptr()
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.layout.size()
    }

    #[inline(always)]
    pub(crate) fn start_addr(&self) -> usize {
        self.start.as_ptr() as usize
    }

    #[inline(always)]
    pub(crate) fn end_addr(&self) -> usize {
        self.start_addr() + self.len()
    }

    /// Returns whether `addr` lies in `[start, end)`.
    #[inline]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.start_addr() <= addr && addr < self.end_addr()
    }

    /// Returns the offset of `addr` from the chunk start if the chunk contains it.
    #[inline]
    pub(crate) fn offset_of(&self, addr: usize) -> Option<usize> {
        self.contains(addr).then(|| addr - self.start_addr())
    }
}

impl Drop for RawChunk {
    fn drop(&mut self) {
        unsafe { Malloc.free(self.start, self.layout) }
    }
}
