//! A bump allocator over a fixed buffer with LIFO deallocation.
//!
//! Allocations are carved from the top of a `SIZE`-byte buffer. Only the most
//! recent allocation can be returned; anything else is rejected with
//! [`DeallocFault::OutOfOrder`] and leaves the allocator untouched.
//!
//! The allocator is not synchronized. Every mutating method takes `&mut self`,
//! so sharing it between threads requires an external lock.

use core::ptr::NonNull;

use tracing::{debug, warn};

use crate::chunk::RawChunk;
use crate::error::{AllocError, AllocResult, DeallocFault};
use crate::stats::{Peak, PoolStats};
use crate::util::{find_aligned, validate_layout, MAX_ALIGN};

/// A saved stack top, see [`StackAllocator::marker`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Marker {
    top: usize,
    depth: usize,
}

/// One live allocation.
#[derive(Copy, Clone, Debug)]
struct Frame {
    /// The top before the allocation, so that popping it also gives back
    /// the padding that preceded it.
    below: usize,
    start: usize,
}

pub struct StackAllocator<const SIZE: usize> {
    buffer: RawChunk,
    top: usize,
    frames: Vec<Frame>,
    peak: Peak,
}

impl<const SIZE: usize> std::fmt::Debug for StackAllocator<SIZE> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackAllocator")
            .field("capacity", &SIZE)
            .field("top", &self.top)
            .field("live", &self.frames.len())
            .finish()
    }
}

impl<const SIZE: usize> StackAllocator<SIZE> {
    /// Creates an allocator with a freshly allocated `SIZE`-byte buffer.
    pub fn new() -> AllocResult<Self> {
        Ok(StackAllocator {
            buffer: RawChunk::new(SIZE, MAX_ALIGN)?,
            top: 0,
            frames: Vec::new(),
            peak: Peak::default(),
        })
    }

    /// Allocates `size` bytes aligned to [`MAX_ALIGN`].
    #[inline]
    pub fn allocate(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        self.allocate_aligned(size, MAX_ALIGN)
    }

    /// Allocates `size` bytes aligned to `align` from the top of the buffer.
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> AllocResult<NonNull<u8>> {
        validate_layout(size, align)?;
        let base = self.buffer.start();
        let cursor = base.wrapping_add(self.top);
        let offset = find_aligned(cursor, align)
            .map(|p| p as usize - base as usize)
            .ok_or(AllocError::OutOfMemory { requested: size })?;
        let end = match offset.checked_add(size) {
            Some(end) if end <= SIZE => end,
            _ => {
                debug!(size, align, top = self.top, capacity = SIZE, "Stack buffer exhausted.");
                return Err(AllocError::OutOfMemory { requested: size });
            }
        };

        self.frames.push(Frame { below: self.top, start: offset });
        self.top = end;
        self.peak.observe(end);
        // SAFETY: `offset <= SIZE` so the pointer is inside (or one past) the buffer.
        Ok(unsafe { NonNull::new_unchecked(base.add(offset)) })
    }

    /// Returns the most recent allocation to the buffer.
    ///
    /// `ptr` must be the start of the last allocation and `ptr + size` the
    /// current top; any other span is reported as out of order and nothing
    /// changes.
    pub fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) -> AllocResult<()> {
        let addr = ptr.as_ptr() as usize;
        let offset = match addr.checked_sub(self.buffer.start_addr()) {
            Some(offset) if offset <= SIZE => offset,
            _ => {
                warn!(addr, "Deallocation of a pointer foreign to the stack.");
                return Err(AllocError::not_owned(addr));
            }
        };
        let last = self
            .frames
            .last()
            .filter(|f| f.start == offset && offset.checked_add(size) == Some(self.top));
        let Some(&Frame { below, .. }) = last else {
            warn!(addr, size, top = self.top, "Out-of-order stack deallocation.");
            return Err(AllocError::InvalidDeallocation {
                addr,
                fault: DeallocFault::OutOfOrder { top: self.top },
            });
        };

        self.top = below;
        self.frames.pop();
        Ok(())
    }

    /// Returns a marker for the current top.
    #[inline]
    pub fn marker(&self) -> Marker {
        Marker { top: self.top, depth: self.frames.len() }
    }

    /// Releases every allocation made after `marker` was taken.
    ///
    /// Fails if the stack has already been unwound below the marker.
    pub fn rewind(&mut self, marker: Marker) -> AllocResult<()> {
        if marker.top > self.top || marker.depth > self.frames.len() {
            warn!(marker = marker.top, top = self.top, "Rewind to a stale marker.");
            return Err(AllocError::InvalidDeallocation {
                addr: self.buffer.start_addr() + marker.top,
                fault: DeallocFault::OutOfOrder { top: self.top },
            });
        }
        self.top = marker.top;
        self.frames.truncate(marker.depth);
        Ok(())
    }

    /// Drops every allocation at once.
    pub fn reset(&mut self) {
        debug!(top = self.top, live = self.frames.len(), "Stack reset.");
        self.top = 0;
        self.frames.clear();
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        SIZE
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.top
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        SIZE - self.top
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            bytes_used: self.used(),
            bytes_remaining: self.remaining(),
            allocated_count: self.frames.len(),
            available_count: 0,
            peak_usage: self.peak.get(),
            chunk_count: 1,
        }
    }
}
