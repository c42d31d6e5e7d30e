//! A grow-only chunked arena.
//!
//! Allocations bump a cursor through the newest chunk. When it runs out of
//! room a fresh `CHUNK`-byte chunk takes over; older chunks are never
//! allocated from again and are only released by [`reset`] or drop.
//! There is no per-object deallocation.
//!
//! Like [`StackAllocator`](crate::StackAllocator) this allocator is not
//! synchronized and is meant for a single writer.
//!
//! [`reset`]: MonotonicAllocator::reset

use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use tracing::{debug, instrument, Level};

use crate::chunk::RawChunk;
use crate::error::{AllocError, AllocResult};
use crate::stats::{Peak, PoolStats};
use crate::util::{find_aligned, validate_layout, MAX_ALIGN};

pub const DEFAULT_CHUNK_SIZE: usize = 4096;

pub struct MonotonicAllocator<const CHUNK: usize = DEFAULT_CHUNK_SIZE> {
    /// Oldest first; the last chunk is the one being bump-allocated from.
    chunks: Vec<RawChunk>,
    offset: usize,
    /// Bytes consumed in retired chunks.
    retired: usize,
    total_allocated: usize,
    allocation_count: usize,
    peak: Peak,
}

impl<const CHUNK: usize> std::fmt::Debug for MonotonicAllocator<CHUNK> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonotonicAllocator")
            .field("chunk_size", &CHUNK)
            .field("chunks", &self.chunks.len())
            .field("offset", &self.offset)
            .field("total_allocated", &self.total_allocated)
            .finish()
    }
}

impl<const CHUNK: usize> Default for MonotonicAllocator<CHUNK> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CHUNK: usize> MonotonicAllocator<CHUNK> {
    /// Creates an empty arena. The first chunk is allocated on first use.
    pub const fn new() -> Self {
        MonotonicAllocator {
            chunks: Vec::new(),
            offset: 0,
            retired: 0,
            total_allocated: 0,
            allocation_count: 0,
            peak: Peak::new(),
        }
    }

    /// Allocates `size` bytes aligned to [`MAX_ALIGN`].
    #[inline]
    pub fn allocate(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        self.allocate_aligned(size, MAX_ALIGN)
    }

    /// Allocates `size` bytes aligned to `align`.
    ///
    /// Requests larger than a chunk can never be satisfied and fail with
    /// [`AllocError::OutOfMemory`] without growing the arena.
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> AllocResult<NonNull<u8>> {
        validate_layout(size, align)?;
        if size > CHUNK {
            debug!(size, chunk_size = CHUNK, "Request larger than a chunk.");
            return Err(AllocError::OutOfMemory { requested: size });
        }

        let ptr = match self.bump(size, align) {
            Some(p) => p,
            None => {
                self.grow(align)?;
                // A fresh chunk is aligned to at least `align`, so the request fits at offset 0.
                self.bump(size, align)
                    .ok_or(AllocError::OutOfMemory { requested: size })?
            }
        };

        self.total_allocated += size;
        self.allocation_count += 1;
        self.peak.observe(self.total_allocated);
        Ok(ptr)
    }

    /// Moves `value` into the arena and returns a pointer to it.
    ///
    /// The arena never runs destructors: the value is leaked in place when the
    /// arena is reset or dropped.
    pub fn alloc_value<T>(&mut self, value: T) -> AllocResult<NonNull<T>> {
        let p = self.allocate_aligned(size_of::<T>(), align_of::<T>())?.cast::<T>();
        unsafe { p.as_ptr().write(value) };
        Ok(p)
    }

    fn bump(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let chunk = self.chunks.last()?;
        let base = chunk.start();
        let offset = find_aligned(base.wrapping_add(self.offset), align)? as usize - base as usize;
        let end = offset.checked_add(size).filter(|&end| end <= CHUNK)?;
        self.offset = end;
        // SAFETY: `offset <= CHUNK` keeps the pointer inside (or one past) the chunk.
        Some(unsafe { NonNull::new_unchecked(base.add(offset)) })
    }

    #[instrument(level = "debug", skip(self), err(Debug, level = Level::ERROR))]
    fn grow(&mut self, align: usize) -> AllocResult<()> {
        let chunk = RawChunk::new(CHUNK, align.max(MAX_ALIGN))?;
        if !self.chunks.is_empty() {
            self.retired += self.offset;
        }
        self.chunks.push(chunk);
        self.offset = 0;
        debug!(chunks = self.chunks.len(), "Arena grew by one chunk.");
        Ok(())
    }

    /// Releases every allocation at once.
    ///
    /// All chunks but the oldest are freed; the oldest one is kept, empty, for
    /// the allocations that follow.
    pub fn reset(&mut self) {
        debug!(
            chunks = self.chunks.len(),
            total_allocated = self.total_allocated,
            "Arena reset."
        );
        self.chunks.truncate(1);
        self.offset = 0;
        self.retired = 0;
        self.total_allocated = 0;
        self.allocation_count = 0;
    }

    /// Bytes requested since construction or the last reset.
    #[inline]
    pub fn total_allocated(&self) -> usize {
        self.total_allocated
    }

    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    #[inline]
    pub const fn chunk_size(&self) -> usize {
        CHUNK
    }

    pub fn stats(&self) -> PoolStats {
        let remaining = match self.chunks.is_empty() {
            true => 0,
            false => CHUNK - self.offset,
        };
        PoolStats {
            bytes_used: self.retired + self.offset,
            bytes_remaining: remaining,
            allocated_count: self.allocation_count,
            available_count: 0,
            peak_usage: self.peak.get(),
            chunk_count: self.chunks.len(),
        }
    }
}
