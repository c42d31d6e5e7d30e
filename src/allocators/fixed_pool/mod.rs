//! A chunked pool of equally sized blocks.
//!
// # Implementation notes
// The pool owns an arena of chunks (newest last in `chunks`, scanned newest
// first). Each chunk is one `RawChunk` cut into `blocks_per_chunk` blocks of
// `block_size` bytes, a free list threaded through its unused blocks and a
// bitmask with one bit per block that is set while the block is handed out.
//
// The free list answers "which block next" in O(1); the bitmask answers
// "is this block live" so that double frees are rejected before the free
// list is touched. Chunks are created lazily and only released when the
// pool is dropped.
//
// [`RawFixedPool`] is the unsynchronized engine, [`FixedSizePool`] is a
// `Mutex` wrapper over it.

use core::ops::Range;
use core::ptr::NonNull;
use std::fmt::Debug;
use std::sync::Mutex;

use static_assertions::const_assert;
use tracing::{debug, instrument, warn, Level};

use crate::chunk::RawChunk;
use crate::error::{AllocError, AllocResult};
use crate::freelist::{Freelist, NODE_ALIGN, NODE_SIZE};
use crate::stats::{Peak, PoolStats};
use crate::util::{lock, round_up, MAX_ALIGN};

#[cfg(test)]
mod tests;

pub const DEFAULT_CHUNK_BYTES: usize = 64 * 1024;

// Blocks must be able to hold a free-list node and chunk starts must keep
// every block node-aligned.
const_assert!(MAX_ALIGN % NODE_ALIGN == 0);
const_assert!(NODE_SIZE % NODE_ALIGN == 0);

const WORD_BITS: usize = u64::BITS as usize;

/// Shape and growth policy of a fixed-size pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FixedPoolConfig {
    /// Requested block size. Rounded up so a block can hold a free-list node.
    pub block_size: usize,
    /// Bytes per chunk; a chunk holds `chunk_bytes / block_size` blocks (at least one).
    pub chunk_bytes: usize,
    /// Upper bound on the number of chunks, `None` for unbounded growth.
    pub max_chunks: Option<usize>,
}

impl FixedPoolConfig {
    pub const fn new(block_size: usize) -> Self {
        FixedPoolConfig {
            block_size,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            max_chunks: None,
        }
    }

    pub const fn chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        self.chunk_bytes = chunk_bytes;
        self
    }

    pub const fn max_chunks(mut self, max_chunks: usize) -> Self {
        self.max_chunks = Some(max_chunks);
        self
    }
}

struct Chunk {
    region: RawChunk,
    free: Freelist,
    allocated: Vec<u64>,
}

impl Chunk {
    fn new(block_size: usize, blocks: usize) -> AllocResult<Self> {
        let size = block_size
            .checked_mul(blocks)
            .ok_or(AllocError::InvalidLayout { size: block_size, align: MAX_ALIGN })?;
        let region = RawChunk::new(size, MAX_ALIGN)?;
        let mut free = Freelist::new();
        // Pushed back to front so blocks are handed out in address order.
        for i in (0..blocks).rev() {
            unsafe { free.push_front(region.start().add(i * block_size)) };
        }
        Ok(Chunk {
            region,
            free,
            allocated: vec![0; blocks.div_ceil(WORD_BITS)],
        })
    }

    #[inline]
    fn is_allocated(&self, index: usize) -> bool {
        self.allocated[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    #[inline]
    fn set_allocated(&mut self, index: usize, value: bool) {
        let word = &mut self.allocated[index / WORD_BITS];
        match value {
            true => *word |= 1 << (index % WORD_BITS),
            false => *word &= !(1 << (index % WORD_BITS)),
        }
    }
}

/// A single threaded fixed-size block pool.
pub struct RawFixedPool {
    config: FixedPoolConfig,
    block_size: usize,
    blocks_per_chunk: usize,
    chunks: Vec<Chunk>,
    in_use: usize,
    peak: Peak,
}

// SAFETY: the pool exclusively owns every chunk and the free lists only point
// into those chunks.
unsafe impl Send for RawFixedPool {}

impl Debug for RawFixedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawFixedPool")
            .field("block_size", &self.block_size)
            .field("blocks_per_chunk", &self.blocks_per_chunk)
            .field("chunks", &self.chunks.len())
            .field("in_use", &self.in_use)
            .finish()
    }
}

impl RawFixedPool {
    /// Creates an empty pool. No memory is allocated until the first block is requested.
    pub fn new(config: FixedPoolConfig) -> AllocResult<Self> {
        let block_size = round_up(config.block_size.max(NODE_SIZE), NODE_ALIGN)
            .filter(|&s| s <= isize::MAX as usize)
            .ok_or(AllocError::InvalidLayout { size: config.block_size, align: NODE_ALIGN })?;
        let blocks_per_chunk = (config.chunk_bytes / block_size).max(1);
        Ok(RawFixedPool {
            config,
            block_size,
            blocks_per_chunk,
            chunks: Vec::new(),
            in_use: 0,
            peak: Peak::new(),
        })
    }

    /// Hands out one block.
    pub fn allocate(&mut self) -> AllocResult<NonNull<u8>> {
        let index = match self.chunks.iter().rposition(|c| !c.free.is_empty()) {
            Some(i) => i,
            None => self.grow()?,
        };
        let chunk = &mut self.chunks[index];
        // SAFETY: the free list only holds unused blocks of this chunk.
        let block = unsafe { chunk.free.pop_front() }
            .ok_or(AllocError::OutOfMemory { requested: self.block_size })?;
        let slot = (block.as_ptr() as usize - chunk.region.start_addr()) / self.block_size;
        debug_assert!(!chunk.is_allocated(slot), "Free block marked as allocated.");
        chunk.set_allocated(slot, true);

        self.in_use += 1;
        self.peak.observe(self.in_use * self.block_size);
        Ok(block)
    }

    /// Hands out up to `count` blocks, appending them to `out`.
    /// Returns how many were handed out; fails only if not even one block could be.
    pub fn allocate_batch(&mut self, count: usize, out: &mut Vec<NonNull<u8>>) -> AllocResult<usize> {
        for n in 0..count {
            match self.allocate() {
                Ok(block) => out.push(block),
                Err(e) if n == 0 => return Err(e),
                Err(_) => return Ok(n),
            }
        }
        Ok(count)
    }

    /// Adds a chunk and returns its index.
    #[instrument(level = "debug", skip(self), err(Debug, level = Level::DEBUG))]
    fn grow(&mut self) -> AllocResult<usize> {
        if self.config.max_chunks.is_some_and(|max| self.chunks.len() >= max) {
            debug!(chunks = self.chunks.len(), "Chunk limit reached.");
            return Err(AllocError::OutOfMemory { requested: self.block_size });
        }
        self.chunks.push(Chunk::new(self.block_size, self.blocks_per_chunk)?);
        debug!(
            chunks = self.chunks.len(),
            blocks = self.blocks_per_chunk,
            block_size = self.block_size,
            "Pool grew by one chunk."
        );
        Ok(self.chunks.len() - 1)
    }

    /// Locates the chunk and block index of `addr`.
    fn locate(&self, addr: usize) -> AllocResult<(usize, usize)> {
        let (chunk_index, offset) = self
            .chunks
            .iter()
            .enumerate()
            .rev()
            .find_map(|(i, c)| c.region.offset_of(addr).map(|o| (i, o)))
            .ok_or(AllocError::not_owned(addr))?;
        if offset % self.block_size != 0 {
            return Err(AllocError::misaligned(addr));
        }
        Ok((chunk_index, offset / self.block_size))
    }

    /// Returns a block to its chunk's free list.
    ///
    /// Foreign, misaligned or already free pointers are rejected and leave the pool untouched.
    pub fn deallocate(&mut self, ptr: NonNull<u8>) -> AllocResult<()> {
        let addr = ptr.as_ptr() as usize;
        let (chunk_index, slot) = self.locate(addr).inspect_err(|e| {
            warn!(addr, error = %e, "Rejected deallocation.");
        })?;
        let chunk = &mut self.chunks[chunk_index];
        if !chunk.is_allocated(slot) {
            warn!(addr, "Block freed twice.");
            return Err(AllocError::DoubleRelease { addr });
        }
        chunk.set_allocated(slot, false);
        // SAFETY: the block belongs to this chunk and is no longer handed out.
        unsafe { chunk.free.push_front(ptr.as_ptr()) };
        self.in_use -= 1;
        Ok(())
    }

    /// Returns every block yielded by `blocks`. Invalid pointers are skipped;
    /// the first error encountered is reported after all valid blocks are back.
    pub fn deallocate_batch<I>(&mut self, blocks: I) -> AllocResult<()>
    where
        I: IntoIterator<Item = NonNull<u8>>,
    {
        let mut first_error = None;
        for block in blocks {
            if let Err(e) = self.deallocate(block) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Returns whether `ptr` points into one of the pool's chunks.
    pub fn is_from_pool(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        self.chunks.iter().any(|c| c.region.contains(addr))
    }

    /// Returns whether `ptr` is a block currently handed out by the pool.
    pub fn is_allocated(&self, ptr: *const u8) -> bool {
        self.locate(ptr as usize)
            .map(|(c, slot)| self.chunks[c].is_allocated(slot))
            .unwrap_or(false)
    }

    /// Address ranges of every chunk, newest last.
    pub fn chunk_ranges(&self) -> Vec<Range<usize>> {
        self.chunks
            .iter()
            .map(|c| c.region.start_addr()..c.region.end_addr())
            .collect()
    }

    /// The effective block size.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn blocks_per_chunk(&self) -> usize {
        self.blocks_per_chunk
    }

    #[inline]
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn stats(&self) -> PoolStats {
        let available: usize = self.chunks.iter().map(|c| c.free.len()).sum();
        PoolStats {
            bytes_used: self.in_use * self.block_size,
            bytes_remaining: available * self.block_size,
            allocated_count: self.in_use,
            available_count: available,
            peak_usage: self.peak.get(),
            chunk_count: self.chunks.len(),
        }
    }
}

/// A thread-safe fixed-size block pool.
///
/// This is a `Mutex` wrapper over [`RawFixedPool`]; every operation holds the
/// pool-wide lock for its whole duration.
pub struct FixedSizePool {
    inner: Mutex<RawFixedPool>,
    block_size: usize,
}

impl Debug for FixedSizePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FixedSizePool").field(&*lock(&self.inner)).finish()
    }
}

impl FixedSizePool {
    /// Creates a pool of `block_size`-byte blocks with the default chunk size.
    pub fn new(block_size: usize) -> AllocResult<Self> {
        Self::with_config(FixedPoolConfig::new(block_size))
    }

    pub fn with_config(config: FixedPoolConfig) -> AllocResult<Self> {
        let raw = RawFixedPool::new(config)?;
        Ok(FixedSizePool {
            block_size: raw.block_size(),
            inner: Mutex::new(raw),
        })
    }

    #[inline]
    pub fn allocate(&self) -> AllocResult<NonNull<u8>> {
        lock(&self.inner).allocate()
    }

    #[inline]
    pub fn deallocate(&self, ptr: NonNull<u8>) -> AllocResult<()> {
        lock(&self.inner).deallocate(ptr)
    }

    /// See [`RawFixedPool::allocate_batch`]. The lock is taken once for the whole batch.
    pub fn allocate_batch(&self, count: usize, out: &mut Vec<NonNull<u8>>) -> AllocResult<usize> {
        lock(&self.inner).allocate_batch(count, out)
    }

    /// See [`RawFixedPool::deallocate_batch`]. The lock is taken once for the whole batch.
    pub fn deallocate_batch<I>(&self, blocks: I) -> AllocResult<()>
    where
        I: IntoIterator<Item = NonNull<u8>>,
    {
        lock(&self.inner).deallocate_batch(blocks)
    }

    pub fn is_from_pool(&self, ptr: *const u8) -> bool {
        lock(&self.inner).is_from_pool(ptr)
    }

    pub fn is_allocated(&self, ptr: *const u8) -> bool {
        lock(&self.inner).is_allocated(ptr)
    }

    pub fn chunk_ranges(&self) -> Vec<Range<usize>> {
        lock(&self.inner).chunk_ranges()
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of blocks currently handed out.
    pub fn in_use(&self) -> usize {
        lock(&self.inner).in_use()
    }

    pub fn chunk_count(&self) -> usize {
        lock(&self.inner).chunk_count()
    }

    pub fn stats(&self) -> PoolStats {
        lock(&self.inner).stats()
    }
}
