//! Segregated free lists over power-of-two size classes.
//!
//! Requests up to [`MAX_CLASS`] bytes are rounded up to the next size class
//! (`16, 32, .., 4096`). A class first reuses its own free list and otherwise
//! bump-allocates a fresh block from the current chunk, starting a new chunk
//! when the current one lacks room. Larger requests go straight to the
//! backing allocator.
//!
//! Routing on deallocation is derived from the size the caller passes, so it
//! must be the size used at allocation. The pool keeps a ledger of live
//! pooled blocks and of large allocations, which lets it reject frees with
//! the wrong size class, double frees and addresses it never handed out
//! before any free list is touched.

use core::alloc::Layout;
use core::ptr::NonNull;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Mutex;

use static_assertions::const_assert;
use tracing::{debug, instrument, warn, Level};

use crate::backing::{Backing, Malloc};
use crate::chunk::RawChunk;
use crate::error::{AllocError, AllocResult};
use crate::freelist::{Freelist, NODE_ALIGN, NODE_SIZE};
use crate::stats::{Peak, PoolStats};
use crate::util::{lock, MAX_ALIGN};

pub const MIN_CLASS: usize = 16;
pub const MAX_CLASS: usize = 4096;
pub const CLASS_COUNT: usize = (MAX_CLASS.trailing_zeros() - MIN_CLASS.trailing_zeros()) as usize + 1;

pub const DEFAULT_CHUNK_BYTES: usize = 64 * 1024;

const_assert!(MIN_CLASS.is_power_of_two() && MAX_CLASS.is_power_of_two());
const_assert!(MIN_CLASS >= NODE_SIZE && MIN_CLASS % NODE_ALIGN == 0);
// Every class is a multiple of MAX_ALIGN, so bumping by whole classes keeps
// every block MAX_ALIGN-aligned.
const_assert!(MIN_CLASS % MAX_ALIGN == 0);

/// Returns the index of the size class serving `size`, or `None` for large requests.
#[inline]
pub fn size_class_index(size: usize) -> Option<usize> {
    (size <= MAX_CLASS).then(|| {
        (size.max(MIN_CLASS).next_power_of_two().trailing_zeros() - MIN_CLASS.trailing_zeros()) as usize
    })
}

/// Returns the block size serving `size`, or `None` for large requests.
#[inline]
pub fn size_class_for(size: usize) -> Option<usize> {
    size_class_index(size).map(|i| MIN_CLASS << i)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VariablePoolConfig {
    /// Bytes per chunk. Never less than [`MAX_CLASS`].
    pub chunk_bytes: usize,
    /// Upper bound on the number of chunks, `None` for unbounded growth.
    pub max_chunks: Option<usize>,
}

impl VariablePoolConfig {
    pub const fn new() -> Self {
        VariablePoolConfig { chunk_bytes: DEFAULT_CHUNK_BYTES, max_chunks: None }
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

impl Default for VariablePoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Usage of one size class.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SizeClassStats {
    pub block_size: usize,
    pub in_use: usize,
    pub free: usize,
}

struct SizeClass {
    block_size: usize,
    free: Freelist,
    in_use: usize,
}

struct State<B> {
    config: VariablePoolConfig,
    classes: [SizeClass; CLASS_COUNT],
    /// Oldest first; the last chunk is the one being bump-allocated from.
    chunks: Vec<RawChunk>,
    offset: usize,
    pooled_bytes: usize,
    peak: Peak,
    /// Live requests above `MAX_CLASS`, by address.
    large: HashMap<usize, usize>,
    large_bytes: usize,
    /// Live pooled blocks, by address, with their class index.
    live: HashMap<usize, usize>,
    backing: B,
}

// SAFETY: the state exclusively owns its chunks and large blocks; free lists
// only point into owned chunks.
unsafe impl<B: Send> Send for State<B> {}

#[inline]
fn large_layout(size: usize) -> AllocResult<Layout> {
    Layout::from_size_align(size, MAX_ALIGN)
        .map_err(|_| AllocError::InvalidLayout { size, align: MAX_ALIGN })
}

impl<B: Backing> State<B> {
    fn new(config: VariablePoolConfig, backing: B) -> Self {
        State {
            config: VariablePoolConfig {
                chunk_bytes: config.chunk_bytes.max(MAX_CLASS),
                ..config
            },
            classes: core::array::from_fn(|i| SizeClass {
                block_size: MIN_CLASS << i,
                free: Freelist::new(),
                in_use: 0,
            }),
            chunks: Vec::new(),
            offset: 0,
            pooled_bytes: 0,
            peak: Peak::new(),
            large: HashMap::new(),
            large_bytes: 0,
            live: HashMap::new(),
            backing,
        }
    }

    fn allocate(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        let Some(index) = size_class_index(size) else {
            return self.allocate_large(size);
        };
        let block_size = self.classes[index].block_size;
        // SAFETY: class free lists only hold unused blocks of owned chunks.
        let block = match unsafe { self.classes[index].free.pop_front() } {
            Some(block) => block,
            None => self.bump(block_size)?,
        };

        self.classes[index].in_use += 1;
        self.pooled_bytes += block_size;
        self.peak.observe(self.pooled_bytes);
        self.live.insert(block.as_ptr() as usize, index);
        Ok(block)
    }

    fn bump(&mut self, block_size: usize) -> AllocResult<NonNull<u8>> {
        let fits = self
            .chunks
            .last()
            .is_some_and(|c| c.len() - self.offset >= block_size);
        if !fits {
            self.grow()?;
        }
        let chunk = self.chunks.last().ok_or(AllocError::OutOfMemory { requested: block_size })?;
        // SAFETY: `offset + block_size <= chunk.len()` was checked or the chunk is fresh
        // and `chunk_bytes >= MAX_CLASS`.
        let block = unsafe { NonNull::new_unchecked(chunk.start().add(self.offset)) };
        self.offset += block_size;
        Ok(block)
    }

    #[instrument(level = "debug", skip(self), err(Debug, level = Level::DEBUG))]
    fn grow(&mut self) -> AllocResult<()> {
        if self.config.max_chunks.is_some_and(|max| self.chunks.len() >= max) {
            debug!(chunks = self.chunks.len(), "Chunk limit reached.");
            return Err(AllocError::OutOfMemory { requested: self.config.chunk_bytes });
        }
        self.chunks.push(RawChunk::new(self.config.chunk_bytes, MAX_ALIGN)?);
        self.offset = 0;
        debug!(chunks = self.chunks.len(), "Pool grew by one chunk.");
        Ok(())
    }

    fn allocate_large(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        let layout = large_layout(size)?;
        let block = unsafe { self.backing.alloc(layout) }
            .map_err(|()| AllocError::OutOfMemory { requested: size })?;
        self.large.insert(block.as_ptr() as usize, size);
        self.large_bytes += size;
        debug!(size, addr = ?block.as_ptr(), "Large allocation bypassed the pool.");
        Ok(block)
    }

    fn owning_chunk(&self, addr: usize) -> Option<&RawChunk> {
        self.chunks.iter().rev().find(|c| c.contains(addr))
    }

    fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) -> AllocResult<()> {
        let addr = ptr.as_ptr() as usize;
        let Some(index) = size_class_index(size) else {
            return self.deallocate_large(ptr, size);
        };
        let block_size = self.classes[index].block_size;

        let Some(chunk) = self.owning_chunk(addr) else {
            if self.large.contains_key(&addr) {
                return Err(AllocError::SizeMismatch { addr, size });
            }
            return Err(AllocError::not_owned(addr));
        };
        if addr % MAX_ALIGN != 0 {
            return Err(AllocError::misaligned(addr));
        }
        if addr + block_size > chunk.end_addr() {
            return Err(AllocError::SizeMismatch { addr, size });
        }
        self.retire(addr, index, size)?;

        let class = &mut self.classes[index];
        // SAFETY: the block is inside an owned chunk and no longer handed out.
        unsafe { class.free.push_front(ptr.as_ptr()) };
        class.in_use -= 1;
        self.pooled_bytes -= block_size;
        Ok(())
    }

    /// Removes a pooled block from the live ledger, checking its class.
    fn retire(&mut self, addr: usize, index: usize, size: usize) -> AllocResult<()> {
        match self.live.get(&addr) {
            None => Err(AllocError::DoubleRelease { addr }),
            Some(&live) if live != index => Err(AllocError::SizeMismatch { addr, size }),
            Some(_) => {
                self.live.remove(&addr);
                Ok(())
            }
        }
    }

    fn deallocate_large(&mut self, ptr: NonNull<u8>, size: usize) -> AllocResult<()> {
        let addr = ptr.as_ptr() as usize;
        match self.large.get(&addr) {
            Some(&recorded) if recorded == size => {}
            Some(_) => return Err(AllocError::SizeMismatch { addr, size }),
            None if self.owning_chunk(addr).is_some() => {
                return Err(AllocError::SizeMismatch { addr, size })
            }
            None => return Err(AllocError::not_owned(addr)),
        }
        let layout = large_layout(size)?;
        self.large.remove(&addr);
        self.large_bytes -= size;
        unsafe { self.backing.free(ptr, layout) };
        Ok(())
    }

    fn stats(&self) -> PoolStats {
        let available: usize = self.classes.iter().map(|c| c.free.len()).sum();
        let free_bytes: usize = self.classes.iter().map(|c| c.free.len() * c.block_size).sum();
        let tail = self.chunks.last().map_or(0, |c| c.len() - self.offset);
        PoolStats {
            bytes_used: self.pooled_bytes,
            bytes_remaining: free_bytes + tail,
            allocated_count: self.classes.iter().map(|c| c.in_use).sum(),
            available_count: available,
            peak_usage: self.peak.get(),
            chunk_count: self.chunks.len(),
        }
    }
}

/// A thread-safe segregated-fit pool with power-of-two size classes.
pub struct VariableSizePool<B: Backing = Malloc> {
    inner: Mutex<State<B>>,
}

impl<B: Backing> Debug for VariableSizePool<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner);
        f.debug_struct("VariableSizePool")
            .field("chunks", &state.chunks.len())
            .field("pooled_bytes", &state.pooled_bytes)
            .field("large_allocations", &state.large.len())
            .finish()
    }
}

impl VariableSizePool<Malloc> {
    pub fn new() -> Self {
        Self::with_config(VariablePoolConfig::new())
    }

    pub fn with_config(config: VariablePoolConfig) -> Self {
        Self::with_backing(config, Malloc)
    }
}

impl Default for VariableSizePool<Malloc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backing> VariableSizePool<B> {
    /// Creates a pool whose large requests go to `backing`.
    pub fn with_backing(config: VariablePoolConfig, backing: B) -> Self {
        VariableSizePool { inner: Mutex::new(State::new(config, backing)) }
    }

    /// Allocates at least `size` bytes aligned to [`MAX_ALIGN`].
    pub fn allocate(&self, size: usize) -> AllocResult<NonNull<u8>> {
        lock(&self.inner).allocate(size)
    }

    /// Returns a block to its size class, or a large block to the backing.
    ///
    /// `size` must be the size passed to [`allocate`](Self::allocate).
    pub fn deallocate(&self, ptr: NonNull<u8>, size: usize) -> AllocResult<()> {
        lock(&self.inner).deallocate(ptr, size).inspect_err(|e| {
            warn!(addr = ?ptr.as_ptr(), size, error = %e, "Rejected deallocation.");
        })
    }

    /// Returns whether `ptr` lies inside one of the pool's chunks.
    pub fn is_from_pool(&self, ptr: *const u8) -> bool {
        lock(&self.inner).owning_chunk(ptr as usize).is_some()
    }

    /// Per-class usage, smallest class first.
    pub fn size_classes(&self) -> Vec<SizeClassStats> {
        lock(&self.inner)
            .classes
            .iter()
            .map(|c| SizeClassStats {
                block_size: c.block_size,
                in_use: c.in_use,
                free: c.free.len(),
            })
            .collect()
    }

    /// Number of live requests that bypassed the pool.
    pub fn large_allocations(&self) -> usize {
        lock(&self.inner).large.len()
    }

    pub fn large_bytes(&self) -> usize {
        lock(&self.inner).large_bytes
    }

    /// Statistics of the pooled size classes. Large requests are not included.
    pub fn stats(&self) -> PoolStats {
        lock(&self.inner).stats()
    }
}

impl<B: Backing> Drop for VariableSizePool<B> {
    fn drop(&mut self) {
        let state = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        if !state.large.is_empty() {
            debug!(count = state.large.len(), "Freeing outstanding large allocations.");
        }
        for (addr, size) in state.large.drain() {
            if let (Some(ptr), Ok(layout)) = (NonNull::new(addr as *mut u8), large_layout(size)) {
                unsafe { state.backing.free(ptr, layout) };
            }
        }
        state.large_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::limited::LimitedBacking;
    use crate::error::DeallocFault;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_size_classes() {
        assert_eq!(CLASS_COUNT, 9);
        assert_eq!(size_class_for(0), Some(16));
        assert_eq!(size_class_for(1), Some(16));
        assert_eq!(size_class_for(16), Some(16));
        assert_eq!(size_class_for(17), Some(32));
        assert_eq!(size_class_for(48), Some(64));
        assert_eq!(size_class_for(4096), Some(4096));
        assert_eq!(size_class_for(4097), None);
        assert_eq!(size_class_index(48), Some(2));
    }

    #[test]
    fn test_reuse_in_class() {
        let pool = VariableSizePool::new();
        let p = pool.allocate(48).unwrap();
        assert_eq!(pool.size_classes()[2].in_use, 1);
        pool.deallocate(p, 48).unwrap();

        let classes = pool.size_classes();
        assert_eq!(classes[2], SizeClassStats { block_size: 64, in_use: 0, free: 1 });
        // Any request of the 64-byte class reuses the block.
        assert_eq!(pool.allocate(60).unwrap(), p);
        assert_eq!(pool.size_classes()[2].free, 0);
    }

    #[test]
    fn test_distinct_blocks() {
        let pool = VariableSizePool::with_config(VariablePoolConfig::new().chunk_bytes(4096));
        let mut rng = StdRng::seed_from_u64(48);
        let mut live = vec![];
        for _ in 0..2_000 {
            let size = rng.gen_range(1..=MAX_CLASS);
            let p = pool.allocate(size).unwrap();
            assert_eq!(p.as_ptr() as usize % MAX_ALIGN, 0);
            unsafe { p.as_ptr().write_bytes(0x5A, size) };
            live.push((p.as_ptr() as usize, size));
            if rng.gen_bool(0.4) {
                let (addr, size) = live.swap_remove(rng.gen_range(0..live.len()));
                pool.deallocate(NonNull::new(addr as *mut u8).unwrap(), size).unwrap();
            }
        }

        let mut ranges: Vec<_> = live
            .iter()
            .map(|&(addr, size)| (addr, addr + size_class_for(size).unwrap()))
            .collect();
        ranges.sort_unstable();
        for w in ranges.windows(2) {
            assert!(w[0].1 <= w[1].0, "Live blocks overlap.");
        }
        assert_eq!(pool.stats().allocated_count, live.len());
        for (addr, size) in live {
            pool.deallocate(NonNull::new(addr as *mut u8).unwrap(), size).unwrap();
        }
        assert_eq!(pool.stats().bytes_used, 0);
    }

    #[test]
    fn test_large_bypass() {
        let pool = VariableSizePool::new();
        let p = pool.allocate(10_000).unwrap();
        assert!(!pool.is_from_pool(p.as_ptr()));
        assert_eq!(pool.large_allocations(), 1);
        assert_eq!(pool.large_bytes(), 10_000);
        assert_eq!(pool.stats().bytes_used, 0);
        assert_eq!(pool.stats().chunk_count, 0);

        assert_eq!(
            pool.deallocate(p, 64).unwrap_err(),
            AllocError::SizeMismatch { addr: p.as_ptr() as usize, size: 64 }
        );
        assert_eq!(
            pool.deallocate(p, 9_999).unwrap_err(),
            AllocError::SizeMismatch { addr: p.as_ptr() as usize, size: 9_999 }
        );
        pool.deallocate(p, 10_000).unwrap();
        assert_eq!(pool.large_allocations(), 0);
        assert_eq!(
            pool.deallocate(p, 10_000).unwrap_err(),
            AllocError::not_owned(p.as_ptr() as usize)
        );
    }

    #[test]
    fn test_pooled_freed_as_large() {
        let pool = VariableSizePool::new();
        let p = pool.allocate(100).unwrap();
        assert_eq!(
            pool.deallocate(p, 8_000).unwrap_err(),
            AllocError::SizeMismatch { addr: p.as_ptr() as usize, size: 8_000 }
        );
        assert_eq!(pool.stats().allocated_count, 1);
        pool.deallocate(p, 100).unwrap();
    }

    #[test]
    fn test_class_mismatch() {
        let pool = VariableSizePool::new();
        let p = pool.allocate(48).unwrap();
        assert_eq!(
            pool.deallocate(p, 16).unwrap_err(),
            AllocError::SizeMismatch { addr: p.as_ptr() as usize, size: 16 }
        );
        assert_eq!(pool.size_classes()[0].free, 0);
        pool.deallocate(p, 33).unwrap();
        assert_eq!(
            pool.deallocate(p, 48).unwrap_err(),
            AllocError::DoubleRelease { addr: p.as_ptr() as usize }
        );
        assert_eq!(pool.size_classes()[2].free, 1);
    }

    #[test]
    fn test_double_free_keeps_lists_sound() {
        let pool = VariableSizePool::new();
        let p = pool.allocate(64).unwrap();
        pool.deallocate(p, 64).unwrap();
        assert_eq!(
            pool.deallocate(p, 64).unwrap_err(),
            AllocError::DoubleRelease { addr: p.as_ptr() as usize }
        );
        assert_eq!(pool.size_classes()[2].free, 1);

        // Inside the chunk, but never handed out.
        let next = NonNull::new(p.as_ptr().wrapping_add(64)).unwrap();
        assert_eq!(
            pool.deallocate(next, 64).unwrap_err(),
            AllocError::DoubleRelease { addr: next.as_ptr() as usize }
        );

        let a = pool.allocate(64).unwrap();
        let b = pool.allocate(64).unwrap();
        assert_ne!(a, b, "A block was handed out twice.");
        assert_eq!(pool.stats().allocated_count, 2);
    }

    #[test]
    fn test_foreign_pointer() {
        let pool = VariableSizePool::new();
        let _p = pool.allocate(32).unwrap();
        let mut local = [0_u8; 32];
        let foreign = NonNull::new(local.as_mut_ptr()).unwrap();
        assert_eq!(
            pool.deallocate(foreign, 32).unwrap_err(),
            AllocError::InvalidDeallocation {
                addr: foreign.as_ptr() as usize,
                fault: DeallocFault::NotOwned,
            }
        );
    }

    #[test]
    fn test_chunk_growth() {
        let pool = VariableSizePool::with_config(VariablePoolConfig::new().chunk_bytes(4096).max_chunks(2));
        let a = pool.allocate(4096).unwrap();
        assert_eq!(pool.stats().chunk_count, 1);
        let b = pool.allocate(16).unwrap();
        assert_eq!(pool.stats().chunk_count, 2);
        assert_eq!(pool.stats().bytes_remaining, 4096 - 16);
        let mut rest = vec![];
        for _ in 0..255 {
            rest.push(pool.allocate(16).unwrap());
        }
        assert_eq!(
            pool.allocate(16).unwrap_err(),
            AllocError::OutOfMemory { requested: 4096 }
        );
        pool.deallocate(b, 16).unwrap();
        assert_eq!(pool.allocate(10).unwrap(), b);
        pool.deallocate(a, 4096).unwrap();
        assert_eq!(pool.stats().peak_usage, 4096 + 256 * 16);
    }

    #[test]
    fn test_large_backing_failure() {
        let backing = LimitedBacking::new(1);
        let pool = VariableSizePool::with_backing(VariablePoolConfig::new(), &backing);
        let p = pool.allocate(5_000).unwrap();
        assert_eq!(
            pool.allocate(5_000).unwrap_err(),
            AllocError::OutOfMemory { requested: 5_000 }
        );
        // Pooled sizes do not touch the backing.
        pool.allocate(64).unwrap();
        pool.deallocate(p, 5_000).unwrap();
        assert_eq!(backing.freed.load(std::sync::atomic::Ordering::Acquire), 1);
    }

    #[test]
    fn test_drop_frees_large() {
        let backing = LimitedBacking::new(3);
        {
            let pool = VariableSizePool::with_backing(VariablePoolConfig::new(), &backing);
            pool.allocate(8_000).unwrap();
            pool.allocate(9_000).unwrap();
        }
        assert_eq!(backing.freed.load(std::sync::atomic::Ordering::Acquire), 2);
    }
}
