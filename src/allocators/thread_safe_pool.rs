//! A fixed-size pool with per-thread block caches.
//!
//! Every thread that touches the pool gets a small cache of free blocks,
//! registered under its [`ThreadId`]. Allocations pop from the cache and only
//! go to the shared [`FixedSizePool`] when it is empty, refilling
//! [`REFILL_BATCH`] blocks under a single lock acquisition. Deallocations
//! push onto the cache and spill to the shared pool once it is full.
//!
//! A thread can hold an explicit [`ThreadContext`] to skip the registry
//! lookup on every call; dropping the context returns its cached blocks to
//! the shared pool. Blocks still cached when the pool itself is dropped are
//! returned first as well.
//!
//! Cached blocks count as "in use" for the shared pool. Up to
//! [`CACHE_CAPACITY`] blocks per thread can be stranded this way until the
//! caches are drained.
//!
//! Whether a block is currently handed out to a caller is tracked separately,
//! one bit per block, so that a block sitting in any thread's cache or free in
//! the shared pool is rejected with [`AllocError::DoubleRelease`] no matter
//! which thread returns it.

use core::marker::PhantomData;
use core::ops::Range;
use core::ptr::NonNull;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, ThreadId};

use static_assertions::const_assert;
use tracing::{debug, instrument, warn, Level};

use super::fixed_pool::{FixedPoolConfig, FixedSizePool};
use crate::error::{AllocError, AllocResult};
use crate::stats::PoolStats;
use crate::util::{lock, read, write};

pub const CACHE_CAPACITY: usize = 32;
pub const REFILL_BATCH: usize = CACHE_CAPACITY / 2;

const_assert!(REFILL_BATCH > 0);
const_assert!(REFILL_BATCH <= CACHE_CAPACITY);

struct ThreadCache {
    blocks: [*mut u8; CACHE_CAPACITY],
    len: usize,
}

// SAFETY: the cached pointers are free blocks of the shared pool, not tied to a thread.
unsafe impl Send for ThreadCache {}

impl ThreadCache {
    const fn new() -> Self {
        ThreadCache { blocks: [core::ptr::null_mut(); CACHE_CAPACITY], len: 0 }
    }

    #[inline]
    fn pop(&mut self) -> Option<NonNull<u8>> {
        self.len = self.len.checked_sub(1)?;
        NonNull::new(self.blocks[self.len])
    }

    #[inline]
    fn push(&mut self, block: NonNull<u8>) -> bool {
        if self.len == CACHE_CAPACITY {
            return false;
        }
        self.blocks[self.len] = block.as_ptr();
        self.len += 1;
        true
    }

    fn take(&mut self) -> impl Iterator<Item = NonNull<u8>> + '_ {
        let len = core::mem::take(&mut self.len);
        self.blocks[..len].iter().filter_map(|&p| NonNull::new(p))
    }
}

type CacheHandle = Arc<Mutex<ThreadCache>>;

/// Address range of one chunk of the shared pool and the handed-out bit of
/// each of its blocks.
struct ChunkMap {
    range: Range<usize>,
    slots: usize,
    handed_out: Box<[AtomicU64]>,
}

impl ChunkMap {
    fn new(range: Range<usize>, block_size: usize) -> Self {
        let slots = range.len() / block_size;
        ChunkMap {
            range,
            slots,
            handed_out: (0..slots.div_ceil(64)).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

pub struct ThreadSafeMemoryPool {
    global: FixedSizePool,
    caches: RwLock<HashMap<ThreadId, CacheHandle>>,
    /// One entry per chunk of `global`, in creation order. Only ever appended to.
    maps: RwLock<Vec<ChunkMap>>,
    allocations: AtomicUsize,
    deallocations: AtomicUsize,
}

impl Debug for ThreadSafeMemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadSafeMemoryPool")
            .field("global", &self.global)
            .field("threads", &read(&self.caches).len())
            .finish()
    }
}

impl ThreadSafeMemoryPool {
    pub fn new(block_size: usize) -> AllocResult<Self> {
        Self::with_config(FixedPoolConfig::new(block_size))
    }

    pub fn with_config(config: FixedPoolConfig) -> AllocResult<Self> {
        Ok(ThreadSafeMemoryPool {
            global: FixedSizePool::with_config(config)?,
            caches: RwLock::new(HashMap::new()),
            maps: RwLock::new(Vec::new()),
            allocations: AtomicUsize::new(0),
            deallocations: AtomicUsize::new(0),
        })
    }

    /// Returns the calling thread's context, registering its cache if needed.
    pub fn context(&self) -> ThreadContext<'_> {
        ThreadContext {
            pool: self,
            cache: self.cache(),
            _not_send: PhantomData,
        }
    }

    /// Allocates one block through the calling thread's cache.
    pub fn allocate(&self) -> AllocResult<NonNull<u8>> {
        self.allocate_in(&self.cache())
    }

    /// Returns a block through the calling thread's cache.
    pub fn deallocate(&self, ptr: NonNull<u8>) -> AllocResult<()> {
        self.deallocate_in(&self.cache(), ptr)
    }

    fn cache(&self) -> CacheHandle {
        let id = thread::current().id();
        if let Some(cache) = read(&self.caches).get(&id) {
            return Arc::clone(cache);
        }
        let mut caches = write(&self.caches);
        let cache = caches.entry(id).or_insert_with(|| {
            debug!(thread = ?id, "Registered thread cache.");
            Arc::new(Mutex::new(ThreadCache::new()))
        });
        Arc::clone(cache)
    }

    fn allocate_in(&self, cache: &Mutex<ThreadCache>) -> AllocResult<NonNull<u8>> {
        let mut cache = lock(cache);
        let block = match cache.pop() {
            Some(block) => block,
            None => {
                self.refill(&mut cache)?;
                cache.pop().ok_or(AllocError::OutOfMemory { requested: self.block_size() })?
            }
        };
        let was_out = self.mark(block.as_ptr() as usize, true)?;
        debug_assert!(!was_out, "Block handed out twice.");
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(block)
    }

    #[instrument(level = "debug", skip_all, err(Debug, level = Level::DEBUG))]
    fn refill(&self, cache: &mut ThreadCache) -> AllocResult<()> {
        let mut batch = Vec::with_capacity(REFILL_BATCH);
        let got = self.global.allocate_batch(REFILL_BATCH, &mut batch)?;
        self.sync_maps();
        for block in batch {
            cache.push(block);
        }
        debug!(blocks = got, "Refilled thread cache.");
        Ok(())
    }

    /// Appends a map for every chunk the shared pool gained since the last call.
    ///
    /// The write lock is taken before the chunk list is read, so a thread that
    /// raced ahead and already appended newer chunks is never undone.
    fn sync_maps(&self) {
        let known = read(&self.maps).len();
        if known >= self.global.chunk_count() {
            return;
        }
        let mut maps = write(&self.maps);
        // Another refill may have appended in the meantime.
        let known = maps.len();
        let block_size = self.block_size();
        maps.extend(
            self.global
                .chunk_ranges()
                .into_iter()
                .skip(known)
                .map(|range| ChunkMap::new(range, block_size)),
        );
        debug!(chunks = maps.len(), "Chunk maps extended.");
    }

    /// Sets or clears the handed-out bit of the block at `addr` and returns
    /// the previous value. Fails unless `addr` is the start of a block of the
    /// shared pool.
    fn mark(&self, addr: usize, handed_out: bool) -> AllocResult<bool> {
        let maps = read(&self.maps);
        let map = maps
            .iter()
            .find(|m| m.range.contains(&addr))
            .ok_or(AllocError::not_owned(addr))?;
        let offset = addr - map.range.start;
        let slot = offset / self.block_size();
        if offset % self.block_size() != 0 || slot >= map.slots {
            return Err(AllocError::misaligned(addr));
        }
        let (word, bit) = (&map.handed_out[slot / 64], 1_u64 << (slot % 64));
        let previous = if handed_out {
            word.fetch_or(bit, Ordering::AcqRel)
        } else {
            word.fetch_and(!bit, Ordering::AcqRel)
        };
        Ok(previous & bit != 0)
    }

    fn deallocate_in(&self, cache: &Mutex<ThreadCache>, ptr: NonNull<u8>) -> AllocResult<()> {
        let addr = ptr.as_ptr() as usize;
        let was_out = self.mark(addr, false).inspect_err(|e| {
            warn!(addr, error = %e, "Rejected deallocation.");
        })?;
        if !was_out {
            warn!(addr, "Block freed twice or never handed out.");
            return Err(AllocError::DoubleRelease { addr });
        }

        let mut cache = lock(cache);
        if !cache.push(ptr) {
            self.global.deallocate(ptr)?;
        }
        self.deallocations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    #[instrument(level = "debug", skip_all, err(Debug, level = Level::WARN))]
    fn drain(&self, cache: &mut ThreadCache) -> AllocResult<()> {
        if cache.len == 0 {
            return Ok(());
        }
        debug!(blocks = cache.len, "Draining thread cache.");
        self.global.deallocate_batch(cache.take())
    }

    /// Returns every cached block of every thread to the shared pool and
    /// forgets the caches of threads that are not currently using the pool.
    pub fn drain_caches(&self) -> AllocResult<()> {
        let mut caches = write(&self.caches);
        let mut result = Ok(());
        for cache in caches.values() {
            if let Err(e) = self.drain(&mut lock(cache)) {
                result = result.and(Err(e));
            }
        }
        caches.retain(|_, cache| Arc::strong_count(cache) > 1);
        result
    }

    /// Successful allocations since construction, over all threads.
    pub fn get_thread_allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Successful deallocations since construction, over all threads.
    pub fn get_thread_deallocations(&self) -> usize {
        self.deallocations.load(Ordering::Relaxed)
    }

    /// Blocks sitting in thread caches.
    pub fn cached_blocks(&self) -> usize {
        read(&self.caches).values().map(|c| lock(c).len).sum()
    }

    /// Statistics of the shared pool. Cached blocks count as allocated.
    pub fn global_stats(&self) -> PoolStats {
        self.global.stats()
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.global.block_size()
    }
}

impl Drop for ThreadSafeMemoryPool {
    fn drop(&mut self) {
        if let Err(e) = self.drain_caches() {
            warn!(error = %e, "Cached blocks could not all be returned.");
        }
    }
}

/// The calling thread's handle on a [`ThreadSafeMemoryPool`].
///
/// Holds the thread's cache directly, so calls skip the registry. Not `Send`:
/// a context belongs to the thread that created it.
pub struct ThreadContext<'a> {
    pool: &'a ThreadSafeMemoryPool,
    cache: CacheHandle,
    _not_send: PhantomData<*const ()>,
}

impl ThreadContext<'_> {
    #[inline]
    pub fn allocate(&self) -> AllocResult<NonNull<u8>> {
        self.pool.allocate_in(&self.cache)
    }

    #[inline]
    pub fn deallocate(&self, ptr: NonNull<u8>) -> AllocResult<()> {
        self.pool.deallocate_in(&self.cache, ptr)
    }

    /// Blocks currently cached for this thread.
    pub fn cached(&self) -> usize {
        lock(&self.cache).len
    }
}

impl Drop for ThreadContext<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.pool.drain(&mut lock(&self.cache)) {
            warn!(error = %e, "Cached blocks could not all be returned.");
        }
    }
}
