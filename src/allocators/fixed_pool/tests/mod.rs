use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::*;
use crate::error::DeallocFault;


fn pool(block_size: usize, chunk_bytes: usize) -> RawFixedPool {
    format::init();
    RawFixedPool::new(FixedPoolConfig::new(block_size).chunk_bytes(chunk_bytes)).unwrap()
}

#[test]
fn test_1() {
    let mut pool = pool(64, 64 * 16);
    assert_eq!(pool.chunk_count(), 0, "Chunks should be created lazily.");

    let blocks: Vec<_> = (0..16).map(|_| pool.allocate().unwrap()).collect();
    assert_eq!(pool.chunk_count(), 1);
    assert_eq!(pool.in_use(), 16);
    // A fresh chunk hands out its blocks in address order.
    for w in blocks.windows(2) {
        assert_eq!(w[0].as_ptr() as usize + 64, w[1].as_ptr() as usize);
    }

    let extra = pool.allocate().unwrap();
    assert_eq!(pool.chunk_count(), 2);
    assert!(!blocks.contains(&extra));

    for b in blocks {
        pool.deallocate(b).unwrap();
    }
    pool.deallocate(extra).unwrap();
    assert_eq!(pool.in_use(), 0);
    assert_eq!(pool.stats().available_count, 32);
}

#[test]
fn test_2() {
    // Freed blocks are reused before the pool grows.
    let mut pool = pool(32, 32 * 4);
    let p1 = pool.allocate().unwrap();
    let p2 = pool.allocate().unwrap();
    pool.deallocate(p1).unwrap();
    assert_eq!(pool.allocate().unwrap(), p1);
    pool.deallocate(p2).unwrap();
    assert_eq!(pool.allocate().unwrap(), p2);
    assert_eq!(pool.chunk_count(), 1);
}

#[test]
fn test_3() {
    let mut pool = pool(48, 48 * 8);
    let p = pool.allocate().unwrap();
    pool.deallocate(p).unwrap();

    let in_use = pool.in_use();
    let available = pool.stats().available_count;
    assert_eq!(
        pool.deallocate(p).unwrap_err(),
        AllocError::DoubleRelease { addr: p.as_ptr() as usize }
    );
    assert_eq!(pool.in_use(), in_use);
    assert_eq!(pool.stats().available_count, available);

    // The free list must not contain the block twice.
    let a = pool.allocate().unwrap();
    let b = pool.allocate().unwrap();
    assert_ne!(a, b);
}

#[test]
fn test_4() {
    let mut pool = pool(64, 1024);
    let p = pool.allocate().unwrap();

    let mut local = [0_u64; 8];
    let foreign = NonNull::new(local.as_mut_ptr().cast::<u8>()).unwrap();
    assert!(!pool.is_from_pool(foreign.as_ptr()));
    assert_eq!(
        pool.deallocate(foreign).unwrap_err(),
        AllocError::InvalidDeallocation {
            addr: foreign.as_ptr() as usize,
            fault: DeallocFault::NotOwned,
        }
    );

    let inside = unsafe { NonNull::new_unchecked(p.as_ptr().add(8)) };
    assert!(pool.is_from_pool(inside.as_ptr()));
    assert_eq!(
        pool.deallocate(inside).unwrap_err(),
        AllocError::InvalidDeallocation {
            addr: inside.as_ptr() as usize,
            fault: DeallocFault::Misaligned,
        }
    );
    assert_eq!(pool.in_use(), 1);
    pool.deallocate(p).unwrap();
}

#[test]
fn test_5() {
    let mut pool = RawFixedPool::new(FixedPoolConfig::new(128).chunk_bytes(512).max_chunks(2)).unwrap();
    let blocks: Vec<_> = (0..8).map(|_| pool.allocate().unwrap()).collect();
    assert_eq!(
        pool.allocate().unwrap_err(),
        AllocError::OutOfMemory { requested: 128 }
    );
    assert_eq!(pool.chunk_count(), 2);
    pool.deallocate(blocks[3]).unwrap();
    assert_eq!(pool.allocate().unwrap(), blocks[3]);
}

#[test]
fn test_6() {
    // Tiny requests are widened to hold a free-list node.
    let pool = pool(1, 256);
    assert_eq!(pool.block_size(), NODE_SIZE);
    let pool = RawFixedPool::new(FixedPoolConfig::new(13)).unwrap();
    assert_eq!(pool.block_size() % NODE_ALIGN, 0);
    assert!(pool.block_size() >= 13);
    // Blocks bigger than a chunk still get one block per chunk.
    let pool = RawFixedPool::new(FixedPoolConfig::new(4096).chunk_bytes(1024)).unwrap();
    assert_eq!(pool.blocks_per_chunk(), 1);
}

#[test]
fn test_7() {
    let mut pool = pool(64, 64 * 10);
    let mut out = vec![];
    assert_eq!(pool.allocate_batch(16, &mut out).unwrap(), 16);
    assert_eq!(out.len(), 16);
    assert_eq!(pool.chunk_count(), 2);

    let mut limited = RawFixedPool::new(FixedPoolConfig::new(64).chunk_bytes(64 * 4).max_chunks(1)).unwrap();
    let mut few = vec![];
    assert_eq!(limited.allocate_batch(10, &mut few).unwrap(), 4);
    assert!(limited.allocate_batch(1, &mut few).is_err());
    limited.deallocate_batch(few).unwrap();
    assert_eq!(limited.in_use(), 0);

    let first = out[0];
    let err = pool.deallocate_batch(out.iter().copied().chain([first])).unwrap_err();
    assert_eq!(err, AllocError::DoubleRelease { addr: first.as_ptr() as usize });
    assert_eq!(pool.in_use(), 0);
}

#[test]
fn test_8() {
    // Random interleavings keep the live count, the bitmask and the
    // address ranges consistent.
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut pool = pool(40, 40 * 32);
    let mut live: Vec<NonNull<u8>> = vec![];
    let mut allocs = 0_usize;
    let mut frees = 0_usize;

    for _ in 0..20_000 {
        if live.is_empty() || rng.gen_bool(0.55) {
            let p = pool.allocate().unwrap();
            unsafe { p.as_ptr().write_bytes(0xCD, 40) };
            live.push(p);
            allocs += 1;
        } else {
            let p = live.swap_remove(rng.gen_range(0..live.len()));
            pool.deallocate(p).unwrap();
            frees += 1;
        }
        assert_eq!(pool.in_use(), allocs - frees);
        assert!(pool.in_use() <= pool.chunk_count() * pool.blocks_per_chunk());
    }

    let mut starts: Vec<usize> = live.iter().map(|p| p.as_ptr() as usize).collect();
    starts.sort_unstable();
    for w in starts.windows(2) {
        assert!(w[0] + pool.block_size() <= w[1], "Live blocks overlap.");
    }
    for p in &live {
        assert!(pool.is_allocated(p.as_ptr()));
    }
    let stats = pool.stats();
    assert_eq!(stats.allocated_count + stats.available_count, pool.chunk_count() * pool.blocks_per_chunk());
    assert_eq!(stats.bytes_used, live.len() * pool.block_size());
}

#[test]
fn test_9() {
    let pool = Arc::new(FixedSizePool::with_config(FixedPoolConfig::new(24).chunk_bytes(24 * 64)).unwrap());
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let mut mine = vec![];
                for i in 0..2_000 {
                    let p = pool.allocate().unwrap();
                    unsafe { p.as_ptr().cast::<u64>().write((t * 10_000 + i) as u64) };
                    mine.push(p);
                    if i % 3 == 0 {
                        let q = mine.swap_remove(0);
                        pool.deallocate(q).unwrap();
                    }
                }
                for (i, p) in mine.iter().enumerate() {
                    assert!(pool.is_allocated(p.as_ptr()), "block {i} lost");
                }
                mine.into_iter().map(|p| p.as_ptr() as usize).collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    let mut total = 0;
    for h in handles {
        for addr in h.join().expect("Thread panicked.") {
            assert!(seen.insert(addr), "Block handed out twice.");
            total += 1;
        }
    }
    assert_eq!(pool.in_use(), total);

    for addr in seen {
        pool.deallocate(NonNull::new(addr as *mut u8).unwrap()).unwrap();
    }
    assert_eq!(pool.in_use(), 0);
    assert!(pool.stats().peak_usage >= total * pool.block_size());
}

#[test]
fn test_10() {
    let pool = FixedSizePool::new(256).unwrap();
    assert_eq!(pool.block_size(), 256);
    assert!(pool.chunk_ranges().is_empty());
    let p = pool.allocate().unwrap();
    let ranges = pool.chunk_ranges();
    assert_eq!(ranges.len(), 1);
    assert!(ranges[0].contains(&(p.as_ptr() as usize)));
    assert_eq!(ranges[0].len(), DEFAULT_CHUNK_BYTES);
    assert_eq!(pool.stats().available_count, DEFAULT_CHUNK_BYTES / 256 - 1);
    assert!(format!("{pool:?}").contains("block_size: 256"));
    pool.deallocate(p).unwrap();
}
