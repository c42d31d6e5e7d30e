//! A toolkit of memory pools and special-purpose allocators.
//!
//! # Usage
//! ```toml
//! [dependencies]
//! mempool_kit = "0.1"
//! ```
//!
//! ```
//! use mempool_kit::{AllocError, FixedSizePool};
//!
//! let pool = FixedSizePool::new(64).unwrap();
//! let block = pool.allocate().unwrap();
//! pool.deallocate(block).unwrap();
//! assert_eq!(
//!     pool.deallocate(block),
//!     Err(AllocError::DoubleRelease { addr: block.as_ptr() as usize })
//! );
//! ```
//!
//! # Allocators
//! - [`StackAllocator`]: bump allocation over a fixed buffer, freed in LIFO order.
//! - [`MonotonicAllocator`]: a grow-only chunked arena, freed all at once by `reset`.
//! - [`FixedSizePool`]: equally sized blocks carved from lazily created chunks.
//! - [`VariableSizePool`]: segregated free lists over power-of-two size classes.
//! - [`ObjectPool`]: a fixed number of typed slots with construct/destroy on acquire/release.
//! - [`ThreadSafeMemoryPool`]: a [`FixedSizePool`] behind per-thread block caches.
//! - [`TrackingAllocator`]: a recording wrapper over a [`Backing`].
//!
//! The stack and monotonic allocators are not synchronized and take `&mut self`.
//! Every other allocator guards its state with a lock and takes `&self`.
//!
//! # Mode of operation
//! The pools share a handful of building blocks:
//!
//! ## Chunks
//! A chunk is one aligned region obtained from a [`Backing`] and split into
//! blocks. Pools keep their chunks in a `Vec` and find the owner of a pointer
//! by address-range membership. Chunks are created when the existing ones are
//! exhausted and are released together with their pool.
//!
//! ## Freelist
//! Unused blocks are threaded into a singly linked list whose nodes live in
//! the blocks themselves. A block becomes a node the moment it is freed and
//! stops being one the moment it is handed out again, which is why no block
//! can be smaller than a node.
//!
//! ## Backings
//! Raw memory comes from a [`Backing`], the crate's allocate/free pair.
//! [`Malloc`] (libc) is the default; [`System`] goes through Rust's system
//! allocator.
//!
//! # Errors
//! Misuse never corrupts an allocator: foreign pointers, out-of-order stack
//! frees, double releases and size mismatches are detected before any state
//! changes and reported as an [`AllocError`]. Rejections are also logged
//! through [`tracing`] at `WARN` level.
//!
//! [`tracing`]: https://docs.rs/tracing

pub use crate::allocators::{
    FixedPoolConfig, FixedSizePool, MonotonicAllocator, ObjectPool, StackAllocator, ThreadSafeMemoryPool,
    TrackingAllocator, VariablePoolConfig, VariableSizePool,
};
pub use crate::backing::{Backing, Malloc, System};
pub use crate::error::{AllocError, AllocResult, DeallocFault};
pub use crate::stats::PoolStats;
pub use crate::util::MAX_ALIGN;

pub mod allocators;
pub mod backing;
mod chunk;
pub mod error;
mod freelist;
pub mod stats;
mod util;
