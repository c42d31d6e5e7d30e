//! An allocator wrapper that records every allocation it makes.
//!
//! [`TrackingAllocator`] forwards to a [`Backing`] and keeps, per
//! [`StatsScope`], a ledger mapping each live pointer to its layout along
//! with running totals and the peak of live bytes. The ledger belongs to the
//! scope type, not to an allocator instance: every allocator (and every
//! [`rebind`](TrackingAllocator::rebind)) of the same scope shares it. Use
//! [`tracking_scope!`](crate::tracking_scope) to declare isolated scopes,
//! e.g. one per test.
//!
//! ```
//! use mempool_kit::allocators::tracking::{StatsScope, TrackingAllocator};
//!
//! mempool_kit::tracking_scope!(Parser);
//!
//! let alloc = TrackingAllocator::<u64, Parser>::new();
//! let p = alloc.allocate(4).unwrap();
//! assert_eq!(Parser::statistics().current_usage, 32);
//! alloc.deallocate(p, 4).unwrap();
//! assert_eq!(Parser::statistics().live_allocations, 0);
//! ```

use core::alloc::Layout;
use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr::NonNull;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use tracing::warn;

use crate::backing::{Backing, Malloc};
use crate::error::{AllocError, AllocResult};
use crate::util::lock;

/// Declares a unit struct implementing [`StatsScope`] with its own ledger.
///
/// ```
/// mempool_kit::tracking_scope!(
///     /// Allocations made while building the index.
///     pub IndexScope
/// );
/// ```
#[macro_export]
macro_rules! tracking_scope {
    ($(#[$meta:meta])* $vis:vis $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, Default)]
        $vis struct $name;

        impl $crate::allocators::tracking::StatsScope for $name {
            fn ledger() -> &'static $crate::allocators::tracking::Ledger {
                static LEDGER: $crate::allocators::tracking::Ledger =
                    $crate::allocators::tracking::Ledger::new();
                &LEDGER
            }
        }
    };
}

crate::tracking_scope!(
    /// The scope used when none is named.
    pub DefaultScope
);

/// A type owning one process-wide allocation ledger.
pub trait StatsScope: 'static {
    fn ledger() -> &'static Ledger;

    fn statistics() -> TrackingStats {
        Self::ledger().snapshot()
    }

    /// Zeroes the counters. Live records are kept so that memory allocated
    /// before the reset can still be deallocated.
    fn reset_statistics() {
        Self::ledger().reset()
    }
}

/// A snapshot of a scope's ledger.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TrackingStats {
    pub total_allocated: usize,
    pub total_deallocated: usize,
    pub allocation_count: usize,
    pub deallocation_count: usize,
    /// Bytes held by live allocations.
    pub current_usage: usize,
    pub peak_usage: usize,
    pub live_allocations: usize,
}

impl fmt::Display for TrackingStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} allocations ({} B), {} deallocations ({} B), {} live ({} B), peak {} B",
            self.allocation_count,
            self.total_allocated,
            self.deallocation_count,
            self.total_deallocated,
            self.live_allocations,
            self.current_usage,
            self.peak_usage,
        )
    }
}

struct LedgerState {
    records: BTreeMap<usize, Layout>,
    total_allocated: usize,
    total_deallocated: usize,
    allocation_count: usize,
    deallocation_count: usize,
    current: usize,
    peak: usize,
}

/// Allocation records and counters of one [`StatsScope`].
pub struct Ledger {
    state: Mutex<LedgerState>,
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ledger").field(&self.snapshot()).finish()
    }
}

impl Ledger {
    pub const fn new() -> Self {
        Ledger {
            state: Mutex::new(LedgerState {
                records: BTreeMap::new(),
                total_allocated: 0,
                total_deallocated: 0,
                allocation_count: 0,
                deallocation_count: 0,
                current: 0,
                peak: 0,
            }),
        }
    }

    fn record(&self, addr: usize, layout: Layout) {
        let mut state = lock(&self.state);
        state.records.insert(addr, layout);
        state.total_allocated += layout.size();
        state.allocation_count += 1;
        state.current += layout.size();
        state.peak = state.peak.max(state.current);
    }

    /// Removes the record of `addr` if it matches `layout`.
    fn forget(&self, addr: usize, layout: Layout) -> AllocResult<()> {
        let mut state = lock(&self.state);
        match state.records.get(&addr) {
            None => return Err(AllocError::not_owned(addr)),
            Some(recorded) if *recorded != layout => {
                return Err(AllocError::SizeMismatch { addr, size: layout.size() })
            }
            Some(_) => {}
        }
        state.records.remove(&addr);
        state.total_deallocated += layout.size();
        state.deallocation_count += 1;
        state.current -= layout.size();
        Ok(())
    }

    /// Returns the layout `addr` was allocated with, if it is live.
    pub fn layout_of(&self, addr: usize) -> Option<Layout> {
        lock(&self.state).records.get(&addr).copied()
    }

    pub fn snapshot(&self) -> TrackingStats {
        let state = lock(&self.state);
        TrackingStats {
            total_allocated: state.total_allocated,
            total_deallocated: state.total_deallocated,
            allocation_count: state.allocation_count,
            deallocation_count: state.deallocation_count,
            current_usage: state.current,
            peak_usage: state.peak,
            live_allocations: state.records.len(),
        }
    }

    /// Zeroes the running totals. The peak restarts from the bytes still live.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        state.total_allocated = 0;
        state.total_deallocated = 0;
        state.allocation_count = 0;
        state.deallocation_count = 0;
        state.peak = state.current;
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

/// An allocator of `T`s that records its allocations in the ledger of `S`.
///
/// Counts passed to [`allocate`](Self::allocate) and
/// [`deallocate`](Self::deallocate) are in elements, not bytes.
pub struct TrackingAllocator<T, S: StatsScope = DefaultScope, B: Backing = Malloc> {
    backing: B,
    _marker: PhantomData<(fn() -> T, S)>,
}

impl<T, S: StatsScope, B: Backing + fmt::Debug> fmt::Debug for TrackingAllocator<T, S, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingAllocator")
            .field("element", &core::any::type_name::<T>())
            .field("scope", &core::any::type_name::<S>())
            .field("backing", &self.backing)
            .finish()
    }
}

impl<T, S: StatsScope, B: Backing + Clone> Clone for TrackingAllocator<T, S, B> {
    fn clone(&self) -> Self {
        self.rebind()
    }
}

impl<T, S: StatsScope> TrackingAllocator<T, S, Malloc> {
    pub const fn new() -> Self {
        Self::with_backing(Malloc)
    }
}

impl<T, S: StatsScope> Default for TrackingAllocator<T, S, Malloc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, S: StatsScope, B: Backing> TrackingAllocator<T, S, B> {
    pub const fn with_backing(backing: B) -> Self {
        TrackingAllocator { backing, _marker: PhantomData }
    }

    /// Returns an allocator of `U` sharing this one's backing and ledger.
    pub fn rebind<U>(&self) -> TrackingAllocator<U, S, B>
    where
        B: Clone,
    {
        TrackingAllocator::with_backing(self.backing.clone())
    }

    fn array_layout(n: usize) -> AllocResult<Layout> {
        Layout::array::<T>(n).map_err(|_| AllocError::InvalidLayout {
            size: n.saturating_mul(size_of::<T>()),
            align: align_of::<T>(),
        })
    }

    /// Allocates uninitialized storage for `n` values of `T`.
    pub fn allocate(&self, n: usize) -> AllocResult<NonNull<T>> {
        self.allocate_layout(Self::array_layout(n)?).map(NonNull::cast)
    }

    /// Frees storage obtained from [`allocate`](Self::allocate) with the same `n`.
    ///
    /// Unrecorded pointers and mismatched counts are reported and the memory
    /// is left alone.
    pub fn deallocate(&self, ptr: NonNull<T>, n: usize) -> AllocResult<()> {
        self.deallocate_layout(ptr.cast(), Self::array_layout(n)?)
    }

    /// Allocates raw bytes described by `layout`.
    pub fn allocate_layout(&self, layout: Layout) -> AllocResult<NonNull<u8>> {
        let ptr = unsafe { self.backing.alloc(layout) }
            .map_err(|()| AllocError::OutOfMemory { requested: layout.size() })?;
        S::ledger().record(ptr.as_ptr() as usize, layout);
        Ok(ptr)
    }

    /// Frees raw bytes obtained from [`allocate_layout`](Self::allocate_layout)
    /// with the same `layout`.
    pub fn deallocate_layout(&self, ptr: NonNull<u8>, layout: Layout) -> AllocResult<()> {
        let addr = ptr.as_ptr() as usize;
        S::ledger().forget(addr, layout).inspect_err(|e| {
            warn!(addr, size = layout.size(), error = %e, "Rejected deallocation.");
        })?;
        unsafe { self.backing.free(ptr, layout) };
        Ok(())
    }

    /// Statistics of this allocator's scope.
    #[inline]
    pub fn statistics(&self) -> TrackingStats {
        S::statistics()
    }

    #[inline]
    pub fn reset_statistics(&self) {
        S::reset_statistics()
    }
}
