//! The point-in-time statistics snapshot reported by every allocator.

use std::fmt;

/// A read-only snapshot of an allocator's usage.
///
/// Counts are in the allocator's own unit: blocks for the fixed-size pools,
/// slots for [`ObjectPool`](crate::ObjectPool), individual allocations for
/// the bump allocators. Byte counts are always bytes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Bytes currently handed out (including alignment padding for bump allocators).
    pub bytes_used: usize,
    /// Bytes still available without growing.
    pub bytes_remaining: usize,
    /// Allocations currently live.
    pub allocated_count: usize,
    /// Blocks or slots available without growing.
    pub available_count: usize,
    /// High-water mark of the bytes handed out since construction.
    pub peak_usage: usize,
    pub chunk_count: usize,
}

impl PoolStats {
    /// Total bytes under management.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.bytes_used + self.bytes_remaining
    }

    /// Fraction of the managed bytes that is in use, in `[0, 1]`.
    pub fn utilization(&self) -> f64 {
        match self.capacity() {
            0 => 0.0,
            cap => self.bytes_used as f64 / cap as f64,
        }
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "used {} B / remaining {} B ({:.1}%), {} live, {} available, peak {} B, {} chunk(s)",
            self.bytes_used,
            self.bytes_remaining,
            self.utilization() * 100.0,
            self.allocated_count,
            self.available_count,
            self.peak_usage,
            self.chunk_count,
        )
    }
}

/// Tracks a high-water mark.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct Peak(usize);

impl Peak {
    #[inline]
    pub(crate) const fn new() -> Self {
        Peak(0)
    }

    #[inline]
    pub(crate) fn observe(&mut self, value: usize) {
        self.0 = self.0.max(value);
    }

    #[inline]
    pub(crate) fn get(&self) -> usize {
        self.0
    }
}
