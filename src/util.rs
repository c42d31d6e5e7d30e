//! Address arithmetic shared by the allocators.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{AllocError, AllocResult};

/// Default alignment handed out when the caller does not ask for one.
/// Matches the alignment of `max_align_t` on the supported targets.
pub const MAX_ALIGN: usize = 16;

static_assertions::const_assert!(MAX_ALIGN.is_power_of_two());
static_assertions::const_assert!(MAX_ALIGN >= core::mem::align_of::<usize>());

/// Locks `mutex`, recovering the guard if a previous holder panicked.
/// No allocator leaves its state half-updated across a panic point.
#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[inline]
pub(crate) fn read<T>(rw: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rw.read().unwrap_or_else(PoisonError::into_inner)
}

#[inline]
pub(crate) fn write<T>(rw: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rw.write().unwrap_or_else(PoisonError::into_inner)
}

/// Returns the smallest (in address) `align`-aligned pointer
/// with an address greater or equal to that of `ptr`
/// or `None` if no such pointer exists.
///
/// # Panics
/// Panics if `align` is not a power-of-two.
#[inline]
pub(crate) fn find_aligned(ptr: *const u8, align: usize) -> Option<*const u8> {
    let offset = ptr.align_offset(align);
    debug_assert_ne!(
        offset,
        usize::MAX,
        "align_offset() on a *const u8 should never fail."
    );
    if usize::MAX - offset < ptr as usize {
        return None;
    }
    Some(ptr.wrapping_add(offset))
}

/// Returns the smallest integer `z` such that `z ≥ x` and `z = y.k` for some integer `k`
/// or `None` if that integer can not be contained in a `usize`.
///
/// # Panics
/// Panics if `y` is 0.
#[inline]
pub(crate) fn round_up(x: usize, y: usize) -> Option<usize> {
    if x % y == 0 {
        Some(x)
    } else {
        ((x / y) * y).checked_add(y)
    }
}

/// Checks that `align` can be used as an alignment and that `size`
/// rounded up to it still fits in an `isize`.
#[inline]
pub(crate) fn validate_layout(size: usize, align: usize) -> AllocResult<()> {
    if !align.is_power_of_two() {
        return Err(AllocError::InvalidLayout { size, align });
    }
    match round_up(size, align) {
        Some(s) if s <= isize::MAX as usize => Ok(()),
        _ => Err(AllocError::InvalidLayout { size, align }),
    }
}
