//! [`Backing`] trait and structures that implement it.
//!
//! A backing is the generic allocate/free pair the pools draw their raw
//! memory from: chunk storage, oversized requests that bypass pooling and
//! the allocations made through [`TrackingAllocator`](crate::TrackingAllocator).

use core::alloc::Layout;
use core::mem::size_of;
use core::ptr::NonNull;
use std::alloc::GlobalAlloc;

use tracing::error;

/// A source of raw, aligned memory.
///
/// # Safety
/// * `alloc` must return either `Err(())` or a pointer to at least `layout.size()`
///   bytes aligned to `layout.align()` which stays valid until passed to `free`.
/// * copying or moving the backing must not invalidate memory it handed out.
pub unsafe trait Backing {
    /// Allocates a region described by `layout`.
    /// Zero-sized layouts are valid and yield a unique, freeable pointer.
    ///
    /// # Safety
    /// `layout.align()` must be a power of two.
    unsafe fn alloc(&self, layout: Layout) -> Result<NonNull<u8>, ()>;

    /// Frees a region previously returned by [`alloc`](Backing::alloc).
    ///
    /// # Safety
    /// `ptr` must have come from `alloc` on this backing with the same `layout`
    /// and must not have been freed already.
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Backing over libc's `posix_memalign`/`free`.
#[derive(Copy, Clone, Debug, Default)]
pub struct Malloc;

unsafe impl Backing for Malloc {
    unsafe fn alloc(&self, layout: Layout) -> Result<NonNull<u8>, ()> {
        // posix_memalign rejects alignments below the size of a pointer.
        let align = layout.align().max(size_of::<*mut libc::c_void>());
        let mut out: *mut libc::c_void = core::ptr::null_mut();
        let rc = unsafe { libc::posix_memalign(&mut out, align, layout.size().max(1)) };
        if rc != 0 {
            error!(size = layout.size(), align, rc, "posix_memalign failed.");
            return Err(());
        }
        NonNull::new(out.cast()).ok_or(())
    }

    unsafe fn free(&self, ptr: NonNull<u8>, _layout: Layout) {
        unsafe { libc::free(ptr.as_ptr().cast()) }
    }
}

/// Backing over Rust's [`System`](std::alloc::System) allocator.
#[derive(Copy, Clone, Debug, Default)]
pub struct System;

#[inline]
fn non_zero(layout: Layout) -> Layout {
    // SAFETY: the alignment is taken from a valid layout and a size of 1
    // can not overflow when rounded up to it.
    match layout.size() {
        0 => unsafe { Layout::from_size_align_unchecked(1, layout.align()) },
        _ => layout,
    }
}

unsafe impl Backing for System {
    unsafe fn alloc(&self, layout: Layout) -> Result<NonNull<u8>, ()> {
        let p = unsafe { std::alloc::System.alloc(non_zero(layout)) };
        NonNull::new(p).ok_or_else(|| {
            error!(size = layout.size(), align = layout.align(), "System allocator failed.");
        })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { std::alloc::System.dealloc(ptr.as_ptr(), non_zero(layout)) }
    }
}

unsafe impl<T: Backing + ?Sized> Backing for &T {
    unsafe fn alloc(&self, layout: Layout) -> Result<NonNull<u8>, ()> {
        unsafe { (**self).alloc(layout) }
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { (**self).free(ptr, layout) }
    }
}
