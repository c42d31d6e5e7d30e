//! Defines the [`Freelist`] struct and associated constants.

use core::mem::{align_of, size_of};
use core::ptr::{null_mut, NonNull};

pub const NODE_SIZE: usize = size_of::<Node>();
pub const NODE_ALIGN: usize = align_of::<Node>();

/// A free-list node overlaid on the first bytes of an unused block.
/// Overwritten by user data as soon as its block is handed out.
#[repr(C)]
pub struct Node {
    pub next: *mut Node,
}

/// An intrusive, singly linked list of unused blocks.
#[derive(Debug)]
#[repr(C)]
pub struct Freelist {
    head: *mut Node,
    len: usize,
}

impl Freelist {
    /// Creates an empty Freelist.
    #[inline]
    pub const fn new() -> Self {
        Freelist { head: null_mut(), len: 0 }
    }

    /// Creates a node at the location pointed by `p` and adds it to the front of the Freelist.
    /// This operation has a time complexity of *O*(1).
    ///
    /// # Safety
    /// `p` must be valid for writes of [`NODE_SIZE`] bytes, aligned to [`NODE_ALIGN`],
    /// and must not currently be part of this or any other list.
    pub unsafe fn push_front(&mut self, p: *mut u8) {
        debug_assert_eq!(p as usize % NODE_ALIGN, 0);
        let node: *mut Node = p.cast();
        unsafe { node.write(Node { next: self.head }) };
        self.head = node;
        self.len += 1;
    }

    /// Unlinks the head of the list and returns it as a raw block
    /// or `None` if the list is empty.
    /// This operation has a time complexity of *O*(1).
    ///
    /// # Safety
    /// The memory of every node in the list must still be valid.
    pub unsafe fn pop_front(&mut self) -> Option<NonNull<u8>> {
        let head = NonNull::new(self.head)?;
        self.head = unsafe { (*head.as_ptr()).next };
        self.len -= 1;
        Some(head.cast())
    }

    /// Returns the head of the list or `None` if the list is empty.
    #[cfg(test)]
    #[inline]
    pub fn head(&self) -> Option<NonNull<Node>> {
        NonNull::new(self.head)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }
}

impl Default for Freelist {
    fn default() -> Self {
        Self::new()
    }
}
