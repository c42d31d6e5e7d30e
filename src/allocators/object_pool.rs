//! A fixed-capacity pool of typed slots.
//!
//! The pool owns `N` slots of raw storage for `T` for its whole lifetime and
//! only constructs and destroys the objects living in them. A free slot is
//! searched for starting at a rotating cursor, so reuse spreads across the
//! slots instead of always hitting the most recently released one.
//!
//! The slot states are the single source of truth for whether a slot holds
//! a live object. A slot is `Reserved` while its constructor runs and only
//! becomes `Live` once the object has been written; release, lookup and
//! membership are only honoured for live slots, so an object is never read
//! before it exists nor dropped twice.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::mem::{size_of, MaybeUninit};
use core::ptr::NonNull;
use std::fmt::Debug;
use std::sync::Mutex;

use tracing::warn;

use crate::error::{AllocError, AllocResult};
use crate::stats::{Peak, PoolStats};
use crate::util::lock;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SlotState {
    Free,
    /// Taken, object not constructed yet.
    Reserved,
    Live,
}

struct Slots<const N: usize> {
    state: [SlotState; N],
    cursor: usize,
    /// Slots that are not free, reserved ones included.
    live: usize,
    peak: Peak,
}

impl<const N: usize> Slots<N> {
    /// Reserves the first free slot at or after the cursor.
    fn reserve(&mut self) -> Option<usize> {
        let index = (0..N)
            .map(|k| (self.cursor + k) % N)
            .find(|&i| self.state[i] == SlotState::Free)?;
        self.state[index] = SlotState::Reserved;
        self.cursor = (index + 1) % N;
        self.live += 1;
        self.peak.observe(self.live);
        Some(index)
    }

    fn clear(&mut self, index: usize) {
        self.state[index] = SlotState::Free;
        self.live -= 1;
    }

    #[inline]
    fn is_live(&self, index: usize) -> bool {
        self.state[index] == SlotState::Live
    }
}

pub struct ObjectPool<T, const N: usize> {
    storage: Box<[UnsafeCell<MaybeUninit<T>>]>,
    slots: Mutex<Slots<N>>,
    _owns: PhantomData<T>,
}

// SAFETY: objects are only reached through pointers handed out by the pool
// and slot ownership changes under the lock. Objects may be dropped on any
// thread that releases them.
unsafe impl<T: Send, const N: usize> Send for ObjectPool<T, N> {}
unsafe impl<T: Send + Sync, const N: usize> Sync for ObjectPool<T, N> {}

impl<T, const N: usize> Debug for ObjectPool<T, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPool")
            .field("capacity", &N)
            .field("in_use", &lock(&self.slots).live)
            .finish()
    }
}

impl<T, const N: usize> Default for ObjectPool<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Clears a reserved slot if the constructor unwinds before the object is written.
struct Reservation<'a, T, const N: usize> {
    pool: &'a ObjectPool<T, N>,
    index: usize,
}

impl<T, const N: usize> Drop for Reservation<'_, T, N> {
    fn drop(&mut self) {
        lock(&self.pool.slots).clear(self.index);
    }
}

impl<T, const N: usize> ObjectPool<T, N> {
    const SIZED: () = assert!(size_of::<T>() != 0, "ObjectPool can not identify slots of a zero-sized type");

    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::SIZED;
        ObjectPool {
            storage: (0..N).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect(),
            slots: Mutex::new(Slots {
                state: [SlotState::Free; N],
                cursor: 0,
                live: 0,
                peak: Peak::new(),
            }),
            _owns: PhantomData,
        }
    }

    /// Moves `value` into a free slot.
    ///
    /// Fails with [`AllocError::Exhausted`] when every slot is in use; `value`
    /// is dropped in that case.
    #[inline]
    pub fn acquire(&self, value: T) -> AllocResult<NonNull<T>> {
        self.acquire_with(|| value)
    }

    /// Constructs an object in a free slot with `init`.
    ///
    /// `init` is only called once a slot has been reserved and runs without
    /// the pool lock held, so it may use the pool itself.
    pub fn acquire_with<F>(&self, init: F) -> AllocResult<NonNull<T>>
    where
        F: FnOnce() -> T,
    {
        let index = lock(&self.slots)
            .reserve()
            .ok_or(AllocError::Exhausted { capacity: N })?;
        let reservation = Reservation { pool: self, index };
        let value = init();

        let slot = self.slot_ptr(index);
        // SAFETY: the slot is reserved and was empty, nobody else reads or writes it.
        unsafe { slot.as_ptr().write(value) };
        lock(&self.slots).state[index] = SlotState::Live;
        core::mem::forget(reservation);
        Ok(slot)
    }

    /// Destroys the object at `ptr` and frees its slot.
    ///
    /// Releasing a slot without a live object, whether free or still under
    /// construction, reports [`AllocError::DoubleRelease`] and touches nothing.
    pub fn release(&self, ptr: NonNull<T>) -> AllocResult<()> {
        let addr = ptr.as_ptr() as usize;
        let index = self.index_of(addr).inspect_err(|e| {
            warn!(addr, error = %e, "Rejected release.");
        })?;

        let value = {
            let mut slots = lock(&self.slots);
            if !slots.is_live(index) {
                warn!(addr, slot = index, state = ?slots.state[index], "Release of a slot without a live object.");
                return Err(AllocError::DoubleRelease { addr });
            }
            // SAFETY: a live slot holds an initialized object, moved out
            // exactly once before the slot is freed.
            let value = unsafe { self.slot_ptr(index).as_ptr().read() };
            slots.clear(index);
            value
        };
        // Drop outside the lock: the destructor may use the pool.
        drop(value);
        Ok(())
    }

    /// Returns a reference to the live object at `ptr`, or `None` if `ptr` is
    /// not a slot of this pool currently in use.
    ///
    /// # Safety
    /// The object must not be released, nor mutated through another pointer,
    /// while the returned reference is alive.
    pub unsafe fn get(&self, ptr: NonNull<T>) -> Option<&T> {
        let index = self.index_of(ptr.as_ptr() as usize).ok()?;
        let live = lock(&self.slots).is_live(index);
        live.then(|| unsafe { &*self.slot_ptr(index).as_ptr() })
    }

    /// Returns whether `ptr` is a slot of this pool holding a live object.
    pub fn contains(&self, ptr: NonNull<T>) -> bool {
        self.index_of(ptr.as_ptr() as usize)
            .is_ok_and(|i| lock(&self.slots).is_live(i))
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn objects_in_use(&self) -> usize {
        lock(&self.slots).live
    }

    pub fn available_objects(&self) -> usize {
        N - lock(&self.slots).live
    }

    pub fn stats(&self) -> PoolStats {
        let slots = lock(&self.slots);
        PoolStats {
            bytes_used: slots.live * size_of::<T>(),
            bytes_remaining: (N - slots.live) * size_of::<T>(),
            allocated_count: slots.live,
            available_count: N - slots.live,
            peak_usage: slots.peak.get() * size_of::<T>(),
            chunk_count: 1,
        }
    }

    #[inline]
    fn slot_ptr(&self, index: usize) -> NonNull<T> {
        // SAFETY: `UnsafeCell` pointers are never null.
        unsafe { NonNull::new_unchecked(self.storage[index].get().cast::<T>()) }
    }

    fn index_of(&self, addr: usize) -> AllocResult<usize> {
        let base = self.storage.as_ptr() as usize;
        let offset = addr
            .checked_sub(base)
            .filter(|&o| o < N * size_of::<T>())
            .ok_or(AllocError::not_owned(addr))?;
        if offset % size_of::<T>() != 0 {
            return Err(AllocError::misaligned(addr));
        }
        Ok(offset / size_of::<T>())
    }
}

impl<T, const N: usize> Drop for ObjectPool<T, N> {
    fn drop(&mut self) {
        let slots = self.slots.get_mut().unwrap_or_else(|e| e.into_inner());
        for (index, cell) in self.storage.iter_mut().enumerate() {
            if slots.is_live(index) {
                slots.state[index] = SlotState::Free;
                // SAFETY: live slots hold initialized objects.
                unsafe { cell.get_mut().assume_init_drop() };
            }
        }
        slots.live = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeallocFault;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct Tracked {
        id: u32,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_capacity_bound() {
        let pool = ObjectPool::<u64, 5>::new();
        let ptrs: Vec<_> = (0..5).map(|i| pool.acquire(i).unwrap()).collect();
        assert_eq!(pool.objects_in_use(), 5);
        assert_eq!(pool.available_objects(), 0);
        assert_eq!(pool.acquire(5).unwrap_err(), AllocError::Exhausted { capacity: 5 });

        pool.release(ptrs[2]).unwrap();
        let again = pool.acquire(42).unwrap();
        assert_eq!(again, ptrs[2]);
        assert_eq!(unsafe { *again.as_ptr() }, 42);
        assert_eq!(pool.objects_in_use(), 5);
    }

    #[test]
    fn test_double_release() {
        let pool = ObjectPool::<u32, 5>::new();
        let a = pool.acquire(1).unwrap();
        let _b = pool.acquire(2).unwrap();
        pool.release(a).unwrap();
        assert_eq!(pool.objects_in_use(), 1);
        assert_eq!(
            pool.release(a).unwrap_err(),
            AllocError::DoubleRelease { addr: a.as_ptr() as usize }
        );
        assert_eq!(pool.objects_in_use(), 1);
    }

    #[test]
    fn test_destructors() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let pool = ObjectPool::<Tracked, 4>::new();
            let a = pool
                .acquire(Tracked { id: 1, drops: Arc::clone(&drops) })
                .unwrap();
            pool.acquire(Tracked { id: 2, drops: Arc::clone(&drops) })
                .unwrap();
            pool.acquire(Tracked { id: 3, drops: Arc::clone(&drops) })
                .unwrap();
            assert_eq!(unsafe { pool.get(a) }.map(|t| t.id), Some(1));

            pool.release(a).unwrap();
            assert_eq!(drops.load(Ordering::Relaxed), 1);
            assert!(pool.release(a).is_err());
            assert_eq!(drops.load(Ordering::Relaxed), 1, "An object was dropped twice.");
            assert!(unsafe { pool.get(a) }.is_none());
        }
        // The two live objects are destroyed with the pool.
        assert_eq!(drops.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_rotating_cursor() {
        let pool = ObjectPool::<u16, 4>::new();
        let a = pool.acquire(0).unwrap();
        let b = pool.acquire(1).unwrap();
        pool.release(a).unwrap();
        // The cursor moved past `b`, so the next slot is fresh rather than `a`'s.
        let c = pool.acquire(2).unwrap();
        assert_ne!(c, a);
        assert_ne!(c, b);
        let d = pool.acquire(3).unwrap();
        // Wrapping around finds the freed slot.
        let e = pool.acquire(4).unwrap();
        assert_eq!(e, a);
        assert!(![b, c, d].contains(&e));
    }

    #[test]
    fn test_foreign_pointers() {
        let pool = ObjectPool::<u64, 2>::new();
        let p = pool.acquire(7).unwrap();
        let mut local = 0_u64;
        let foreign = NonNull::from(&mut local);
        assert_eq!(
            pool.release(foreign).unwrap_err(),
            AllocError::InvalidDeallocation {
                addr: foreign.as_ptr() as usize,
                fault: DeallocFault::NotOwned,
            }
        );
        let inside = unsafe { NonNull::new_unchecked(p.as_ptr().cast::<u8>().add(4).cast::<u64>()) };
        assert_eq!(
            pool.release(inside).unwrap_err(),
            AllocError::misaligned(inside.as_ptr() as usize)
        );
        assert!(pool.contains(p));
        assert!(!pool.contains(foreign));
        assert_eq!(pool.objects_in_use(), 1);
    }

    #[test]
    fn test_acquire_with() {
        let pool = ObjectPool::<Vec<u8>, 2>::new();
        let mut calls = 0;
        pool.acquire_with(|| {
            calls += 1;
            vec![1, 2, 3]
        })
        .unwrap();
        pool.acquire_with(|| {
            calls += 1;
            vec![]
        })
        .unwrap();
        assert!(pool
            .acquire_with(|| {
                calls += 1;
                vec![]
            })
            .is_err());
        assert_eq!(calls, 2, "The constructor ran without a free slot.");
    }

    #[test]
    fn test_slot_under_construction() {
        let pool = ObjectPool::<u64, 2>::new();
        let a = pool.acquire(1).unwrap();
        // The cursor sits on the second slot, which `acquire_with` reserves next.
        let pending = unsafe { NonNull::new_unchecked(a.as_ptr().add(1)) };

        let b = pool
            .acquire_with(|| {
                assert!(!pool.contains(pending));
                assert!(unsafe { pool.get(pending) }.is_none());
                assert_eq!(
                    pool.release(pending).unwrap_err(),
                    AllocError::DoubleRelease { addr: pending.as_ptr() as usize }
                );
                assert_eq!(pool.objects_in_use(), 2);
                2
            })
            .unwrap();
        assert_eq!(b, pending);
        assert!(pool.contains(b));
        assert_eq!(unsafe { pool.get(b) }.copied(), Some(2));
        pool.release(b).unwrap();
        assert_eq!(pool.objects_in_use(), 1);
    }

    #[test]
    fn test_constructor_panic() {
        let pool = ObjectPool::<String, 1>::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            pool.acquire_with(|| panic!("boom")).ok();
        }));
        assert!(result.is_err());
        assert_eq!(pool.objects_in_use(), 0);
        pool.acquire(String::from("ok")).unwrap();
    }

    #[test]
    fn test_threads() {
        let pool = ObjectPool::<usize, 64>::new();
        std::thread::scope(|s| {
            for t in 0..4 {
                let pool = &pool;
                s.spawn(move || {
                    for i in 0..1_000 {
                        let p = loop {
                            match pool.acquire(t * 1_000 + i) {
                                Ok(p) => break p,
                                Err(_) => std::thread::yield_now(),
                            }
                        };
                        assert_eq!(unsafe { *p.as_ptr() }, t * 1_000 + i);
                        pool.release(p).unwrap();
                    }
                });
            }
        });
        assert_eq!(pool.objects_in_use(), 0);
        assert!(pool.stats().peak_usage <= 4 * size_of::<usize>());
    }
}
