//! Shared-memory scatter primitives.
//!
//! Every parallel write in this crate is statically partitioned: deferred
//! adjacency mutations are sharded by target-vertex hash and each bucket is
//! drained by exactly one task, refinement writes new elements into index
//! ranges reserved through an atomic capture, and coarsening phase 1 confines
//! each task to the interior of its graph partition. [`ScatterSlice`] is the
//! single audited escape hatch that turns those disjointness arguments into
//! concurrent `&mut` access; all of its callers state which partitioning
//! scheme makes their writes disjoint.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A shared view of a mutable slice that permits concurrent writes to
/// *disjoint* entries from multiple threads.
///
/// # Safety contract
///
/// Callers of [`get_mut`](Self::get_mut) and [`slice_mut`](Self::slice_mut)
/// must guarantee that no two threads ever obtain overlapping references
/// through the same view, and that an entry is never read through
/// [`get`](Self::get) while another thread holds a mutable reference to it.
/// The guarantee comes from a static partitioning of indices (hash buckets,
/// reserved ranges, graph partitions), never from locking.
#[repr(transparent)]
pub(crate) struct ScatterSlice<'a, T> {
    cells: &'a [UnsafeCell<T>],
}

unsafe impl<T: Send> Sync for ScatterSlice<'_, T> {}
unsafe impl<T: Send> Send for ScatterSlice<'_, T> {}

impl<'a, T> ScatterSlice<'a, T> {
    /// Wrap an exclusively borrowed slice for partitioned scatter access.
    pub fn new(data: &'a mut [T]) -> Self {
        // SAFETY: UnsafeCell<T> is repr(transparent) over T, so the slice
        // layouts are identical; the &mut borrow guarantees exclusivity for
        // the lifetime of the view.
        let cells = unsafe { &*(data as *mut [T] as *const [UnsafeCell<T>]) };
        Self { cells }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Read entry `i`.
    ///
    /// # Safety
    /// No thread may concurrently hold a mutable reference to entry `i`.
    #[inline]
    pub unsafe fn get(&self, i: usize) -> &T {
        unsafe { &*self.cells[i].get() }
    }

    /// Mutably access entry `i`.
    ///
    /// # Safety
    /// The caller's partitioning scheme must assign entry `i` to exactly one
    /// task for the duration of the borrow.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self, i: usize) -> &mut T {
        unsafe { &mut *self.cells[i].get() }
    }

    /// Mutably access the contiguous range `start..start + len`.
    ///
    /// # Safety
    /// The range must be owned by exactly one task, e.g. because it was
    /// reserved through an [`IndexCapture`].
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, start: usize, len: usize) -> &mut [T] {
        assert!(start + len <= self.cells.len());
        unsafe { std::slice::from_raw_parts_mut(self.cells[start].get(), len) }
    }
}

/// Atomic reservation of contiguous index ranges.
///
/// Mirrors the `atomic capture` idiom: a fetch-and-add that hands the caller
/// a private range `[start, start + n)` of the shared counter. Entity
/// counters are the only cross-thread atomics an operator needs; everything
/// else is partitioned.
pub(crate) struct IndexCapture(AtomicUsize);

impl IndexCapture {
    pub fn new(start: usize) -> Self {
        Self(AtomicUsize::new(start))
    }

    /// Reserve `n` consecutive indices, returning the first.
    #[inline]
    pub fn capture(&self, n: usize) -> usize {
        self.0.fetch_add(n, Ordering::Relaxed)
    }

    /// The current high-water mark.
    pub fn value(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}
