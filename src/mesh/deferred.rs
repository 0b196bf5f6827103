//! Deferred adjacency mutations.
//!
//! Operators never write another vertex's adjacency lists directly during a
//! parallel pass. Instead they queue the edit, keyed by the *target* vertex,
//! into a [`DeferredBatch`] local to the running task. At the next barrier
//! the batches are absorbed into a [`DeferredQueue`] whose storage is
//! sharded into `S = bucket_scaling * threads` buckets by target-vertex
//! hash, and the commit drains the buckets in parallel.
//!
//! Because every mutation for a vertex lands in that vertex's bucket, and
//! each bucket is drained by exactly one task, all writes to one adjacency
//! list are applied by one thread without locks. That property is the load
//! bearing invariant of the whole engine: between two commits no two threads
//! may write the same adjacency list.

use crate::parallel::ScatterSlice;
use rayon::prelude::*;

/// A single queued adjacency edit. The target vertex is stored alongside the
/// op in the bucket, so ops only carry the other endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
    /// Append `w` to `NNList[target]`.
    AddNn(usize),
    /// Remove `w` from `NNList[target]`.
    RemNn(usize),
    /// Insert `e` into `NEList[target]`.
    AddNe(usize),
    /// Remove `e` from `NEList[target]`.
    RemNe(usize),
}

#[inline]
fn bucket_of(v: usize, nbuckets: usize) -> usize {
    v % nbuckets
}

/// Task-local staging area for deferred mutations.
///
/// Cheap to create per rayon fold state; merged pairwise during the
/// reduction and finally absorbed into the queue at the barrier.
#[derive(Debug)]
pub struct DeferredBatch {
    nbuckets: usize,
    buckets: Vec<Vec<(usize, Op)>>,
}

impl DeferredBatch {
    pub fn new(nbuckets: usize) -> Self {
        Self {
            nbuckets,
            buckets: (0..nbuckets).map(|_| Vec::new()).collect(),
        }
    }

    #[inline]
    fn push(&mut self, target: usize, op: Op) {
        self.buckets[bucket_of(target, self.nbuckets)].push((target, op));
    }

    /// Queue "append `w` to `NNList[v]`".
    pub fn add_nn(&mut self, v: usize, w: usize) {
        self.push(v, Op::AddNn(w));
    }

    /// Queue "remove `w` from `NNList[v]`".
    pub fn rem_nn(&mut self, v: usize, w: usize) {
        self.push(v, Op::RemNn(w));
    }

    /// Queue "insert `e` into `NEList[v]`".
    pub fn add_ne(&mut self, v: usize, e: usize) {
        self.push(v, Op::AddNe(e));
    }

    /// Queue "remove `e` from `NEList[v]`".
    pub fn rem_ne(&mut self, v: usize, e: usize) {
        self.push(v, Op::RemNe(e));
    }

    /// Merge two batches produced by sibling tasks.
    pub fn merge(mut self, other: Self) -> Self {
        debug_assert_eq!(self.nbuckets, other.nbuckets);
        for (mine, theirs) in self.buckets.iter_mut().zip(other.buckets) {
            mine.extend(theirs);
        }
        self
    }
}

/// The sharded queue of pending adjacency edits.
#[derive(Debug)]
pub struct DeferredQueue {
    nbuckets: usize,
    buckets: Vec<Vec<(usize, Op)>>,
}

impl DeferredQueue {
    /// Create a queue with `nbuckets` shards; `nbuckets` is normally
    /// `bucket_scaling * thread count`.
    pub fn new(nbuckets: usize) -> Self {
        let nbuckets = nbuckets.max(1);
        Self {
            nbuckets,
            buckets: (0..nbuckets).map(|_| Vec::new()).collect(),
        }
    }

    pub fn nbuckets(&self) -> usize {
        self.nbuckets
    }

    /// Create a task-local batch compatible with this queue.
    pub fn batch(&self) -> DeferredBatch {
        DeferredBatch::new(self.nbuckets)
    }

    /// Take a barrier-side delivery of a task-local batch.
    pub fn absorb(&mut self, batch: DeferredBatch) {
        debug_assert_eq!(batch.nbuckets, self.nbuckets);
        for (mine, theirs) in self.buckets.iter_mut().zip(batch.buckets) {
            mine.extend(theirs);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Vec::is_empty)
    }

    /// Apply all queued mutations, draining the buckets in parallel.
    ///
    /// Each bucket owns the complete edit stream of the vertices hashed to
    /// it, so the per-bucket tasks write disjoint rows of `nnlist` and
    /// `nelist`.
    pub fn commit(&mut self, nnlist: &mut [Vec<usize>], nelist: &mut [Vec<usize>]) {
        let nbuckets = self.nbuckets;
        let nn = ScatterSlice::new(nnlist);
        let ne = ScatterSlice::new(nelist);

        self.buckets
            .par_iter_mut()
            .enumerate()
            .for_each(|(b, ops)| {
                for (v, op) in ops.drain(..) {
                    debug_assert_eq!(bucket_of(v, nbuckets), b);
                    match op {
                        Op::AddNn(w) => {
                            // SAFETY: row v belongs to bucket b, drained only here.
                            let row = unsafe { nn.get_mut(v) };
                            debug_assert!(!row.contains(&w));
                            row.push(w);
                        }
                        Op::RemNn(w) => {
                            let row = unsafe { nn.get_mut(v) };
                            if let Some(pos) = row.iter().position(|&x| x == w) {
                                row.remove(pos);
                            }
                        }
                        Op::AddNe(e) => {
                            let row = unsafe { ne.get_mut(v) };
                            if !row.contains(&e) {
                                row.push(e);
                            }
                        }
                        Op::RemNe(e) => {
                            let row = unsafe { ne.get_mut(v) };
                            if let Some(pos) = row.iter().position(|&x| x == e) {
                                row.swap_remove(pos);
                            }
                        }
                    }
                }
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_applies_all_ops_per_vertex() {
        let mut nn: Vec<Vec<usize>> = vec![vec![1], vec![0], vec![]];
        let mut ne: Vec<Vec<usize>> = vec![vec![7], vec![7], vec![]];

        let mut queue = DeferredQueue::new(4);
        let mut batch = queue.batch();
        batch.add_nn(0, 2);
        batch.add_nn(2, 0);
        batch.rem_nn(1, 0);
        batch.add_ne(2, 9);
        batch.rem_ne(0, 7);
        queue.absorb(batch);

        queue.commit(&mut nn, &mut ne);
        assert!(queue.is_empty());

        assert_eq!(nn[0], vec![1, 2]);
        assert!(nn[1].is_empty());
        assert_eq!(nn[2], vec![0]);
        assert!(ne[0].is_empty());
        assert_eq!(ne[2], vec![9]);
    }

    #[test]
    fn duplicate_ne_inserts_collapse() {
        let mut nn: Vec<Vec<usize>> = vec![vec![]];
        let mut ne: Vec<Vec<usize>> = vec![vec![]];
        let mut queue = DeferredQueue::new(2);
        let mut batch = queue.batch();
        batch.add_ne(0, 3);
        batch.add_ne(0, 3);
        queue.absorb(batch);
        queue.commit(&mut nn, &mut ne);
        assert_eq!(ne[0], vec![3]);
    }

    #[test]
    fn merged_batches_keep_bucket_assignment() {
        let a = {
            let mut b = DeferredBatch::new(3);
            b.add_nn(4, 1);
            b
        };
        let b = {
            let mut b = DeferredBatch::new(3);
            b.add_nn(7, 2);
            b
        };
        let merged = a.merge(b);
        let mut queue = DeferredQueue::new(3);
        queue.absorb(merged);

        let mut nn: Vec<Vec<usize>> = vec![vec![]; 8];
        let mut ne: Vec<Vec<usize>> = vec![vec![]; 8];
        queue.commit(&mut nn, &mut ne);
        assert_eq!(nn[4], vec![1]);
        assert_eq!(nn[7], vec![2]);
    }
}
