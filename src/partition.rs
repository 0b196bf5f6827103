//! Thread-block partitioning of the vertex graph.
//!
//! Coarsening phase 1 assigns every vertex to one of `T` thread blocks and
//! lets each thread collapse only vertices whose whole neighbourhood lies in
//! its own block. The partitioner here is a deterministic breadth-first
//! sweep: vertices are visited in BFS order (restarting for disconnected
//! components) and the order is cut into contiguous chunks of roughly equal
//! *active* weight, where a vertex counts towards the balance only when the
//! caller flags it as a collapse candidate. Cutting a BFS front keeps blocks
//! spatially coherent, which keeps most candidate vertices interior to their
//! block.

use std::collections::VecDeque;

/// Partition the vertex graph into `nparts` blocks.
///
/// `active[v]` marks vertices that carry work (weight 1); inactive vertices
/// have weight 0 and simply follow their BFS position. Every vertex receives
/// a block id in `0..nparts`.
pub fn partition(adjacency: &[Vec<usize>], active: &[bool], nparts: usize) -> Vec<usize> {
    let n = adjacency.len();
    let nparts = nparts.max(1);
    let mut part = vec![0usize; n];
    if nparts == 1 || n == 0 {
        return part;
    }

    let total_weight: usize = active.iter().filter(|&&a| a).count();
    let target = (total_weight / nparts).max(1);

    let mut order = Vec::with_capacity(n);
    let mut seen = vec![false; n];
    let mut queue = VecDeque::new();
    for seed in 0..n {
        if seen[seed] {
            continue;
        }
        seen[seed] = true;
        queue.push_back(seed);
        while let Some(v) = queue.pop_front() {
            order.push(v);
            for &w in &adjacency[v] {
                if !seen[w] {
                    seen[w] = true;
                    queue.push_back(w);
                }
            }
        }
    }

    let mut current = 0usize;
    let mut weight = 0usize;
    for v in order {
        part[v] = current;
        if active[v] {
            weight += 1;
            if weight >= target && current + 1 < nparts {
                current += 1;
                weight = 0;
            }
        }
    }

    part
}

/// True if every neighbour of `v` shares its block, i.e. `v` can be modified
/// without any other thread observing the edit.
pub fn is_interior(adjacency: &[Vec<usize>], part: &[usize], v: usize) -> bool {
    adjacency[v].iter().all(|&w| part[w] == part[v])
}
