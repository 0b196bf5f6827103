//! 2D edge collapse.
//!
//! For every non-corner, owned vertex the identify kernel searches the
//! shortest incident edge below `l_low` that survives four guards: the far
//! endpoint is not on the receive halo, the surface model declares the edge
//! collapsible, no surviving element loses more than a fixed fraction of its
//! area, and no rewired edge grows beyond `l_max`. The per-vertex decision
//! lives in `dynamic_vertex`: a collapse target (`>= 0`), `-1` for inactive
//! vertices, `-2` for vertices whose decision must be recomputed.
//!
//! Execution is phased. Phase 1 partitions the vertex graph into thread
//! blocks and lets each thread collapse, repeatedly, the candidates whose
//! whole neighbourhood lies inside its own block (boundary-surface vertices
//! are left to phase 2 so the surface mirror stays single-writer). Phase 2
//! finishes the partition-boundary and surface candidates in one serial
//! sweep. The distributed phase 3 (halo independent sets and migration)
//! belongs to the layer above this crate.

use crate::geometry;
use crate::mesh::{MeshStore, INVALID};
use crate::parallel::ScatterSlice;
use crate::partition;
use crate::surface::SurfaceModel;
use hashbrown::HashSet;
use rayon::prelude::*;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

/// A collapse is rejected when a surviving element would retain no more than
/// this fraction of its area. The ratio is geometric, not metric: the guard
/// exists to stop near-degenerate triangles, which is a property of the
/// Euclidean shape.
pub const MIN_AREA_RATIO: f64 = 1.0e-3;

/// Shared, partition-disjoint views of the mesh internals used by the
/// collapse kernels.
///
/// # Safety protocol
/// Mutating accessors are only invoked under the coarsening partition
/// discipline: a task collapses a vertex only when the vertex and its whole
/// neighbourhood lie in the task's partition block. Every row or element
/// tuple a collapse touches is reachable only through that closed
/// neighbourhood, so no two tasks ever overlap. Phase 2 uses the same views
/// from a single thread.
struct Views<'a> {
    nloc: usize,
    coords: &'a [f64],
    metric: &'a [f64],
    nn: ScatterSlice<'a, Vec<usize>>,
    ne: ScatterSlice<'a, Vec<usize>>,
    en: ScatterSlice<'a, usize>,
    owner: &'a [u32],
    rank: u32,
    halo: &'a HashSet<usize>,
}

impl<'a> Views<'a> {
    fn nn(&self, v: usize) -> &[usize] {
        // SAFETY: reads follow the partition protocol described on the type.
        unsafe { self.nn.get(v) }
    }

    #[allow(clippy::mut_from_ref)]
    fn nn_mut(&self, v: usize) -> &mut Vec<usize> {
        // SAFETY: as above.
        unsafe { self.nn.get_mut(v) }
    }

    fn ne(&self, v: usize) -> &[usize] {
        // SAFETY: as above.
        unsafe { self.ne.get(v) }
    }

    #[allow(clippy::mut_from_ref)]
    fn ne_mut(&self, v: usize) -> &mut Vec<usize> {
        // SAFETY: as above.
        unsafe { self.ne.get_mut(v) }
    }

    fn element(&self, e: usize) -> &[usize] {
        // SAFETY: as above.
        unsafe { self.en.slice_mut(e * self.nloc, self.nloc) }
    }

    #[allow(clippy::mut_from_ref)]
    fn element_mut(&self, e: usize) -> &mut [usize] {
        // SAFETY: as above.
        unsafe { self.en.slice_mut(e * self.nloc, self.nloc) }
    }

    fn coords_of(&self, v: usize) -> &[f64] {
        &self.coords[v * 2..v * 2 + 2]
    }

    fn metric_of(&self, v: usize) -> &[f64] {
        &self.metric[v * 3..v * 3 + 3]
    }

    fn edge_length(&self, a: usize, b: usize) -> f64 {
        geometry::edge_length(
            2,
            self.coords_of(a),
            self.coords_of(b),
            self.metric_of(a),
            self.metric_of(b),
        )
    }

    fn is_owned(&self, v: usize) -> bool {
        self.owner[v] == self.rank
    }

    fn is_halo(&self, v: usize) -> bool {
        self.halo.contains(&v)
    }

    fn erase_element(&self, e: usize) {
        let row = self.element_mut(e);
        let mut verts = [INVALID; 3];
        verts.copy_from_slice(row);
        row[0] = INVALID;
        for &v in &verts {
            let list = self.ne_mut(v);
            if let Some(pos) = list.iter().position(|&x| x == e) {
                list.swap_remove(pos);
            }
        }
    }
}

/// 2D coarsening pass over a shared mesh.
pub struct Coarsen2D {
    l_low: f64,
    l_max: f64,
}

impl Coarsen2D {
    pub fn new(l_low: f64, l_max: f64) -> Self {
        Self { l_low, l_max }
    }

    /// Collapse all admissible short edges. Returns the number of collapses.
    pub fn coarsen(&self, mesh: &mut MeshStore, surface: &mut SurfaceModel) -> usize {
        debug_assert_eq!(mesh.dim(), 2);
        let nverts = mesh.num_vertices();
        let nthreads = rayon::current_num_threads();

        // Thread partitions are computed on the intact adjacency, before the
        // views take over the mesh internals.
        let candidate_hint: Vec<bool> = (0..nverts)
            .into_par_iter()
            .map(|v| {
                !mesh.nnlist[v].is_empty()
                    && mesh.nnlist[v]
                        .iter()
                        .any(|&w| mesh.edge_length(v, w) < self.l_low)
            })
            .collect();
        let part = partition::partition(&mesh.nnlist, &candidate_hint, nthreads);
        let interior: Vec<bool> = (0..nverts)
            .into_par_iter()
            .map(|v| partition::is_interior(&mesh.nnlist, &part, v))
            .collect();

        let dv: Vec<AtomicI64> = (0..nverts)
            .map(|v| AtomicI64::new(if mesh.nnlist[v].is_empty() { -1 } else { -2 }))
            .collect();

        let collapses = AtomicUsize::new(0);

        {
            let views = Views {
                nloc: 3,
                coords: &mesh.coords,
                metric: &mesh.metric,
                nn: ScatterSlice::new(&mut mesh.nnlist[..]),
                ne: ScatterSlice::new(&mut mesh.nelist[..]),
                en: ScatterSlice::new(&mut mesh.enlist[..]),
                owner: &mesh.owner,
                rank: mesh.rank,
                halo: &mesh.recv_halo,
            };

            // Initial decisions, in parallel over disjoint dv slots.
            (0..nverts).into_par_iter().for_each(|v| {
                if dv[v].load(Ordering::Relaxed) == -2 {
                    dv[v].store(
                        identify_kernel(&views, surface, v, self.l_low, self.l_max),
                        Ordering::Relaxed,
                    );
                }
            });

            // Phase 1: each thread block collapses its interior candidates
            // until none is left. Surface vertices wait for phase 2.
            (0..nthreads).into_par_iter().for_each(|block| {
                let list: Vec<usize> = (0..nverts)
                    .filter(|&v| {
                        part[v] == block
                            && interior[v]
                            && !views.is_halo(v)
                            && !surface.contains(v)
                            && dv[v].load(Ordering::Relaxed) >= 0
                    })
                    .collect();

                loop {
                    let mut cnt = 0;
                    for &rm in &list {
                        let target = dv[rm].load(Ordering::Relaxed);
                        if target < 0 {
                            continue;
                        }
                        collapse_kernel(&views, rm, target as usize);
                        dv[rm].store(-1, Ordering::Relaxed);
                        reevaluate(&views, surface, &dv, target as usize, self.l_low, self.l_max);
                        cnt += 1;
                    }
                    if cnt == 0 {
                        break;
                    }
                    collapses.fetch_add(cnt, Ordering::Relaxed);
                }
            });

            // Phase 2: finish the collapses phase 1 could not reach, on a
            // single thread with the surface mirrored eagerly.
            loop {
                let mut followup = false;
                for rm in 0..nverts {
                    let target = dv[rm].load(Ordering::Relaxed);
                    if target < 0 || views.is_halo(rm) {
                        continue;
                    }
                    let target = target as usize;

                    if surface.contains(rm) && surface.contains(target) {
                        surface.collapse(rm, target);
                    }
                    collapse_kernel(&views, rm, target);
                    dv[rm].store(-1, Ordering::Relaxed);
                    reevaluate(&views, surface, &dv, target, self.l_low, self.l_max);
                    collapses.fetch_add(1, Ordering::Relaxed);

                    if dv[target].load(Ordering::Relaxed) >= 0
                        || views
                            .nn(target)
                            .iter()
                            .any(|&w| dv[w].load(Ordering::Relaxed) >= 0)
                    {
                        followup = true;
                    }
                }
                if !followup {
                    break;
                }
            }
        }

        mesh.debug_assert_invariants();
        collapses.load(Ordering::Relaxed)
    }
}

/// Decide what, if anything, `rm` should collapse onto.
///
/// Returns the target vertex, `-1` when no short edge exists (or the vertex
/// is pinned), `-2` when every short edge was rejected and the decision
/// should be retried after the neighbourhood changes.
fn identify_kernel(
    views: &Views<'_>,
    surface: &SurfaceModel,
    rm: usize,
    l_low: f64,
    l_max: f64,
) -> i64 {
    if views.nn(rm).is_empty() {
        return -1;
    }
    if surface.is_corner(rm) {
        return -1;
    }
    if !views.is_owned(rm) {
        return -1;
    }

    // Shortest first; ties broken on index so decisions are deterministic.
    let mut short_edges: Vec<(f64, usize)> = Vec::new();
    for &nb in views.nn(rm) {
        if views.is_halo(nb) {
            continue;
        }
        if !surface.is_collapsible(rm, nb) {
            continue;
        }
        let length = views.edge_length(rm, nb);
        if length < l_low {
            short_edges.push((length, nb));
        }
    }
    short_edges.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap().then(a.1.cmp(&b.1)));

    let mut reject = false;
    let mut target: i64 = -1;
    for &(_, tgt) in &short_edges {
        target = tgt as i64;
        reject = false;

        // Elements on the collapsing edge disappear; all other elements of
        // rm are rewritten and must keep a healthy area.
        let collapsed: Vec<usize> = views
            .ne(rm)
            .iter()
            .copied()
            .filter(|e| views.ne(tgt).contains(e))
            .collect();

        for &e in views.ne(rm) {
            if collapsed.contains(&e) {
                continue;
            }
            let n = views.element(e);
            let mut p = [0usize; 3];
            for i in 0..3 {
                p[i] = if n[i] == rm { tgt } else { n[i] };
            }
            let orig_area =
                geometry::area(views.coords_of(n[0]), views.coords_of(n[1]), views.coords_of(n[2]));
            let new_area =
                geometry::area(views.coords_of(p[0]), views.coords_of(p[1]), views.coords_of(p[2]));
            if new_area / orig_area <= MIN_AREA_RATIO {
                reject = true;
                break;
            }
        }

        if !reject {
            // No rewired edge may become over-long.
            for &nb in views.nn(rm) {
                if nb == tgt {
                    continue;
                }
                if views.edge_length(tgt, nb) > l_max {
                    reject = true;
                    break;
                }
            }
        }

        if !reject {
            break;
        }
    }

    if reject {
        return -2;
    }
    target
}

/// Collapse `rm` onto `target`: erase the shared elements, rewrite the rest,
/// and stitch the node-node lists of the neighbourhood.
fn collapse_kernel(views: &Views<'_>, rm: usize, target: usize) {
    let collapsed: Vec<usize> = views
        .ne(rm)
        .iter()
        .copied()
        .filter(|e| views.ne(target).contains(e))
        .collect();
    for e in collapsed {
        views.erase_element(e);
    }

    // Rewrite the surviving elements of rm and hand them to target.
    let remaining: Vec<usize> = views.ne(rm).to_vec();
    for &e in &remaining {
        let row = views.element_mut(e);
        for slot in row.iter_mut() {
            if *slot == rm {
                *slot = target;
                break;
            }
        }
        let list = views.ne_mut(target);
        if !list.contains(&e) {
            list.push(e);
        }
    }

    // Stitch NNLists: neighbours already adjacent to target drop their rm
    // entry, the rest rewire it to target; target adopts the union.
    let mut new_patch: Vec<usize> = views.nn(target).to_vec();
    let rm_neighbours: Vec<usize> = views.nn(rm).to_vec();
    for &nb in &rm_neighbours {
        if nb == target {
            continue;
        }
        let list = views.nn_mut(nb);
        let back = list
            .iter()
            .position(|&x| x == rm)
            .expect("collapse: missing back-reference");
        if new_patch.contains(&nb) {
            list.remove(back);
        } else {
            list[back] = target;
        }
        if !new_patch.contains(&nb) {
            new_patch.push(nb);
        }
    }
    new_patch.retain(|&v| v != rm);
    *views.nn_mut(target) = new_patch;

    views.nn_mut(rm).clear();
    views.ne_mut(rm).clear();
}

/// After a collapse, the target and its neighbourhood need fresh decisions.
fn reevaluate(
    views: &Views<'_>,
    surface: &SurfaceModel,
    dv: &[AtomicI64],
    target: usize,
    l_low: f64,
    l_max: f64,
) {
    if views.is_owned(target) {
        dv[target].store(
            identify_kernel(views, surface, target, l_low, l_max),
            Ordering::Relaxed,
        );
    }
    for &nb in views.nn(target) {
        if views.is_owned(nb) {
            dv[nb].store(
                identify_kernel(views, surface, nb, l_low, l_max),
                Ordering::Relaxed,
            );
        }
    }
}
