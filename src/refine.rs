//! 2D edge bisection.
//!
//! Every edge whose metric length exceeds `l_max` is split exactly once per
//! pass. The pass is staged:
//!
//! 1. a parallel marking sweep computes the split set and the midpoint
//!    coordinates/metrics in task-local buffers (each edge evaluated once,
//!    from its lesser-gid endpoint),
//! 2. a single writer appends the staged vertices and publishes the
//!    edge-to-vertex table,
//! 3. parallel passes mark each affected element with its new vertices and
//!    rewire the node-node links of the split edges,
//! 4. element templating rewrites each affected triangle into 2, 3 or 4
//!    children, reserving element ids through an atomic capture and queueing
//!    every adjacency edit,
//! 5. the deferred queue commits bucket-by-bucket.
//!
//! The midpoint is placed at the metric-weighted position that equalises the
//! metric lengths of the two halves, and the 2-split template draws the
//! shorter of the two candidate diagonals. Refinement never inverts an
//! element: children are strict subdivisions of valid triangles.

use crate::geometry;
use crate::mesh::{deferred::DeferredBatch, deferred::DeferredQueue, MeshStore, INVALID};
use crate::parallel::{IndexCapture, ScatterSlice};
use ahash::AHashMap;
use rayon::prelude::*;
use std::sync::atomic::{AtomicI64, Ordering};

/// A staged edge split: endpoints ordered by gid, plus the midpoint data.
struct Split {
    a: usize,
    b: usize,
    x: [f64; 2],
    m: [f64; 3],
}

/// 2D refinement pass over a shared mesh.
pub struct Refine2D {
    l_max: f64,
    nbuckets: usize,
}

impl Refine2D {
    /// `l_max` is the maximum admissible metric edge length; `nbuckets` the
    /// shard count of the deferred-mutation queue.
    pub fn new(l_max: f64, nbuckets: usize) -> Self {
        Self { l_max, nbuckets }
    }

    /// Split all over-long edges once. Returns the number of edges split.
    pub fn refine(&self, mesh: &mut MeshStore) -> usize {
        debug_assert_eq!(mesh.dim(), 2);
        let orig_nverts = mesh.num_vertices();
        let orig_nelems = mesh.num_elements();

        // Pass 1: mark and stage. The gid ordering evaluates each edge once.
        let splits: Vec<Split> = (0..orig_nverts)
            .into_par_iter()
            .flat_map_iter(|i| {
                let mut local = Vec::new();
                for &j in mesh.neighbours(i) {
                    if mesh.gid_of(i) < mesh.gid_of(j) && mesh.edge_length(i, j) > self.l_max {
                        local.push(stage_split(mesh, i, j));
                    }
                }
                local.into_iter()
            })
            .collect();

        if splits.is_empty() {
            return 0;
        }

        // Pass 2: single writer appends the staged vertices and builds the
        // global edge-to-new-vertex table.
        let mut edge_to_vertex: AHashMap<(usize, usize), usize> =
            AHashMap::with_capacity(splits.len());
        for split in &splits {
            let vid = mesh.append_vertex(&split.x, &split.m);
            edge_to_vertex.insert((split.a, split.b), vid);
        }

        // Pass 3a: mark each element with the new vertex on each split edge.
        // Slot `3 * eid + k` is the edge opposite local vertex k; every slot
        // is written at most once, by the task owning that edge.
        let new_vertex_per_element: Vec<AtomicI64> =
            (0..3 * orig_nelems).map(|_| AtomicI64::new(-1)).collect();
        splits.par_iter().enumerate().for_each(|(s, split)| {
            let vid = orig_nverts + s;
            for e in mesh.edge_elements(split.a, split.b) {
                let k = edge_number(mesh.element(e), split.a, split.b);
                new_vertex_per_element[3 * e + k].store(vid as i64, Ordering::Relaxed);
            }
        });

        // Pass 3b: rewire node-node links of the split edges. Each task owns
        // one adjacency row: original vertices swap the far endpoint for the
        // midpoint, new vertices link to both endpoints.
        {
            let gid = &mesh.gid;
            let map = &edge_to_vertex;
            let split_rows = &splits;
            mesh.nnlist
                .par_iter_mut()
                .enumerate()
                .for_each(|(v, row)| {
                    if v >= orig_nverts {
                        let split = &split_rows[v - orig_nverts];
                        row.clear();
                        row.push(split.a);
                        row.push(split.b);
                    } else {
                        for slot in row.iter_mut() {
                            let w = *slot;
                            let key = if gid[v] < gid[w] { (v, w) } else { (w, v) };
                            if let Some(&vid) = map.get(&key) {
                                *slot = vid;
                            }
                        }
                    }
                });
        }

        // Pass 4: element templating.
        mesh.grow_elements(3 * orig_nelems);
        let capture = IndexCapture::new(orig_nelems);
        let mut queue = DeferredQueue::new(self.nbuckets);

        let batch = {
            let coords = &mesh.coords;
            let metric = &mesh.metric;
            let en = ScatterSlice::new(&mut mesh.enlist[..]);
            let bd = ScatterSlice::new(&mut mesh.boundary[..]);
            let nve = &new_vertex_per_element;
            let nbuckets = self.nbuckets;

            (0..orig_nelems)
                .into_par_iter()
                .fold(
                    || DeferredBatch::new(nbuckets),
                    |mut ops, eid| {
                        // SAFETY: each original element row is read and
                        // rewritten only by its own iteration; new rows are
                        // written only through captured ranges.
                        let n = unsafe {
                            [*en.get(3 * eid), *en.get(3 * eid + 1), *en.get(3 * eid + 2)]
                        };
                        if n[0] == INVALID {
                            return ops;
                        }
                        let nv = [
                            nve[3 * eid].load(Ordering::Relaxed),
                            nve[3 * eid + 1].load(Ordering::Relaxed),
                            nve[3 * eid + 2].load(Ordering::Relaxed),
                        ];
                        if nv.iter().all(|&v| v < 0) {
                            return ops;
                        }
                        let b = unsafe {
                            [*bd.get(3 * eid), *bd.get(3 * eid + 1), *bd.get(3 * eid + 2)]
                        };
                        refine_element(
                            coords, metric, &en, &bd, &capture, &mut ops, eid, n, b, nv,
                        );
                        ops
                    },
                )
                .reduce(
                    || DeferredBatch::new(nbuckets),
                    DeferredBatch::merge,
                )
        };
        queue.absorb(batch);

        mesh.truncate_elements(capture.value());

        // Pass 5: commit all queued adjacency edits at the barrier.
        queue.commit(&mut mesh.nnlist, &mut mesh.nelist);

        mesh.debug_assert_invariants();
        splits.len()
    }
}

/// Stage the midpoint of edge `(n0, n1)`, `gid(n0) < gid(n1)`.
///
/// The weight equalises the metric lengths of the two half edges; the
/// midpoint metric is interpolated with the same weight.
fn stage_split(mesh: &MeshStore, n0: usize, n1: usize) -> Split {
    let x0 = mesh.coords_of(n0);
    let x1 = mesh.coords_of(n1);
    let m0 = mesh.metric_of(n0);
    let m1 = mesh.metric_of(n1);

    let l0 = geometry::edge_length_single(2, x0, x1, m0);
    let l1 = geometry::edge_length_single(2, x0, x1, m1);
    let weight = 1.0 / (1.0 + (l0 / l1).sqrt());

    let x = [x0[0] + weight * (x1[0] - x0[0]), x0[1] + weight * (x1[1] - x0[1])];
    let mut m = [0.0; 3];
    geometry::interpolate_metric(m0, m1, weight, &mut m);
    debug_assert!(m.iter().all(|v| v.is_finite()));

    Split { a: n0, b: n1, x, m }
}

/// Local edge number within an element: edge `k` joins the two vertices
/// other than local vertex `k`.
fn edge_number(n: &[usize], v1: usize, v2: usize) -> usize {
    if n[1] == v1 || n[1] == v2 {
        if n[2] == v1 || n[2] == v2 {
            0
        } else {
            2
        }
    } else {
        1
    }
}

#[allow(clippy::too_many_arguments)]
fn refine_element(
    coords: &[f64],
    metric: &[f64],
    en: &ScatterSlice<'_, usize>,
    bd: &ScatterSlice<'_, i32>,
    capture: &IndexCapture,
    ops: &mut DeferredBatch,
    eid: usize,
    n: [usize; 3],
    b: [i32; 3],
    nv: [i64; 3],
) {
    let refine_cnt = nv.iter().filter(|&&v| v >= 0).count();

    // SAFETY (all writes below): `eid` is owned by this iteration and every
    // other row index comes out of `capture`, so the ranges are disjoint
    // across tasks.
    let write = |e: usize, verts: [usize; 3], tags: [i32; 3]| unsafe {
        en.slice_mut(3 * e, 3).copy_from_slice(&verts);
        bd.slice_mut(3 * e, 3).copy_from_slice(&tags);
    };

    if refine_cnt == 1 {
        let j = (0..3).find(|&j| nv[j] >= 0).unwrap();
        let vid = nv[j] as usize;
        let r = [n[j], n[(j + 1) % 3], n[(j + 2) % 3]];
        let rb = [b[j], b[(j + 1) % 3], b[(j + 2) % 3]];

        let ele1 = capture.capture(1);

        ops.add_nn(vid, r[0]);
        ops.add_nn(r[0], vid);

        ops.add_ne(r[0], ele1);
        ops.add_ne(vid, eid);
        ops.add_ne(vid, ele1);
        ops.rem_ne(r[2], eid);
        ops.add_ne(r[2], ele1);

        write(eid, [r[0], r[1], vid], [rb[0], 0, rb[2]]);
        write(ele1, [r[0], vid, r[2]], [rb[0], rb[1], 0]);
    } else if refine_cnt == 2 {
        let j = (0..3).find(|&j| nv[j] < 0).unwrap();
        let vid = [nv[(j + 1) % 3] as usize, nv[(j + 2) % 3] as usize];
        let r = [n[j], n[(j + 1) % 3], n[(j + 2) % 3]];
        let rb = [b[j], b[(j + 1) % 3], b[(j + 2) % 3]];

        // Draw the shorter metric diagonal.
        let ldiag0 = edge_len(coords, metric, r[1], vid[0]);
        let ldiag1 = edge_len(coords, metric, r[2], vid[1]);
        let offset = if ldiag0 < ldiag1 { 0 } else { 1 };

        let ele0v = [r[0], vid[1], vid[0]];
        let ele1v = [vid[offset], r[1], r[2]];
        let ele2v = [vid[0], vid[1], r[offset + 1]];

        let ele0b = [0, rb[1], rb[2]];
        let ele1b = [
            rb[0],
            if offset == 0 { rb[1] } else { 0 },
            if offset == 0 { 0 } else { rb[2] },
        ];
        let ele2b = [
            if offset == 0 { rb[2] } else { 0 },
            if offset == 0 { 0 } else { rb[1] },
            0,
        ];

        let ele0 = capture.capture(2);
        let ele2 = ele0 + 1;

        ops.add_nn(vid[0], vid[1]);
        ops.add_nn(vid[1], vid[0]);
        ops.add_nn(vid[offset], r[offset + 1]);
        ops.add_nn(r[offset + 1], vid[offset]);

        ops.add_ne(r[offset + 1], ele2);
        ops.rem_ne(r[0], eid);
        ops.add_ne(r[0], ele0);
        ops.add_ne(vid[offset], eid);
        ops.add_ne(vid[offset], ele0);
        ops.add_ne(vid[offset], ele2);
        ops.add_ne(vid[(offset + 1) % 2], ele0);
        ops.add_ne(vid[(offset + 1) % 2], ele2);

        write(eid, ele1v, ele1b);
        write(ele0, ele0v, ele0b);
        write(ele2, ele2v, ele2b);
    } else {
        // Uniform 4-way subdivision.
        let v = [nv[0] as usize, nv[1] as usize, nv[2] as usize];
        let ele1 = capture.capture(3);
        let ele2 = ele1 + 1;
        let ele3 = ele1 + 2;

        ops.add_nn(v[0], v[1]);
        ops.add_nn(v[0], v[2]);
        ops.add_nn(v[1], v[0]);
        ops.add_nn(v[1], v[2]);
        ops.add_nn(v[2], v[0]);
        ops.add_nn(v[2], v[1]);

        ops.rem_ne(n[1], eid);
        ops.add_ne(n[1], ele1);
        ops.rem_ne(n[2], eid);
        ops.add_ne(n[2], ele2);

        ops.add_ne(v[0], ele1);
        ops.add_ne(v[0], ele2);
        ops.add_ne(v[0], ele3);
        ops.add_ne(v[1], eid);
        ops.add_ne(v[1], ele2);
        ops.add_ne(v[1], ele3);
        ops.add_ne(v[2], eid);
        ops.add_ne(v[2], ele1);
        ops.add_ne(v[2], ele3);

        write(eid, [n[0], v[2], v[1]], [0, b[1], b[2]]);
        write(ele1, [n[1], v[0], v[2]], [0, b[2], b[0]]);
        write(ele2, [n[2], v[1], v[0]], [0, b[0], b[1]]);
        write(ele3, [v[0], v[1], v[2]], [0, 0, 0]);
    }
}

fn edge_len(coords: &[f64], metric: &[f64], a: usize, b: usize) -> f64 {
    geometry::edge_length(
        2,
        &coords[2 * a..2 * a + 2],
        &coords[2 * b..2 * b + 2],
        &metric[3 * a..3 * a + 3],
        &metric[3 * b..3 * b + 3],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{import, MeshData};

    fn square_with_metric(scale: f64) -> MeshStore {
        // Isotropic metric M = (1/h^2) I measures a length-h edge as 1;
        // scale > 1 makes every edge of the unit square over-long.
        let m = scale * scale;
        let data = MeshData {
            dim: 2,
            coords: vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0],
            elements: vec![0, 1, 2, 1, 3, 2],
            metric: Some(vec![
                m, 0.0, m, m, 0.0, m, m, 0.0, m, m, 0.0, m,
            ]),
            boundary: None,
        };
        import(&data).unwrap()
    }

    #[test]
    fn no_split_below_threshold() {
        let mut mesh = square_with_metric(1.0);
        let refine = Refine2D::new(2.0_f64.sqrt() * 1.1, 8);
        assert_eq!(refine.refine(&mut mesh), 0);
        assert_eq!(mesh.num_vertices(), 4);
    }

    #[test]
    fn uniform_refinement_splits_every_edge() {
        let mut mesh = square_with_metric(2.0);
        let refine = Refine2D::new(2.0_f64.sqrt(), 8);
        let nsplit = refine.refine(&mut mesh);
        // 5 edges, all of metric length >= 2.
        assert_eq!(nsplit, 5);
        assert_eq!(mesh.num_vertices(), 9);
        // Two 3-splits produce 8 triangles.
        let alive = (0..mesh.num_elements())
            .filter(|&e| mesh.element_is_alive(e))
            .count();
        assert_eq!(alive, 8);
        assert!(mesh.validate_invariants().is_ok());
    }

    #[test]
    fn refinement_reduces_long_edges() {
        let mut mesh = square_with_metric(2.0);
        let l_max = 2.0_f64.sqrt();
        let refine = Refine2D::new(l_max, 8);
        for _ in 0..3 {
            if refine.refine(&mut mesh) == 0 {
                break;
            }
        }
        for v in 0..mesh.num_vertices() {
            for &w in mesh.neighbours(v) {
                if v < w {
                    assert!(
                        mesh.edge_length(v, w) <= l_max * (1.0 + 1e-9),
                        "edge ({v}, {w}) still over-long"
                    );
                }
            }
        }
    }

    #[test]
    fn midpoint_shifts_towards_the_fine_metric() {
        // Strongly graded metric: the weighted midpoint moves towards the
        // endpoint whose metric demands shorter edges.
        let data = MeshData {
            dim: 2,
            coords: vec![0.0, 0.0, 1.0, 0.0, 0.5, 1.0],
            elements: vec![0, 1, 2],
            metric: Some(vec![
                100.0, 0.0, 100.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0,
            ]),
            boundary: None,
        };
        let mesh = import(&data).unwrap();
        let split = stage_split(&mesh, 0, 1);
        // w = 1 / (1 + sqrt(10)) for this grading.
        let expected = 1.0 / (1.0 + 10.0_f64.sqrt());
        assert!((split.x[0] - expected).abs() < 1e-12);
        assert!(split.x[0] < 0.5);
        // The midpoint metric interpolates between the endpoint tensors.
        assert!(split.m[0] < 100.0 && split.m[0] > 1.0);
    }

    #[test]
    fn boundary_tags_propagate() {
        let mut mesh = square_with_metric(2.0);
        let refine = Refine2D::new(2.0_f64.sqrt(), 8);
        refine.refine(&mut mesh);

        // Count boundary facets: the refined square must still close.
        let mut incidence = vec![0usize; mesh.num_vertices()];
        for e in 0..mesh.num_elements() {
            if !mesh.element_is_alive(e) {
                continue;
            }
            let n = mesh.element(e).to_vec();
            let tags = mesh.boundary_of(e).to_vec();
            for i in 0..3 {
                if tags[i] > 0 {
                    for (j, &v) in n.iter().enumerate() {
                        if j != i {
                            incidence[v] += 1;
                        }
                    }
                }
            }
        }
        for (v, &cnt) in incidence.iter().enumerate() {
            assert!(cnt == 0 || cnt == 2, "vertex {v} has {cnt} boundary facets");
        }
    }
}
