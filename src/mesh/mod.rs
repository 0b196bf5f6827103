//! `MeshStore`: arena storage and adjacency for simplicial meshes.
//!
//! Vertices and elements live in flat arenas. An element is a `nloc = d + 1`
//! tuple of vertex indices in a fixed positive orientation plus a per-facet
//! boundary tag row; erasing an element writes [`INVALID`] into its first
//! slot and prunes it from the node-element lists. A vertex is erased by
//! clearing its adjacency rows. Physical removal is deferred to
//! [`MeshStore::defragment`], which compacts both arenas and renumbers every
//! index in the mesh.
//!
//! Adjacency is kept as two per-vertex lists:
//! - `NNList[v]`: vertices joined to `v` by an edge (no duplicates; order is
//!   not semantically significant, but operators that rely on positional
//!   indexing within a single pass can count on it being stable),
//! - `NEList[v]`: elements incident to `v` (no duplicates).
//!
//! During parallel passes operators queue adjacency edits through
//! [`deferred::DeferredQueue`] rather than touching the lists directly; see
//! that module for the bucket protocol.

pub mod deferred;

use crate::error::AdaptError;
use crate::geometry;
use hashbrown::HashSet;
use rayon::prelude::*;

/// Sentinel index marking an erased element slot or an empty extension slot.
pub const INVALID: usize = usize::MAX;

/// Arena-backed mesh storage with adjacency.
pub struct MeshStore {
    dim: usize,
    nloc: usize,
    msize: usize,
    /// Vertex coordinates, `dim` per vertex.
    pub(crate) coords: Vec<f64>,
    /// Packed per-vertex metric tensors, `msize` per vertex.
    pub(crate) metric: Vec<f64>,
    /// Element-node table, `nloc` per element; `enlist[e * nloc] == INVALID`
    /// marks an erased element.
    pub(crate) enlist: Vec<usize>,
    /// Per-facet boundary tags, `nloc` per element; facet `i` is opposite
    /// local vertex `i`. 0 is interior.
    pub(crate) boundary: Vec<i32>,
    /// Node-node adjacency.
    pub(crate) nnlist: Vec<Vec<usize>>,
    /// Node-element adjacency.
    pub(crate) nelist: Vec<Vec<usize>>,
    /// Global vertex ids, used for deterministic edge orientation.
    pub(crate) gid: Vec<u64>,
    /// Owning process of each vertex.
    pub(crate) owner: Vec<u32>,
    pub(crate) rank: u32,
    /// Vertices visible locally but owned elsewhere; immutable to operators.
    pub(crate) recv_halo: HashSet<usize>,
}

/// Aggregate mesh statistics driving sweep convergence.
#[derive(Clone, Copy, Debug, Default)]
pub struct MeshStats {
    /// Number of alive vertices.
    pub vertices: usize,
    /// Number of alive elements.
    pub elements: usize,
    /// Number of alive edges.
    pub edges: usize,
    /// RMS deviation of metric edge lengths from 1.
    pub length_rms: f64,
    /// Minimum element quality.
    pub quality_min: f64,
    /// Mean element quality.
    pub quality_mean: f64,
    /// RMS deviation of element quality from 1.
    pub quality_rms: f64,
}

impl MeshStore {
    /// Build a mesh from validated raw arrays. Adjacency is derived from the
    /// element-node table; callers go through [`crate::io::import`] which
    /// performs the §7 input validation first.
    pub(crate) fn from_raw(
        dim: usize,
        coords: Vec<f64>,
        metric: Vec<f64>,
        enlist: Vec<usize>,
        boundary: Vec<i32>,
    ) -> Self {
        let nloc = dim + 1;
        let nverts = coords.len() / dim;
        let mut mesh = Self {
            dim,
            nloc,
            msize: geometry::metric_len(dim),
            coords,
            metric,
            enlist,
            boundary,
            nnlist: Vec::new(),
            nelist: Vec::new(),
            gid: (0..nverts as u64).collect(),
            owner: vec![0; nverts],
            rank: 0,
            recv_halo: HashSet::new(),
        };
        mesh.create_adjacency();
        mesh
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Vertices per element (`dim + 1`).
    pub fn nloc(&self) -> usize {
        self.nloc
    }

    /// Packed metric entries per vertex.
    pub fn msize(&self) -> usize {
        self.msize
    }

    /// Vertex arena length, including erased slots.
    pub fn num_vertices(&self) -> usize {
        self.coords.len() / self.dim
    }

    /// Element arena length, including erased slots.
    pub fn num_elements(&self) -> usize {
        self.enlist.len() / self.nloc
    }

    pub fn vertex_is_alive(&self, v: usize) -> bool {
        !self.nnlist[v].is_empty()
    }

    pub fn element_is_alive(&self, e: usize) -> bool {
        self.enlist[e * self.nloc] != INVALID
    }

    pub fn coords_of(&self, v: usize) -> &[f64] {
        &self.coords[v * self.dim..(v + 1) * self.dim]
    }

    pub fn metric_of(&self, v: usize) -> &[f64] {
        &self.metric[v * self.msize..(v + 1) * self.msize]
    }

    /// The vertex tuple of element `e`; slot 0 is [`INVALID`] if erased.
    pub fn element(&self, e: usize) -> &[usize] {
        &self.enlist[e * self.nloc..(e + 1) * self.nloc]
    }

    /// Per-facet boundary tags of element `e`.
    pub fn boundary_of(&self, e: usize) -> &[i32] {
        &self.boundary[e * self.nloc..(e + 1) * self.nloc]
    }

    pub fn neighbours(&self, v: usize) -> &[usize] {
        &self.nnlist[v]
    }

    pub fn elements_of(&self, v: usize) -> &[usize] {
        &self.nelist[v]
    }

    pub fn gid_of(&self, v: usize) -> u64 {
        self.gid[v]
    }

    /// True if `v` is owned by another process and merely visible here.
    pub fn is_halo(&self, v: usize) -> bool {
        self.recv_halo.contains(&v)
    }

    pub fn is_owned(&self, v: usize) -> bool {
        self.owner[v] == self.rank
    }

    /// Mark `v` as a receive-halo vertex owned by `owner`. Operators will
    /// neither move nor delete it, nor modify any element incident to it.
    pub fn mark_halo(&mut self, v: usize, owner: u32) {
        self.owner[v] = owner;
        self.recv_halo.insert(v);
    }

    /// Append a vertex with coordinates `x` and packed metric `m`.
    pub fn append_vertex(&mut self, x: &[f64], m: &[f64]) -> usize {
        debug_assert_eq!(x.len(), self.dim);
        debug_assert_eq!(m.len(), self.msize);
        let v = self.num_vertices();
        self.coords.extend_from_slice(x);
        self.metric.extend_from_slice(m);
        self.nnlist.push(Vec::new());
        self.nelist.push(Vec::new());
        self.gid.push(v as u64);
        self.owner.push(self.rank);
        v
    }

    /// Append an element with interior facets; adjacency is the caller's
    /// responsibility (operators queue it, [`Self::create_adjacency`] rebuilds
    /// it wholesale).
    pub fn append_element(&mut self, verts: &[usize]) -> usize {
        self.append_element_with_boundary(verts, &vec![0; self.nloc])
    }

    /// Append an element with explicit per-facet boundary tags.
    pub fn append_element_with_boundary(&mut self, verts: &[usize], bdry: &[i32]) -> usize {
        debug_assert_eq!(verts.len(), self.nloc);
        let e = self.num_elements();
        self.enlist.extend_from_slice(verts);
        self.boundary.extend_from_slice(bdry);
        e
    }

    /// Logically erase element `e`: prune it from its vertices' NELists and
    /// sentinel its first slot.
    pub fn erase_element(&mut self, e: usize) {
        let start = e * self.nloc;
        let mut verts = [INVALID; 4];
        verts[..self.nloc].copy_from_slice(&self.enlist[start..start + self.nloc]);
        for &v in &verts[..self.nloc] {
            if v == INVALID {
                continue;
            }
            if let Some(pos) = self.nelist[v].iter().position(|&x| x == e) {
                self.nelist[v].swap_remove(pos);
            }
        }
        self.enlist[start] = INVALID;
    }

    /// Logically erase vertex `v` by clearing its adjacency; the slot is
    /// reclaimed by [`Self::defragment`].
    pub fn erase_vertex(&mut self, v: usize) {
        self.nnlist[v].clear();
        self.nelist[v].clear();
    }

    /// Metric length of the edge `(a, b)`; symmetric in its arguments.
    pub fn edge_length(&self, a: usize, b: usize) -> f64 {
        geometry::edge_length(
            self.dim,
            self.coords_of(a),
            self.coords_of(b),
            self.metric_of(a),
            self.metric_of(b),
        )
    }

    /// Lipnikov quality of element `e`; 0 for erased elements.
    pub fn quality(&self, e: usize) -> f64 {
        let n = self.element(e);
        if n[0] == INVALID {
            return 0.0;
        }
        match self.dim {
            2 => geometry::lipnikov_2d(
                [self.coords_of(n[0]), self.coords_of(n[1]), self.coords_of(n[2])],
                [self.metric_of(n[0]), self.metric_of(n[1]), self.metric_of(n[2])],
            ),
            _ => geometry::lipnikov_3d(
                [
                    self.coords_of(n[0]),
                    self.coords_of(n[1]),
                    self.coords_of(n[2]),
                    self.coords_of(n[3]),
                ],
                [
                    self.metric_of(n[0]),
                    self.metric_of(n[1]),
                    self.metric_of(n[2]),
                    self.metric_of(n[3]),
                ],
            ),
        }
    }

    /// Signed area/volume of element `e`.
    pub fn element_volume(&self, e: usize) -> f64 {
        let n = self.element(e);
        if n[0] == INVALID {
            return 0.0;
        }
        match self.dim {
            2 => geometry::area(self.coords_of(n[0]), self.coords_of(n[1]), self.coords_of(n[2])),
            _ => geometry::volume(
                self.coords_of(n[0]),
                self.coords_of(n[1]),
                self.coords_of(n[2]),
                self.coords_of(n[3]),
            ),
        }
    }

    /// Rebuild both adjacency structures from the element-node table.
    pub fn create_adjacency(&mut self) {
        let nverts = self.num_vertices();
        let nelems = self.num_elements();
        self.nnlist = vec![Vec::new(); nverts];
        self.nelist = vec![Vec::new(); nverts];

        let mut verts = [INVALID; 4];
        for e in 0..nelems {
            let start = e * self.nloc;
            if self.enlist[start] == INVALID {
                continue;
            }
            verts[..self.nloc].copy_from_slice(&self.enlist[start..start + self.nloc]);
            for i in 0..self.nloc {
                let vi = verts[i];
                self.nelist[vi].push(e);
                for j in (i + 1)..self.nloc {
                    let vj = verts[j];
                    if !self.nnlist[vi].contains(&vj) {
                        self.nnlist[vi].push(vj);
                        self.nnlist[vj].push(vi);
                    }
                }
            }
        }
    }

    /// Grow the element arena by `extra` erased slots so that parallel
    /// passes can scatter into reserved ranges.
    pub(crate) fn grow_elements(&mut self, extra: usize) {
        self.enlist.resize(self.enlist.len() + extra * self.nloc, INVALID);
        self.boundary.resize(self.boundary.len() + extra * self.nloc, 0);
    }

    /// Shrink the element arena to `count` rows after a scatter pass.
    pub(crate) fn truncate_elements(&mut self, count: usize) {
        self.enlist.truncate(count * self.nloc);
        self.boundary.truncate(count * self.nloc);
    }

    /// Compact both arenas, dropping erased entries and renumbering every
    /// index. Returns the old-to-new maps for vertices and elements so
    /// external structures (surface model, caller-held ids) can follow.
    pub fn defragment(&mut self) -> (Vec<Option<usize>>, Vec<Option<usize>>) {
        let nverts = self.num_vertices();
        let nelems = self.num_elements();

        // A vertex survives iff some alive element references it.
        let mut alive = vec![false; nverts];
        for e in 0..nelems {
            let start = e * self.nloc;
            if self.enlist[start] == INVALID {
                continue;
            }
            for &v in &self.enlist[start..start + self.nloc] {
                alive[v] = true;
            }
        }

        let mut vmap = vec![None; nverts];
        let mut nv = 0;
        for v in 0..nverts {
            if alive[v] {
                vmap[v] = Some(nv);
                nv += 1;
            }
        }
        let mut emap = vec![None; nelems];
        let mut ne = 0;
        for e in 0..nelems {
            if self.enlist[e * self.nloc] != INVALID {
                emap[e] = Some(ne);
                ne += 1;
            }
        }

        let mut coords = Vec::with_capacity(nv * self.dim);
        let mut metric = Vec::with_capacity(nv * self.msize);
        let mut gid = Vec::with_capacity(nv);
        let mut owner = Vec::with_capacity(nv);
        let mut nnlist = Vec::with_capacity(nv);
        let mut nelist = Vec::with_capacity(nv);
        for v in 0..nverts {
            if vmap[v].is_none() {
                continue;
            }
            coords.extend_from_slice(&self.coords[v * self.dim..(v + 1) * self.dim]);
            metric.extend_from_slice(&self.metric[v * self.msize..(v + 1) * self.msize]);
            gid.push(self.gid[v]);
            owner.push(self.owner[v]);
            nnlist.push(
                self.nnlist[v]
                    .iter()
                    .filter_map(|&w| vmap[w])
                    .collect::<Vec<_>>(),
            );
            nelist.push(
                self.nelist[v]
                    .iter()
                    .filter_map(|&e| emap[e])
                    .collect::<Vec<_>>(),
            );
        }

        let mut enlist = Vec::with_capacity(ne * self.nloc);
        let mut boundary = Vec::with_capacity(ne * self.nloc);
        for e in 0..nelems {
            if emap[e].is_none() {
                continue;
            }
            let start = e * self.nloc;
            for i in 0..self.nloc {
                enlist.push(vmap[self.enlist[start + i]].expect("alive element references dead vertex"));
            }
            boundary.extend_from_slice(&self.boundary[start..start + self.nloc]);
        }

        let recv_halo: HashSet<usize> = self.recv_halo.iter().filter_map(|&v| vmap[v]).collect();
        self.recv_halo = recv_halo;

        self.coords = coords;
        self.metric = metric;
        self.gid = gid;
        self.owner = owner;
        self.nnlist = nnlist;
        self.nelist = nelist;
        self.enlist = enlist;
        self.boundary = boundary;

        (vmap, emap)
    }

    /// Check the structural invariants that must hold between operators.
    ///
    /// Fails with the first inconsistency found, carrying the offending
    /// indices.
    pub fn validate_invariants(&self) -> Result<(), AdaptError> {
        let nverts = self.num_vertices();
        let nelems = self.num_elements();

        for v in 0..nverts {
            for (i, &w) in self.nnlist[v].iter().enumerate() {
                if self.nnlist[v][i + 1..].contains(&w) {
                    return Err(AdaptError::DuplicateNeighbour {
                        vertex: v,
                        neighbour: w,
                    });
                }
            }
        }

        for e in 0..nelems {
            let n = self.element(e);
            if n[0] == INVALID {
                continue;
            }
            for (i, &vi) in n.iter().enumerate() {
                if vi >= nverts {
                    return Err(AdaptError::VertexOutOfBounds {
                        element: e,
                        vertex: vi,
                        nverts,
                    });
                }
                if n[i + 1..].contains(&vi) {
                    return Err(AdaptError::DuplicateVertexInElement {
                        element: e,
                        vertex: vi,
                    });
                }
                if !self.nelist[vi].contains(&e) {
                    return Err(AdaptError::ElementNotInNeList {
                        element: e,
                        vertex: vi,
                    });
                }
                for &vj in &n[i + 1..] {
                    if !self.nnlist[vi].contains(&vj) || !self.nnlist[vj].contains(&vi) {
                        return Err(AdaptError::MissingEdgeLink(vi, vj));
                    }
                }
            }
            let vol = self.element_volume(e);
            if vol <= 0.0 {
                return Err(AdaptError::InvertedElement {
                    element: e,
                    volume: vol,
                });
            }
        }

        if self.dim == 2 {
            for v in 0..nverts {
                for &w in &self.nnlist[v] {
                    if v < w {
                        let shared = self
                            .nelist[v]
                            .iter()
                            .filter(|&&e| self.nelist[w].contains(&e))
                            .count();
                        if shared == 0 || shared > 2 {
                            return Err(AdaptError::MalformedEdgeStar(v, w, shared));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Assert invariants in debug builds or when invariant checking is
    /// compiled in.
    pub fn debug_assert_invariants(&self) {
        #[cfg(any(debug_assertions, feature = "check-invariants"))]
        if let Err(e) = self.validate_invariants() {
            panic!("[invariants] mesh adjacency broken: {e}");
        }
    }

    /// Elements incident to the edge `(a, b)`.
    pub fn edge_elements(&self, a: usize, b: usize) -> Vec<usize> {
        self.nelist[a]
            .iter()
            .copied()
            .filter(|e| self.nelist[b].contains(e))
            .collect()
    }

    /// Aggregate length/quality statistics, computed in parallel.
    pub fn stats(&self) -> MeshStats {
        let nverts = self.num_vertices();
        let nelems = self.num_elements();

        let (edges, len_sq) = (0..nverts)
            .into_par_iter()
            .fold(
                || (0usize, 0.0f64),
                |(mut cnt, mut acc), v| {
                    for &w in &self.nnlist[v] {
                        if v < w {
                            let l = self.edge_length(v, w);
                            acc += (l - 1.0) * (l - 1.0);
                            cnt += 1;
                        }
                    }
                    (cnt, acc)
                },
            )
            .reduce(|| (0, 0.0), |a, b| (a.0 + b.0, a.1 + b.1));

        let (elements, q_sum, q_sq, q_min) = (0..nelems)
            .into_par_iter()
            .fold(
                || (0usize, 0.0f64, 0.0f64, f64::INFINITY),
                |(mut cnt, mut sum, mut sq, mut min), e| {
                    if self.element_is_alive(e) {
                        let q = self.quality(e);
                        cnt += 1;
                        sum += q;
                        sq += (q - 1.0) * (q - 1.0);
                        min = min.min(q);
                    }
                    (cnt, sum, sq, min)
                },
            )
            .reduce(
                || (0, 0.0, 0.0, f64::INFINITY),
                |a, b| (a.0 + b.0, a.1 + b.1, a.2 + b.2, a.3.min(b.3)),
            );

        let vertices = (0..nverts)
            .into_par_iter()
            .filter(|&v| self.vertex_is_alive(v))
            .count();

        MeshStats {
            vertices,
            elements,
            edges,
            length_rms: if edges > 0 {
                (len_sq / edges as f64).sqrt()
            } else {
                0.0
            },
            quality_min: if elements > 0 { q_min } else { 0.0 },
            quality_mean: if elements > 0 {
                q_sum / elements as f64
            } else {
                0.0
            },
            quality_rms: if elements > 0 {
                (q_sq / elements as f64).sqrt()
            } else {
                0.0
            },
        }
    }
}
