//! Boundary surface model.
//!
//! The surface is the set of boundary facets (edges in 2D, triangles in 3D)
//! carrying a boundary marker and a coplanar-patch id. Coarsening and
//! smoothing consult it before accepting an edit: collapses must slide along
//! a single coplanar patch, corners pin the geometry and are never removed
//! or moved, and facet bookkeeping is mirrored whenever a boundary edge
//! collapses.
//!
//! Coplanar patch ids are derived by flood-filling facet connectivity,
//! joining facets whose unit normals agree to within [`COPLANAR_TOL`].

use crate::mesh::{MeshStore, INVALID};

/// Two facets belong to the same coplanar patch when their unit normals
/// satisfy `dot(n0, n1) > COPLANAR_TOL`.
pub const COPLANAR_TOL: f64 = 0.999_999_9;

/// A single boundary facet.
#[derive(Clone, Debug)]
pub struct Facet {
    /// Facet vertices; entry `dim..` is unused in 2D.
    verts: [usize; 3],
    /// User-facing boundary marker (from the element boundary-tag row).
    boundary_id: i32,
    /// Derived coplanar patch id, 1-based.
    coplanar_id: i32,
    /// Outward unit normal.
    normal: [f64; 3],
    /// Facet on an inter-process seam.
    shared: bool,
    alive: bool,
}

/// The boundary facet set plus per-vertex incidence.
pub struct SurfaceModel {
    dim: usize,
    snloc: usize,
    facets: Vec<Facet>,
    vertex_facets: Vec<Vec<usize>>,
}

impl SurfaceModel {
    /// Extract the surface from the mesh boundary tags.
    ///
    /// Every facet of an alive element whose tag is positive becomes a
    /// surface facet; coplanar ids are then derived from facet normals.
    pub fn from_mesh(mesh: &MeshStore) -> Self {
        let dim = mesh.dim();
        let nloc = mesh.nloc();
        let mut surface = Self {
            dim,
            snloc: dim,
            facets: Vec::new(),
            vertex_facets: vec![Vec::new(); mesh.num_vertices()],
        };

        for e in 0..mesh.num_elements() {
            if !mesh.element_is_alive(e) {
                continue;
            }
            let n = mesh.element(e);
            let tags = mesh.boundary_of(e);
            for i in 0..nloc {
                if tags[i] <= 0 {
                    continue;
                }
                // Facet i is opposite local vertex i.
                let mut fv = [INVALID; 3];
                let mut k = 0;
                for (j, &v) in n.iter().enumerate() {
                    if j != i {
                        fv[k] = v;
                        k += 1;
                    }
                }
                surface.push_facet(mesh, fv, tags[i], 0, n[i], false);
            }
        }

        surface.assign_coplanar_ids();
        surface
    }

    fn push_facet(
        &mut self,
        mesh: &MeshStore,
        verts: [usize; 3],
        boundary_id: i32,
        coplanar_id: i32,
        opposite: usize,
        shared: bool,
    ) -> usize {
        let normal = self.outward_normal(mesh, &verts, opposite);
        let f = self.facets.len();
        self.facets.push(Facet {
            verts,
            boundary_id,
            coplanar_id,
            normal,
            shared,
            alive: true,
        });
        for &v in &verts[..self.snloc] {
            self.vertex_facets[v].push(f);
        }
        f
    }

    /// Unit normal of the facet, oriented away from the opposite vertex.
    fn outward_normal(&self, mesh: &MeshStore, verts: &[usize; 3], opposite: usize) -> [f64; 3] {
        let mut n = [0.0f64; 3];
        if self.dim == 2 {
            let a = mesh.coords_of(verts[0]);
            let b = mesh.coords_of(verts[1]);
            n[0] = b[1] - a[1];
            n[1] = -(b[0] - a[0]);
            let xo = mesh.coords_of(opposite);
            if n[0] * (a[0] - xo[0]) + n[1] * (a[1] - xo[1]) < 0.0 {
                n[0] = -n[0];
                n[1] = -n[1];
            }
        } else {
            let a = mesh.coords_of(verts[0]);
            let b = mesh.coords_of(verts[1]);
            let c = mesh.coords_of(verts[2]);
            let u = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
            let v = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
            n = [
                u[1] * v[2] - u[2] * v[1],
                u[2] * v[0] - u[0] * v[2],
                u[0] * v[1] - u[1] * v[0],
            ];
            let xo = mesh.coords_of(opposite);
            let dot = n[0] * (a[0] - xo[0]) + n[1] * (a[1] - xo[1]) + n[2] * (a[2] - xo[2]);
            if dot < 0.0 {
                for c in n.iter_mut() {
                    *c = -*c;
                }
            }
        }
        let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
        if len > 0.0 {
            for c in n.iter_mut() {
                *c /= len;
            }
        }
        n
    }

    /// Flood-fill coplanar patch ids over facets connected through shared
    /// vertices with near-identical normals.
    fn assign_coplanar_ids(&mut self) {
        let nfacets = self.facets.len();
        let mut next_id = 1;
        let mut stack = Vec::new();
        for seed in 0..nfacets {
            if !self.facets[seed].alive || self.facets[seed].coplanar_id != 0 {
                continue;
            }
            self.facets[seed].coplanar_id = next_id;
            stack.push(seed);
            while let Some(f) = stack.pop() {
                let normal = self.facets[f].normal;
                let verts = self.facets[f].verts;
                for &v in &verts[..self.snloc] {
                    for &g in &self.vertex_facets[v] {
                        if !self.facets[g].alive || self.facets[g].coplanar_id != 0 {
                            continue;
                        }
                        let m = self.facets[g].normal;
                        let dot = normal[0] * m[0] + normal[1] * m[1] + normal[2] * m[2];
                        if dot > COPLANAR_TOL {
                            self.facets[g].coplanar_id = next_id;
                            stack.push(g);
                        }
                    }
                }
            }
            next_id += 1;
        }
    }

    /// Number of coplanar patches.
    pub fn num_patches(&self) -> usize {
        self.facets
            .iter()
            .filter(|f| f.alive)
            .map(|f| f.coplanar_id as usize)
            .max()
            .unwrap_or(0)
    }

    /// True if `v` lies on the boundary.
    pub fn contains(&self, v: usize) -> bool {
        !self.vertex_facets[v].is_empty()
    }

    /// Facet ids incident to `v`.
    pub fn facets_of(&self, v: usize) -> &[usize] {
        &self.vertex_facets[v]
    }

    /// Facet vertices.
    pub fn facet_verts(&self, f: usize) -> &[usize] {
        &self.facets[f].verts[..self.snloc]
    }

    /// Outward unit normal of facet `f`.
    pub fn facet_normal(&self, f: usize) -> &[f64; 3] {
        &self.facets[f].normal
    }

    pub fn boundary_id(&self, f: usize) -> i32 {
        self.facets[f].boundary_id
    }

    pub fn coplanar_id(&self, f: usize) -> i32 {
        self.facets[f].coplanar_id
    }

    /// True for facets received across an inter-process seam.
    pub fn is_shared(&self, f: usize) -> bool {
        self.facets[f].shared
    }

    /// A corner vertex joins two or more coplanar patches (three or more in
    /// 3D pin a point; two pin a ridge). Corners are immovable and
    /// uncollapsible.
    pub fn is_corner(&self, v: usize) -> bool {
        let mut first = 0;
        for &f in &self.vertex_facets[v] {
            if !self.facets[f].alive {
                continue;
            }
            let id = self.facets[f].coplanar_id;
            if first == 0 {
                first = id;
            } else if id != first {
                return true;
            }
        }
        false
    }

    /// Decide whether collapsing `rm` onto `target` preserves the boundary.
    ///
    /// Interior vertices are always collapsible. A boundary vertex may only
    /// slide along its own coplanar patch, onto a boundary vertex it shares
    /// a facet with.
    pub fn is_collapsible(&self, rm: usize, target: usize) -> bool {
        if !self.contains(rm) {
            return true;
        }
        if !self.contains(target) {
            return false;
        }

        let mut patch = 0;
        let mut shares_facet = false;
        for &f in &self.vertex_facets[rm] {
            if !self.facets[f].alive {
                continue;
            }
            let id = self.facets[f].coplanar_id;
            if patch == 0 {
                patch = id;
            } else if id != patch {
                return false;
            }
            if self.facets[f].verts[..self.snloc].contains(&target) {
                shares_facet = true;
            }
        }
        shares_facet
    }

    /// Mirror an edge collapse `rm -> target` on the boundary structures:
    /// the facet joining the two vertices disappears and the remaining
    /// facets of `rm` are rewritten to reference `target`.
    pub fn collapse(&mut self, rm: usize, target: usize) {
        let rm_facets = std::mem::take(&mut self.vertex_facets[rm]);
        for f in rm_facets {
            if !self.facets[f].alive {
                continue;
            }
            if self.facets[f].verts[..self.snloc].contains(&target) {
                // Shared facet vanishes with the edge.
                self.facets[f].alive = false;
                let verts = self.facets[f].verts;
                for &v in &verts[..self.snloc] {
                    if v != rm {
                        self.vertex_facets[v].retain(|&g| g != f);
                    }
                }
            } else {
                for slot in self.facets[f].verts[..self.snloc].iter_mut() {
                    if *slot == rm {
                        *slot = target;
                    }
                }
                self.vertex_facets[target].push(f);
            }
        }
    }

    /// Facets whose vertices are all contained in `verts` (e.g. the facets
    /// carried by one element).
    pub fn find_facets(&self, verts: &[usize]) -> Vec<usize> {
        let mut out = Vec::new();
        let mut seen = Vec::new();
        for &v in verts {
            for &f in &self.vertex_facets[v] {
                if !self.facets[f].alive || seen.contains(&f) {
                    continue;
                }
                seen.push(f);
                if self.facets[f].verts[..self.snloc]
                    .iter()
                    .all(|w| verts.contains(w))
                {
                    out.push(f);
                }
            }
        }
        out
    }

    /// Append a facet supplied by a collaborating layer (e.g. received with
    /// migrated elements). `shared` marks facets on an inter-process seam.
    pub fn append_facet(
        &mut self,
        mesh: &MeshStore,
        verts: &[usize],
        boundary_id: i32,
        coplanar_id: i32,
        shared: bool,
    ) -> usize {
        let mut fv = [INVALID; 3];
        fv[..self.snloc].copy_from_slice(verts);
        // Orientation hint: fall back on the first facet vertex when no
        // opposite element vertex is known.
        let f = self.push_facet(mesh, fv, boundary_id, coplanar_id, verts[0], shared);
        if coplanar_id == 0 {
            self.assign_coplanar_ids();
        }
        f
    }

    /// Follow a mesh defragmentation: drop facets of removed vertices and
    /// renumber the rest.
    pub fn renumber(&mut self, vmap: &[Option<usize>], new_nverts: usize) {
        for facet in self.facets.iter_mut() {
            if !facet.alive {
                continue;
            }
            for slot in facet.verts[..self.snloc].iter_mut() {
                match vmap[*slot] {
                    Some(nv) => *slot = nv,
                    None => {
                        facet.alive = false;
                        break;
                    }
                }
            }
        }
        let mut vertex_facets = vec![Vec::new(); new_nverts];
        for (f, facet) in self.facets.iter().enumerate() {
            if facet.alive {
                for &v in &facet.verts[..self.snloc] {
                    vertex_facets[v].push(f);
                }
            }
        }
        self.vertex_facets = vertex_facets;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{import, MeshData};

    fn square_mesh() -> MeshStore {
        // Unit square, two triangles, boundary tags derived on import.
        let data = MeshData {
            dim: 2,
            coords: vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0],
            elements: vec![0, 1, 2, 1, 3, 2],
            metric: None,
            boundary: None,
        };
        import(&data).unwrap()
    }

    #[test]
    fn square_has_four_patches_and_four_corners() {
        let mesh = square_mesh();
        let surface = SurfaceModel::from_mesh(&mesh);
        assert_eq!(surface.num_patches(), 4);
        for v in 0..4 {
            assert!(surface.contains(v));
            assert!(surface.is_corner(v), "vertex {v} should be a corner");
        }
    }

    #[test]
    fn edge_midpoint_is_not_a_corner() {
        // Three collinear boundary vertices along the bottom edge.
        let data = MeshData {
            dim: 2,
            coords: vec![0.0, 0.0, 0.5, 0.0, 1.0, 0.0, 0.5, 1.0],
            elements: vec![0, 1, 3, 1, 2, 3],
            metric: None,
            boundary: None,
        };
        let mesh = import(&data).unwrap();
        let surface = SurfaceModel::from_mesh(&mesh);
        assert!(surface.contains(1));
        assert!(!surface.is_corner(1));
        // Vertex 1 may slide along the bottom edge but not onto the apex.
        assert!(surface.is_collapsible(1, 0));
        assert!(surface.is_collapsible(1, 2));
        assert!(!surface.is_collapsible(1, 3));
    }

    #[test]
    fn collapse_rewires_facets() {
        let data = MeshData {
            dim: 2,
            coords: vec![0.0, 0.0, 0.5, 0.0, 1.0, 0.0, 0.5, 1.0],
            elements: vec![0, 1, 3, 1, 2, 3],
            metric: None,
            boundary: None,
        };
        let mesh = import(&data).unwrap();
        let mut surface = SurfaceModel::from_mesh(&mesh);
        surface.collapse(1, 0);
        assert!(!surface.contains(1));
        // The surviving bottom facet now joins 0 and 2.
        let bottom: Vec<usize> = surface
            .facets_of(0)
            .iter()
            .copied()
            .filter(|&f| surface.facet_verts(f).contains(&2))
            .collect();
        assert_eq!(bottom.len(), 1);
    }

    #[test]
    fn interior_vertex_is_always_collapsible() {
        // A 3x3 grid's centre vertex is interior.
        let data = MeshData {
            dim: 2,
            coords: vec![
                0.0, 0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 0.0, 2.0, 1.0, 2.0,
                2.0, 2.0,
            ],
            elements: vec![
                0, 1, 4, 0, 4, 3, 1, 2, 5, 1, 5, 4, 3, 4, 7, 3, 7, 6, 4, 5, 8, 4, 8, 7,
            ],
            metric: None,
            boundary: None,
        };
        let mesh = import(&data).unwrap();
        let surface = SurfaceModel::from_mesh(&mesh);
        assert!(!surface.contains(4));
        assert!(surface.is_collapsible(4, 0));
    }
}
