//! Metric-weighted vertex smoothing.
//!
//! The smart-Laplacian kernel proposes, for each free vertex, the position
//! that the metric-weighted average of its neighbours prefers: solve
//! `(sum M̄_vj) p = sum M̄_vj x_j` over the vertex star, with `M̄_vj` the
//! edge-averaged metric. A proposal is accepted only when the worst Lipnikov
//! quality over the star does not decrease, so smoothing can only help.
//!
//! Corner and halo vertices never move. In 2D a boundary vertex slides along
//! its coplanar facet line; in 3D boundary vertices stay put. Vertices are
//! scheduled colour by colour so that within a sub-pass no vertex sees a
//! neighbour move: proposals of one colour are computed in parallel against
//! a frozen neighbourhood, then applied. The loop stops when the largest
//! metric-space displacement falls below the tolerance or the iteration cap
//! is hit.

use crate::colour;
use crate::geometry;
use crate::mesh::MeshStore;
use crate::surface::SurfaceModel;
use rayon::prelude::*;

/// Smart-Laplacian smoothing pass.
pub struct Smooth {
    max_iters: usize,
    tol: f64,
}

impl Smooth {
    pub fn new(max_iters: usize, tol: f64) -> Self {
        Self { max_iters, tol }
    }

    /// Smooth until the displacement residual drops under the tolerance.
    /// Returns the number of iterations performed.
    pub fn smooth(&self, mesh: &mut MeshStore, surface: &SurfaceModel) -> usize {
        let nverts = mesh.num_vertices();
        let dim = mesh.dim();
        let colours = colour::greedy(&mesh.nnlist);
        let ncolours = colour::palette_size(&colours);

        for iter in 0..self.max_iters {
            let mut residual = 0.0f64;

            for c in 0..ncolours as u32 {
                // Propose against the frozen neighbourhood of this colour.
                let proposals: Vec<(usize, [f64; 3])> = (0..nverts)
                    .into_par_iter()
                    .filter_map(|v| {
                        if colours[v] != c {
                            return None;
                        }
                        propose(mesh, surface, v).map(|x| (v, x))
                    })
                    .collect();

                for (v, x) in proposals {
                    let old = mesh.coords_of(v);
                    let mut disp = [0.0f64; 3];
                    for d in 0..dim {
                        disp[d] = x[d] - old[d];
                    }
                    let dm = match dim {
                        2 => geometry::metric_inner_2d(mesh.metric_of(v), [disp[0], disp[1]]),
                        _ => geometry::metric_inner_3d(mesh.metric_of(v), disp),
                    }
                    .max(0.0)
                    .sqrt();
                    residual = residual.max(dm);

                    mesh.coords[v * dim..(v + 1) * dim].copy_from_slice(&x[..dim]);
                }
            }

            if residual < self.tol {
                return iter + 1;
            }
        }
        self.max_iters
    }
}

/// Compute the accepted new position of `v`, if any.
fn propose(mesh: &MeshStore, surface: &SurfaceModel, v: usize) -> Option<[f64; 3]> {
    let dim = mesh.dim();
    if !mesh.vertex_is_alive(v) || mesh.is_halo(v) || !mesh.is_owned(v) {
        return None;
    }
    if surface.is_corner(v) {
        return None;
    }
    let on_boundary = surface.contains(v);
    if on_boundary && dim == 3 {
        return None;
    }

    // Metric-weighted average of the neighbours.
    let msize = mesh.msize();
    let mut a = [0.0f64; 6];
    let mut b = [0.0f64; 3];
    let mv = mesh.metric_of(v);
    for &w in mesh.neighbours(v) {
        let mw = mesh.metric_of(w);
        let xw = mesh.coords_of(w);
        let mut mbar = [0.0f64; 6];
        for i in 0..msize {
            mbar[i] = 0.5 * (mv[i] + mw[i]);
        }
        for i in 0..msize {
            a[i] += mbar[i];
        }
        if dim == 2 {
            b[0] += mbar[0] * xw[0] + mbar[1] * xw[1];
            b[1] += mbar[1] * xw[0] + mbar[2] * xw[1];
        } else {
            b[0] += mbar[0] * xw[0] + mbar[1] * xw[1] + mbar[2] * xw[2];
            b[1] += mbar[1] * xw[0] + mbar[3] * xw[1] + mbar[4] * xw[2];
            b[2] += mbar[2] * xw[0] + mbar[4] * xw[1] + mbar[5] * xw[2];
        }
    }

    let mut x = solve_spd(dim, &a, &b)?;

    if on_boundary {
        // Slide along the coplanar facet line through v.
        let f = *surface.facets_of(v).first()?;
        let n = surface.facet_normal(f);
        let tangent = [n[1], -n[0]];
        let xv = mesh.coords_of(v);
        let t = (x[0] - xv[0]) * tangent[0] + (x[1] - xv[1]) * tangent[1];
        x = [xv[0] + t * tangent[0], xv[1] + t * tangent[1], 0.0];
    }

    // Quality guard: the worst element of the star must not get worse.
    let mut before = f64::INFINITY;
    let mut after = f64::INFINITY;
    for &e in mesh.elements_of(v) {
        before = before.min(mesh.quality(e));
        after = after.min(quality_with(mesh, e, v, &x));
    }
    if !after.is_finite() || after < before {
        return None;
    }

    Some(x)
}

/// Quality of element `e` with vertex `v` displaced to `x`.
fn quality_with(mesh: &MeshStore, e: usize, v: usize, x: &[f64; 3]) -> f64 {
    let dim = mesh.dim();
    let n = mesh.element(e);
    let mut xs: [&[f64]; 4] = [&[]; 4];
    for (i, &w) in n.iter().enumerate() {
        xs[i] = if w == v { &x[..dim] } else { mesh.coords_of(w) };
    }
    match dim {
        2 => geometry::lipnikov_2d(
            [xs[0], xs[1], xs[2]],
            [mesh.metric_of(n[0]), mesh.metric_of(n[1]), mesh.metric_of(n[2])],
        ),
        _ => geometry::lipnikov_3d(
            [xs[0], xs[1], xs[2], xs[3]],
            [
                mesh.metric_of(n[0]),
                mesh.metric_of(n[1]),
                mesh.metric_of(n[2]),
                mesh.metric_of(n[3]),
            ],
        ),
    }
}

/// Solve the SPD system `A x = b` with `A` in packed form. Returns `None`
/// when the system is numerically degenerate; the caller simply keeps the
/// vertex where it is.
fn solve_spd(dim: usize, a: &[f64; 6], b: &[f64; 3]) -> Option<[f64; 3]> {
    const EPS: f64 = 1e-30;
    if dim == 2 {
        let det = a[0] * a[2] - a[1] * a[1];
        if det.abs() < EPS || !det.is_finite() {
            return None;
        }
        Some([
            (a[2] * b[0] - a[1] * b[1]) / det,
            (a[0] * b[1] - a[1] * b[0]) / det,
            0.0,
        ])
    } else {
        let det = geometry::det_3d(a);
        if det.abs() < EPS || !det.is_finite() {
            return None;
        }
        // Adjugate of the symmetric matrix [[a0,a1,a2],[a1,a3,a4],[a2,a4,a5]].
        let c00 = a[3] * a[5] - a[4] * a[4];
        let c01 = a[2] * a[4] - a[1] * a[5];
        let c02 = a[1] * a[4] - a[2] * a[3];
        let c11 = a[0] * a[5] - a[2] * a[2];
        let c12 = a[1] * a[2] - a[0] * a[4];
        let c22 = a[0] * a[3] - a[1] * a[1];
        Some([
            (c00 * b[0] + c01 * b[1] + c02 * b[2]) / det,
            (c01 * b[0] + c11 * b[1] + c12 * b[2]) / det,
            (c02 * b[0] + c12 * b[1] + c22 * b[2]) / det,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{import, MeshData};

    /// 3x3 grid with the centre vertex pulled off-centre.
    fn perturbed_grid() -> MeshStore {
        let mut coords = vec![
            0.0, 0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 0.0, 2.0, 1.0, 2.0, 2.0,
            2.0,
        ];
        // Vertex 4 is the interior one.
        coords[8] = 1.6;
        coords[9] = 1.35;
        import(&MeshData {
            dim: 2,
            coords,
            elements: vec![
                0, 1, 4, 0, 4, 3, 1, 2, 5, 1, 5, 4, 3, 4, 7, 3, 7, 6, 4, 5, 8, 4, 8, 7,
            ],
            metric: None,
            boundary: None,
        })
        .unwrap()
    }

    #[test]
    fn wheel_centre_relaxes_to_the_centroid() {
        // Hexagonal wheel: every rim vertex is a corner (adjacent facet
        // normals differ), so only the perturbed hub is free to move.
        let mut coords = vec![0.3, 0.2];
        for k in 0..6 {
            let theta = std::f64::consts::PI * k as f64 / 3.0;
            coords.push(theta.cos());
            coords.push(theta.sin());
        }
        let elements = vec![0, 1, 2, 0, 2, 3, 0, 3, 4, 0, 4, 5, 0, 5, 6, 0, 6, 1];
        let mut mesh = import(&MeshData {
            dim: 2,
            coords,
            elements,
            metric: None,
            boundary: None,
        })
        .unwrap();
        let before = mesh.stats().quality_min;

        let smooth = Smooth::new(50, 1e-10);
        let surface = SurfaceModel::from_mesh(&mesh);
        let iters = smooth.smooth(&mut mesh, &surface);
        assert!(iters < 50, "smoother did not converge");

        let x = mesh.coords_of(0);
        assert!(x[0].abs() < 1e-9 && x[1].abs() < 1e-9, "hub at {x:?}");
        assert!(mesh.stats().quality_min >= before);
        assert!(mesh.validate_invariants().is_ok());
    }

    #[test]
    fn grid_smoothing_never_hurts_quality() {
        let mut mesh = perturbed_grid();
        let before = mesh.stats().quality_min;
        let smooth = Smooth::new(50, 1e-8);
        let surface = SurfaceModel::from_mesh(&mesh);
        smooth.smooth(&mut mesh, &surface);
        assert!(mesh.stats().quality_min >= before);
        assert!(mesh.validate_invariants().is_ok());
    }

    #[test]
    fn corners_do_not_move() {
        let mut mesh = perturbed_grid();
        let smooth = Smooth::new(20, 1e-8);
        let surface = SurfaceModel::from_mesh(&mesh);
        smooth.smooth(&mut mesh, &surface);
        assert_eq!(mesh.coords_of(0), &[0.0, 0.0]);
        assert_eq!(mesh.coords_of(2), &[2.0, 0.0]);
        assert_eq!(mesh.coords_of(8), &[2.0, 2.0]);
    }

    #[test]
    fn boundary_vertices_slide_along_their_edge() {
        let mut mesh = perturbed_grid();
        let smooth = Smooth::new(50, 1e-10);
        let surface = SurfaceModel::from_mesh(&mesh);
        smooth.smooth(&mut mesh, &surface);
        // Vertex 1 sits on the bottom edge: y must stay 0.
        let x = mesh.coords_of(1);
        assert!(x[1].abs() < 1e-12);
        assert!(x[0] > 0.0 && x[0] < 2.0);
    }

    #[test]
    fn interior_tet_vertex_relaxes_in_3d() {
        // Regular tet split 1-to-4 through a perturbed interior vertex; the
        // centroid is the symmetric optimum.
        let s = 0.5;
        let q = s / 2.0_f64.sqrt();
        let coords = vec![
            s, 0.0, -q, //
            -s, 0.0, -q, //
            0.0, -s, q, //
            0.0, s, q, //
            0.07, -0.05, 0.04,
        ];
        let elements = vec![4, 1, 2, 3, 0, 4, 2, 3, 0, 1, 4, 3, 0, 1, 2, 4];
        let mut mesh = import(&MeshData {
            dim: 3,
            coords,
            elements,
            metric: None,
            boundary: None,
        })
        .unwrap();
        let before = mesh.stats().quality_min;

        let smooth = Smooth::new(50, 1e-10);
        let surface = SurfaceModel::from_mesh(&mesh);
        let iters = smooth.smooth(&mut mesh, &surface);
        assert!(iters < 50, "3d smoother did not converge");

        let x = mesh.coords_of(4);
        assert!(
            x[0].abs() < 1e-9 && x[1].abs() < 1e-9 && x[2].abs() < 1e-9,
            "interior vertex at {x:?}"
        );
        assert!(mesh.stats().quality_min >= before);
    }

    #[test]
    fn halo_vertices_do_not_move() {
        let mut mesh = perturbed_grid();
        mesh.mark_halo(4, 1);
        let smooth = Smooth::new(20, 1e-8);
        let surface = SurfaceModel::from_mesh(&mesh);
        smooth.smooth(&mut mesh, &surface);
        let x = mesh.coords_of(4);
        assert_eq!(x, &[1.6, 1.35]);
    }
}
