//! Shared fixtures for the integration suites.

use mesh_adapt::prelude::*;

/// Regular `n x n` vertex grid on the unit square, each cell split into two
/// triangles, with a uniform isotropic metric `m * I`.
pub fn unit_square_grid(n: usize, m: f64) -> MeshStore {
    let h = 1.0 / (n - 1) as f64;
    let mut coords = Vec::with_capacity(2 * n * n);
    for j in 0..n {
        for i in 0..n {
            coords.push(i as f64 * h);
            coords.push(j as f64 * h);
        }
    }
    let mut elements = Vec::new();
    for j in 0..n - 1 {
        for i in 0..n - 1 {
            let v = j * n + i;
            elements.extend_from_slice(&[v, v + 1, v + n]);
            elements.extend_from_slice(&[v + 1, v + n + 1, v + n]);
        }
    }
    let metric = (0..n * n).flat_map(|_| [m, 0.0, m]).collect();
    import(&MeshData {
        dim: 2,
        coords,
        elements,
        metric: Some(metric),
        boundary: None,
    })
    .unwrap()
}

/// Longest metric edge length over the alive mesh.
pub fn max_edge_length(mesh: &MeshStore) -> f64 {
    let mut max = 0.0f64;
    for v in 0..mesh.num_vertices() {
        for &w in mesh.neighbours(v) {
            if v < w {
                max = max.max(mesh.edge_length(v, w));
            }
        }
    }
    max
}

#[test]
fn grid_fixture_is_valid() {
    let mesh = unit_square_grid(4, 1.0);
    assert_eq!(mesh.stats().vertices, 16);
    assert_eq!(mesh.stats().elements, 18);
    assert!(mesh.validate_invariants().is_ok());
    // Longest edge of the unit grid is the cell diagonal.
    let h = 1.0 / 3.0;
    assert!((max_edge_length(&mesh) - h * 2.0_f64.sqrt()).abs() < 1e-12);
}
