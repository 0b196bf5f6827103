//! Whole-pipeline runs: coarsen, swap, refine and smooth driven to a
//! fixpoint, then re-run to check the fixpoint is stable.

#[path = "util.rs"]
mod util;

use mesh_adapt::prelude::*;
use util::{max_edge_length, unit_square_grid};

#[test]
fn coarse_mesh_refines_to_unit_lengths() {
    // Two triangles, metric asking for h = 0.2.
    let data = MeshData {
        dim: 2,
        coords: vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0],
        elements: vec![0, 1, 2, 1, 3, 2],
        metric: Some(vec![[25.0, 0.0, 25.0]; 4].concat()),
        boundary: None,
    };
    let mut mesh = import(&data).unwrap();

    let report = adapt(&mut mesh, &AdaptParams::default()).unwrap();
    assert!(report.refined > 0);
    assert!(mesh.validate_invariants().is_ok());

    let stats = report.stats;
    assert!(stats.vertices > 4);
    // Smoothing after the last refinement pass may stretch an edge a touch.
    assert!(max_edge_length(&mesh) <= 2.0_f64.sqrt() * 1.1);
    assert!(stats.quality_min > 0.0);
}

#[test]
fn over_resolved_mesh_coarsens() {
    // Dense grid whose metric asks for much coarser spacing.
    let mut mesh = unit_square_grid(9, 1.0);
    let before = mesh.stats().vertices;

    let report = adapt(&mut mesh, &AdaptParams::default()).unwrap();
    assert!(report.coarsened > 0);
    assert!(report.stats.vertices < before);
    assert!(mesh.validate_invariants().is_ok());
}

#[test]
fn converged_mesh_is_a_topological_fixpoint() {
    let mut mesh = unit_square_grid(5, 64.0);
    let params = AdaptParams {
        smooth_iters: 0,
        ..AdaptParams::default()
    };

    adapt(&mut mesh, &params).unwrap();
    let again = adapt(&mut mesh, &params).unwrap();

    assert_eq!(again.refined, 0, "second run split edges");
    assert_eq!(again.coarsened, 0, "second run collapsed edges");
    assert_eq!(again.swapped, 0, "second run flipped edges");
    assert_eq!(again.sweeps, 1);
}

#[test]
fn export_after_adapt_is_dense_and_reimportable() {
    let mut mesh = unit_square_grid(6, 1.0);
    adapt(&mut mesh, &AdaptParams::default()).unwrap();

    let out = export(&mut mesh);
    assert_eq!(out.coords.len(), 2 * mesh.stats().vertices);
    assert_eq!(out.elements.len(), 3 * mesh.stats().elements);

    let reimported = import(&out).unwrap();
    assert!(reimported.validate_invariants().is_ok());
    assert_eq!(reimported.stats().vertices, mesh.stats().vertices);
}
