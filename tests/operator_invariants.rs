//! Adjacency and orientation invariants after every operator, plus the
//! halo-immutability contract under concurrent swapping.

use mesh_adapt::prelude::*;

/// Grid with a smoothly graded metric so every operator has work to do.
fn graded_grid(n: usize) -> MeshStore {
    let h = 1.0 / (n - 1) as f64;
    let mut coords = Vec::new();
    let mut metric = Vec::new();
    for j in 0..n {
        for i in 0..n {
            let x = i as f64 * h;
            let y = j as f64 * h;
            coords.push(x);
            coords.push(y);
            // Spacing shrinks towards x = 1.
            let m = 4.0 + 60.0 * x * x;
            metric.extend_from_slice(&[m, 0.0, 4.0 + 10.0 * y]);
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
    import(&MeshData {
        dim: 2,
        coords,
        elements,
        metric: Some(metric),
        boundary: None,
    })
    .unwrap()
}

#[test]
fn invariants_hold_after_each_operator() {
    let mut mesh = graded_grid(8);
    let params = AdaptParams::default();

    let mut surface = SurfaceModel::from_mesh(&mesh);
    Coarsen2D::new(params.l_low, params.l_max).coarsen(&mut mesh, &mut surface);
    mesh.validate_invariants().expect("after coarsen");

    Swap2D::new(params.q_min, params.swap_pass_cap).swap(&mut mesh);
    mesh.validate_invariants().expect("after swap");

    Refine2D::new(params.l_max, 32).refine(&mut mesh);
    mesh.validate_invariants().expect("after refine");

    Swap2D::new(params.q_min, params.swap_pass_cap).swap(&mut mesh);
    mesh.validate_invariants().expect("after second swap");

    let surface = SurfaceModel::from_mesh(&mesh);
    Smooth::new(params.smooth_iters, params.smooth_tol).smooth(&mut mesh, &surface);
    mesh.validate_invariants().expect("after smooth");

    let (_, _) = mesh.defragment();
    mesh.validate_invariants().expect("after defragment");
}

#[test]
fn orientation_is_preserved_throughout() {
    let mut mesh = graded_grid(8);
    adapt(&mut mesh, &AdaptParams::default()).unwrap();
    for e in 0..mesh.num_elements() {
        if mesh.element_is_alive(e) {
            assert!(
                mesh.element_volume(e) > 0.0,
                "element {e} lost positive orientation"
            );
        }
    }
}

#[test]
fn random_jittered_meshes_adapt_cleanly() {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _trial in 0..3 {
        let n = 6usize;
        let h = 1.0 / (n - 1) as f64;
        let mut coords = Vec::new();
        let mut metric = Vec::new();
        for j in 0..n {
            for i in 0..n {
                let interior = i > 0 && i < n - 1 && j > 0 && j < n - 1;
                let (dx, dy) = if interior {
                    (
                        0.2 * h * rng.gen_range(-1.0..1.0),
                        0.2 * h * rng.gen_range(-1.0..1.0),
                    )
                } else {
                    (0.0, 0.0)
                };
                coords.push(i as f64 * h + dx);
                coords.push(j as f64 * h + dy);
                let m = rng.gen_range(4.0..80.0);
                metric.extend_from_slice(&[m, 0.0, m]);
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
        let mut mesh = import(&MeshData {
            dim: 2,
            coords,
            elements,
            metric: Some(metric),
            boundary: None,
        })
        .unwrap();

        adapt(&mut mesh, &AdaptParams::default()).unwrap();
        mesh.validate_invariants().expect("adapted jittered mesh");
    }
}

#[test]
fn concurrent_swap_never_touches_halo_elements() {
    // Jittered grid so plenty of profitable flips exist.
    let n = 7usize;
    let h = 1.0 / (n - 1) as f64;
    let mut coords = Vec::new();
    for j in 0..n {
        for i in 0..n {
            let interior = i > 0 && i < n - 1 && j > 0 && j < n - 1;
            let (dx, dy) = if interior {
                let s = (13.0 * i as f64 + 7.0 * j as f64).sin();
                let c = (5.0 * i as f64 - 11.0 * j as f64).cos();
                (0.2 * h * s, 0.2 * h * c)
            } else {
                (0.0, 0.0)
            };
            coords.push(i as f64 * h + dx);
            coords.push(j as f64 * h + dy);
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
    let metric = (0..n * n).flat_map(|_| [36.0, 0.0, 36.0]).collect();
    let mut mesh = import(&MeshData {
        dim: 2,
        coords,
        elements,
        metric: Some(metric),
        boundary: None,
    })
    .unwrap();

    // An interior vertex owned by a neighbouring process.
    let halo = 3 * 7 + 3;
    mesh.mark_halo(halo, 1);

    let frozen: Vec<(usize, Vec<usize>)> = mesh
        .elements_of(halo)
        .iter()
        .map(|&e| (e, mesh.element(e).to_vec()))
        .collect();

    Swap2D::new(0.95, 10).swap(&mut mesh);
    mesh.validate_invariants().expect("after halo swap");

    for (e, verts) in frozen {
        assert_eq!(
            mesh.element(e),
            &verts[..],
            "element {e} incident to the halo vertex changed"
        );
        assert!(mesh.elements_of(halo).contains(&e));
    }
}
