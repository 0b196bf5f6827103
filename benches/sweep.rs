use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use mesh_adapt::prelude::*;

fn grid(n: usize, m: f64) -> MeshData {
    let h = 1.0 / (n - 1) as f64;
    let mut coords = Vec::new();
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
    MeshData {
        dim: 2,
        coords,
        elements,
        metric: Some(metric),
        boundary: None,
    }
}

fn bench_refine_sweep(c: &mut Criterion) {
    let data = grid(30, 4000.0);
    c.bench_function("refine_sweep_30x30", |b| {
        b.iter_batched(
            || import(&data).unwrap(),
            |mut mesh| Refine2D::new(2.0_f64.sqrt(), 32).refine(&mut mesh),
            BatchSize::LargeInput,
        )
    });
}

fn bench_full_adapt(c: &mut Criterion) {
    let data = grid(20, 100.0);
    let params = AdaptParams {
        max_sweeps: 3,
        ..AdaptParams::default()
    };
    c.bench_function("adapt_20x20", |b| {
        b.iter_batched(
            || import(&data).unwrap(),
            |mut mesh| adapt(&mut mesh, &params).unwrap(),
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, bench_refine_sweep, bench_full_adapt);
criterion_main!(benches);
