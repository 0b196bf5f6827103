//! The adaptation sweep driver.
//!
//! One sweep runs `Coarsen -> Swap -> Refine -> Swap -> Smooth` (swaps only,
//! plus smoothing, in 3D where refinement and coarsening are carried by the
//! surrounding layers). Sweeps repeat until no operator mutates the topology
//! or the sweep cap is reached, then the arenas are defragmented so the
//! caller sees dense indices.

use crate::coarsen::Coarsen2D;
use crate::error::AdaptError;
use crate::mesh::{MeshStats, MeshStore};
use crate::refine::Refine2D;
use crate::smooth::Smooth;
use crate::surface::SurfaceModel;
use crate::swap2d::Swap2D;
use crate::swap3d::Swap3D;
use tracing::debug;

/// Tuning knobs of an adaptation run.
#[derive(Clone, Copy, Debug)]
pub struct AdaptParams {
    /// Collapse edges shorter than this metric length.
    pub l_low: f64,
    /// Split edges longer than this metric length.
    pub l_max: f64,
    /// Queue elements below this quality for swapping.
    pub q_min: f64,
    /// Outer sweep cap.
    pub max_sweeps: usize,
    /// Inner pass cap of the 2D swap mark-drain loop.
    pub swap_pass_cap: usize,
    /// Smoothing iteration cap per sweep.
    pub smooth_iters: usize,
    /// Smoothing displacement tolerance (metric space).
    pub smooth_tol: f64,
    /// Worker thread count; `None` uses the global rayon pool.
    pub threads: Option<usize>,
    /// Deferred-queue buckets per thread.
    pub bucket_scaling: usize,
}

impl Default for AdaptParams {
    fn default() -> Self {
        Self {
            l_low: std::f64::consts::FRAC_1_SQRT_2,
            l_max: std::f64::consts::SQRT_2,
            q_min: 0.4,
            max_sweeps: 10,
            swap_pass_cap: 10,
            smooth_iters: 100,
            smooth_tol: 1e-5,
            threads: None,
            bucket_scaling: 16,
        }
    }
}

/// What an adaptation run did.
#[derive(Clone, Copy, Debug, Default)]
pub struct AdaptReport {
    /// Sweeps executed.
    pub sweeps: usize,
    /// Total edges split.
    pub refined: usize,
    /// Total edges collapsed.
    pub coarsened: usize,
    /// Total edge/face swaps accepted.
    pub swapped: usize,
    /// Statistics of the final mesh.
    pub stats: MeshStats,
}

/// Adapt `mesh` to its metric field.
///
/// The mesh is defragmented on return, so previously held indices are
/// invalid; the returned report carries the final statistics.
pub fn adapt(mesh: &mut MeshStore, params: &AdaptParams) -> Result<AdaptReport, AdaptError> {
    match params.threads {
        Some(n) => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .expect("failed to build adaptation thread pool");
            pool.install(|| run_sweeps(mesh, params))
        }
        None => run_sweeps(mesh, params),
    }
}

fn run_sweeps(mesh: &mut MeshStore, params: &AdaptParams) -> Result<AdaptReport, AdaptError> {
    let mut report = AdaptReport::default();
    let dim = mesh.dim();

    for sweep in 0..params.max_sweeps {
        let nbuckets = params.bucket_scaling * rayon::current_num_threads();
        let mutations;

        if dim == 2 {
            let mut surface = SurfaceModel::from_mesh(mesh);
            let coarsened =
                Coarsen2D::new(params.l_low, params.l_max).coarsen(mesh, &mut surface);
            let swapped_a = Swap2D::new(params.q_min, params.swap_pass_cap).swap(mesh);
            let refined = Refine2D::new(params.l_max, nbuckets).refine(mesh);
            let swapped_b = Swap2D::new(params.q_min, params.swap_pass_cap).swap(mesh);

            report.coarsened += coarsened;
            report.refined += refined;
            report.swapped += swapped_a + swapped_b;
            mutations = coarsened + swapped_a + refined + swapped_b;
            debug!(
                sweep,
                coarsened,
                refined,
                swapped = swapped_a + swapped_b,
                "2d adaptation sweep"
            );
        } else {
            let swapped = Swap3D::new(params.q_min).swap(mesh);
            report.swapped += swapped;
            mutations = swapped;
            debug!(sweep, swapped, "3d adaptation sweep");
        }

        // The topological operators invalidated the facet set; rebuild it
        // for the smoothing pass.
        let surface = SurfaceModel::from_mesh(mesh);
        let iters = Smooth::new(params.smooth_iters, params.smooth_tol).smooth(mesh, &surface);
        debug!(sweep, iters, "smoothing pass");

        report.sweeps = sweep + 1;
        if mutations == 0 {
            break;
        }
    }

    mesh.defragment();
    mesh.debug_assert_invariants();
    report.stats = mesh.stats();
    Ok(report)
}
