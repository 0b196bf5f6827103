//! # mesh-adapt
//!
//! mesh-adapt is an anisotropic adaptive remeshing engine for unstructured
//! simplicial meshes (triangles in 2D, tetrahedra in 3D) guided by a
//! per-vertex Riemannian metric field. Given a mesh whose vertices carry
//! symmetric positive-definite metric tensors, it iteratively applies four
//! local transformations — edge refinement, edge collapse, edge/face
//! swapping and vertex smoothing — until edges are approximately unit
//! length in the metric and element shape quality is high.
//!
//! ## Architecture
//! - [`mesh::MeshStore`] owns the vertex/element arenas and both adjacency
//!   structures; erasures are logical and reclaimed by
//!   [`mesh::MeshStore::defragment`].
//! - [`geometry`] holds the metric algebra, the symmetric metric edge
//!   length, and the Lipnikov quality functional the operators share.
//! - [`surface::SurfaceModel`] guards the boundary: coplanar patches,
//!   corners, collapsibility.
//! - [`refine`], [`coarsen`], [`swap2d`], [`swap3d`] and [`smooth`] are the
//!   local operators; [`adapt::adapt`] drives them in the canonical
//!   `Coarsen -> Swap -> Refine -> Swap -> Smooth` sweep.
//!
//! ## Concurrency
//! Operators run data-parallel read passes over rayon and route every
//! adjacency mutation through a deferred queue sharded by target-vertex
//! hash ([`mesh::deferred`]); each bucket is drained by exactly one task at
//! a barrier, which makes freedom from write conflicts a structural
//! property rather than a locking discipline. Entity counters grow through
//! atomic range captures; nothing else is shared mutably.
//!
//! ## Usage
//! ```no_run
//! use mesh_adapt::prelude::*;
//!
//! let data = MeshData {
//!     dim: 2,
//!     coords: vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0],
//!     elements: vec![0, 1, 2],
//!     metric: None,
//!     boundary: None,
//! };
//! let mut mesh = import(&data)?;
//! let report = adapt(&mut mesh, &AdaptParams::default())?;
//! println!("{} sweeps, min quality {}", report.sweeps, report.stats.quality_min);
//! let out = export(&mut mesh);
//! # Ok::<(), mesh_adapt::error::AdaptError>(())
//! ```

pub mod adapt;
pub mod coarsen;
pub mod colour;
pub mod error;
pub mod geometry;
pub mod io;
pub mod mesh;
mod parallel;
pub mod partition;
pub mod refine;
pub mod smooth;
pub mod surface;
pub mod swap2d;
pub mod swap3d;

/// The most-used types and entry points.
pub mod prelude {
    pub use crate::adapt::{adapt, AdaptParams, AdaptReport};
    pub use crate::coarsen::Coarsen2D;
    pub use crate::error::AdaptError;
    pub use crate::io::{export, import, MeshData};
    pub use crate::mesh::{MeshStats, MeshStore};
    pub use crate::refine::Refine2D;
    pub use crate::smooth::Smooth;
    pub use crate::surface::SurfaceModel;
    pub use crate::swap2d::Swap2D;
    pub use crate::swap3d::Swap3D;
}
