//! `AdaptError`: unified error type for the adaptation engine.
//!
//! Errors fall into two families. Input validation failures are raised once
//! at the import boundary and are fatal for that invocation. Adjacency
//! inconsistencies indicate a broken internal invariant and carry the
//! offending indices so the failure can be traced to a concrete entity.
//!
//! Rejected local modifications (a collapse that would shrink an element too
//! far, a flip that does not improve quality) are *not* errors; operators
//! signal them through their return values.

use thiserror::Error;

/// Unified error type for mesh adaptation operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AdaptError {
    /// Coordinate/metric/element array lengths disagree with the declared counts.
    #[error("input array length mismatch for {what}: expected {expected}, got {found}")]
    InputLengthMismatch {
        /// Which input array is malformed.
        what: &'static str,
        /// Expected number of entries.
        expected: usize,
        /// Number of entries supplied.
        found: usize,
    },
    /// Only 2D triangle and 3D tetrahedron meshes are supported.
    #[error("unsupported mesh dimension {0} (expected 2 or 3)")]
    UnsupportedDimension(usize),
    /// An element refers to a vertex index outside the vertex arena.
    #[error("element {element} references vertex {vertex} out of bounds ({nverts} vertices)")]
    VertexOutOfBounds {
        /// Offending element index.
        element: usize,
        /// Out-of-range vertex index.
        vertex: usize,
        /// Number of vertices in the arena.
        nverts: usize,
    },
    /// An element lists the same vertex twice.
    #[error("element {element} references vertex {vertex} more than once")]
    DuplicateVertexInElement {
        /// Offending element index.
        element: usize,
        /// Repeated vertex index.
        vertex: usize,
    },
    /// An element has non-positive signed volume in the fixed orientation.
    #[error("element {element} has non-positive signed volume {volume}")]
    InvertedElement {
        /// Offending element index.
        element: usize,
        /// The signed area/volume found.
        volume: f64,
    },
    /// A vertex metric tensor is not symmetric positive-definite.
    #[error("metric tensor at vertex {0} is not positive-definite")]
    NonSpdMetric(usize),
    /// The boundary facet set is not a closed (d-1)-manifold.
    #[error("boundary is not a closed manifold near vertex {0}")]
    OpenBoundary(usize),
    /// An element is missing from the node-element list of one of its vertices.
    #[error("adjacency inconsistency: element {element} not found in NEList of vertex {vertex}")]
    ElementNotInNeList {
        /// Element whose membership is missing.
        element: usize,
        /// Vertex whose NEList was searched.
        vertex: usize,
    },
    /// Two vertices joined by an element edge are missing the node-node link.
    #[error("adjacency inconsistency: vertices {0} and {1} share an element edge but not a node-node link")]
    MissingEdgeLink(usize, usize),
    /// A node-node list contains the same neighbour twice.
    #[error("adjacency inconsistency: vertex {vertex} lists neighbour {neighbour} twice")]
    DuplicateNeighbour {
        /// Vertex owning the malformed list.
        vertex: usize,
        /// Duplicated neighbour index.
        neighbour: usize,
    },
    /// An interior 2D edge is shared by a number of elements other than 1 or 2.
    #[error("adjacency inconsistency: edge ({0}, {1}) is shared by {2} elements")]
    MalformedEdgeStar(usize, usize, usize),
}
