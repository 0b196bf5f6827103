//! Mesh import/export.
//!
//! The exchange format is the flat-array tuple of the external interface:
//! vertex coordinates, the element-node table in positive orientation,
//! optionally a packed per-vertex metric and per-facet boundary tags.
//! Import performs the full input validation pass — malformed input is
//! rejected here, once, and never re-checked inside the operators. Export
//! defragments first so the emitted indices are dense.

use crate::error::AdaptError;
use crate::geometry;
use crate::mesh::MeshStore;
use ahash::AHashMap;

/// The import/export tuple.
#[derive(Clone, Debug, Default)]
pub struct MeshData {
    /// Spatial dimension, 2 or 3.
    pub dim: usize,
    /// `N * dim` vertex coordinates.
    pub coords: Vec<f64>,
    /// `E * (dim + 1)` vertex indices in positive orientation.
    pub elements: Vec<usize>,
    /// Optional `N * dim(dim+1)/2` packed metric entries; identity when
    /// absent.
    pub metric: Option<Vec<f64>>,
    /// Optional `E * (dim + 1)` per-facet boundary tags; derived from facet
    /// sharing when absent (facets on exactly one element get marker 1).
    pub boundary: Option<Vec<i32>>,
}

/// Sorted facet key for sharing counts; 2D facets pad the third slot.
type FacetKey = [usize; 3];

fn facet_key(verts: &[usize], skip: usize) -> FacetKey {
    let mut key = [usize::MAX; 3];
    let mut k = 0;
    for (i, &v) in verts.iter().enumerate() {
        if i != skip {
            key[k] = v;
            k += 1;
        }
    }
    key[..k].sort_unstable();
    key
}

/// Validate `data` and build a [`MeshStore`] from it.
///
/// Errors are fatal and follow the §7 taxonomy: length mismatches,
/// out-of-range or repeated vertex indices, non-positive element volumes,
/// non-SPD metric tensors and a boundary that fails to close.
pub fn import(data: &MeshData) -> Result<MeshStore, AdaptError> {
    let dim = data.dim;
    if dim != 2 && dim != 3 {
        return Err(AdaptError::UnsupportedDimension(dim));
    }
    let nloc = dim + 1;
    let msize = geometry::metric_len(dim);

    if data.coords.len() % dim != 0 {
        return Err(AdaptError::InputLengthMismatch {
            what: "coords",
            expected: data.coords.len() / dim * dim,
            found: data.coords.len(),
        });
    }
    let nverts = data.coords.len() / dim;

    if data.elements.len() % nloc != 0 {
        return Err(AdaptError::InputLengthMismatch {
            what: "elements",
            expected: data.elements.len() / nloc * nloc,
            found: data.elements.len(),
        });
    }
    let nelems = data.elements.len() / nloc;

    let metric = match &data.metric {
        Some(m) => {
            if m.len() != nverts * msize {
                return Err(AdaptError::InputLengthMismatch {
                    what: "metric",
                    expected: nverts * msize,
                    found: m.len(),
                });
            }
            m.clone()
        }
        None => {
            // Identity metric everywhere.
            let mut m = vec![0.0; nverts * msize];
            for v in 0..nverts {
                if dim == 2 {
                    m[v * 3] = 1.0;
                    m[v * 3 + 2] = 1.0;
                } else {
                    m[v * 6] = 1.0;
                    m[v * 6 + 3] = 1.0;
                    m[v * 6 + 5] = 1.0;
                }
            }
            m
        }
    };

    for v in 0..nverts {
        if !geometry::is_spd(dim, &metric[v * msize..(v + 1) * msize]) {
            return Err(AdaptError::NonSpdMetric(v));
        }
    }

    for e in 0..nelems {
        let n = &data.elements[e * nloc..(e + 1) * nloc];
        for (i, &v) in n.iter().enumerate() {
            if v >= nverts {
                return Err(AdaptError::VertexOutOfBounds {
                    element: e,
                    vertex: v,
                    nverts,
                });
            }
            if n[i + 1..].contains(&v) {
                return Err(AdaptError::DuplicateVertexInElement {
                    element: e,
                    vertex: v,
                });
            }
        }
        let vol = match dim {
            2 => geometry::area(
                &data.coords[n[0] * 2..n[0] * 2 + 2],
                &data.coords[n[1] * 2..n[1] * 2 + 2],
                &data.coords[n[2] * 2..n[2] * 2 + 2],
            ),
            _ => geometry::volume(
                &data.coords[n[0] * 3..n[0] * 3 + 3],
                &data.coords[n[1] * 3..n[1] * 3 + 3],
                &data.coords[n[2] * 3..n[2] * 3 + 3],
                &data.coords[n[3] * 3..n[3] * 3 + 3],
            ),
        };
        if vol <= 0.0 {
            return Err(AdaptError::InvertedElement {
                element: e,
                volume: vol,
            });
        }
    }

    // Facet sharing counts drive both boundary derivation and the manifold
    // check.
    let mut facet_count: AHashMap<FacetKey, usize> = AHashMap::new();
    for e in 0..nelems {
        let n = &data.elements[e * nloc..(e + 1) * nloc];
        for i in 0..nloc {
            let key = facet_key(n, i);
            let cnt = facet_count.entry(key).or_insert(0);
            *cnt += 1;
            if *cnt > 2 {
                return Err(AdaptError::OpenBoundary(key[0]));
            }
        }
    }

    let boundary = match &data.boundary {
        Some(b) => {
            if b.len() != nelems * nloc {
                return Err(AdaptError::InputLengthMismatch {
                    what: "boundary",
                    expected: nelems * nloc,
                    found: b.len(),
                });
            }
            b.clone()
        }
        None => {
            let mut b = vec![0; nelems * nloc];
            for e in 0..nelems {
                let n = &data.elements[e * nloc..(e + 1) * nloc];
                for i in 0..nloc {
                    if facet_count[&facet_key(n, i)] == 1 {
                        b[e * nloc + i] = 1;
                    }
                }
            }
            b
        }
    };

    // Closure: in 2D every boundary vertex carries exactly two boundary
    // facets; in 3D every edge of a boundary triangle carries exactly two.
    if dim == 2 {
        let mut incidence = vec![0usize; nverts];
        for e in 0..nelems {
            let n = &data.elements[e * nloc..(e + 1) * nloc];
            for i in 0..nloc {
                if boundary[e * nloc + i] > 0 {
                    for (j, &v) in n.iter().enumerate() {
                        if j != i {
                            incidence[v] += 1;
                        }
                    }
                }
            }
        }
        for (v, &cnt) in incidence.iter().enumerate() {
            if cnt != 0 && cnt != 2 {
                return Err(AdaptError::OpenBoundary(v));
            }
        }
    } else {
        let mut edge_count: AHashMap<(usize, usize), usize> = AHashMap::new();
        for e in 0..nelems {
            let n = &data.elements[e * nloc..(e + 1) * nloc];
            for i in 0..nloc {
                if boundary[e * nloc + i] > 0 {
                    let key = facet_key(n, i);
                    for (a, b) in [(key[0], key[1]), (key[0], key[2]), (key[1], key[2])] {
                        *edge_count.entry((a, b)).or_insert(0) += 1;
                    }
                }
            }
        }
        for ((a, _), &cnt) in edge_count.iter() {
            if cnt != 2 {
                return Err(AdaptError::OpenBoundary(*a));
            }
        }
    }

    Ok(MeshStore::from_raw(
        dim,
        data.coords.clone(),
        metric,
        data.elements.clone(),
        boundary,
    ))
}

/// Defragment the mesh and emit the exchange tuple with dense indices.
pub fn export(mesh: &mut MeshStore) -> MeshData {
    mesh.defragment();
    let nverts = mesh.num_vertices();
    let msize = mesh.msize();
    MeshData {
        dim: mesh.dim(),
        coords: mesh.coords.clone(),
        elements: mesh.enlist.clone(),
        metric: Some(mesh.metric[..nverts * msize].to_vec()),
        boundary: Some(mesh.boundary.clone()),
    }
}
