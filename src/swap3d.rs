//! 3D face and edge swapping.
//!
//! Applied to tetrahedra whose quality falls below `q_min`. The poor
//! elements and their face neighbours form a graph which is greedily
//! coloured; the sweeps then visit elements colour by colour so that no two
//! adjacent cavities are rearranged in the same step.
//!
//! Two moves are attempted:
//!
//! - **Face to edge (2-to-3).** The pair of tets sharing a face is replaced
//!   by three tets around the edge joining the two apexes.
//! - **Edge to face (3-to-2, 4-to-4, 5-to-6, 6-to-8).** For an interior
//!   edge whose cavity closes with k tets, the predefined retriangulations
//!   of the ring are scored and the best one replaces the cavity when it
//!   beats the current minimum. If every candidate of every option scores
//!   negative the ring was traversed against the grain: indices 0 and 1 of
//!   each tet are exchanged once and the options rescored.
//!
//! The template tables are a bit-exact transcription of the classical
//! enumeration (Biswas & Strawn 1994; Li et al. 2005); cavity option `m`
//! fans the ring from ring vertex positions as listed. Boundary tags carried
//! by cavity facets are reattached to the matching facets of the new tets.
//! Adjacency is rebuilt wholesale after the sweeps.

use crate::colour;
use crate::mesh::{MeshStore, INVALID};
use ahash::AHashMap;
use rayon::prelude::*;

/// One template tet: three ring positions plus which edge endpoint caps it
/// (`false` = the l-end, `true` = the k-end).
type TetTpl = (usize, usize, usize, bool);

const OPTS_3: &[&[TetTpl]] = &[&[(0, 1, 2, false), (1, 0, 2, true)]];

const OPTS_4: &[&[TetTpl]] = &[
    &[
        (0, 1, 3, false),
        (1, 2, 3, false),
        (1, 0, 3, true),
        (2, 1, 3, true),
    ],
    &[
        (0, 1, 2, false),
        (0, 2, 3, false),
        (0, 2, 1, true),
        (0, 3, 2, true),
    ],
];

const OPTS_5: &[&[TetTpl]] = &[
    &[
        (0, 1, 2, false),
        (2, 3, 0, false),
        (3, 4, 0, false),
        (1, 0, 2, true),
        (3, 2, 0, true),
        (4, 3, 0, true),
    ],
    &[
        (0, 1, 4, false),
        (1, 3, 4, false),
        (1, 2, 3, false),
        (0, 4, 1, true),
        (1, 4, 3, true),
        (1, 3, 2, true),
    ],
    &[
        (2, 0, 1, false),
        (2, 4, 0, false),
        (2, 3, 4, false),
        (2, 1, 0, true),
        (2, 0, 4, true),
        (2, 4, 3, true),
    ],
    &[
        (3, 1, 2, false),
        (3, 0, 1, false),
        (3, 4, 0, false),
        (3, 2, 1, true),
        (3, 1, 0, true),
        (3, 0, 4, true),
    ],
    &[
        (4, 0, 1, false),
        (4, 1, 2, false),
        (4, 2, 3, false),
        (4, 1, 0, true),
        (4, 2, 1, true),
        (4, 3, 2, true),
    ],
];

const OPTS_6: &[&[TetTpl]] = &[&[
    (0, 1, 5, false),
    (2, 3, 4, false),
    (1, 2, 5, false),
    (5, 2, 4, false),
    (1, 0, 5, true),
    (3, 2, 4, true),
    (2, 1, 5, true),
    (2, 5, 4, true),
]];

/// Retriangulation options for a closed cavity of `k` tets.
fn cavity_templates(k: usize) -> Option<&'static [&'static [TetTpl]]> {
    match k {
        3 => Some(OPTS_3),
        4 => Some(OPTS_4),
        5 => Some(OPTS_5),
        6 => Some(OPTS_6),
        _ => None,
    }
}

/// 3D swap pass over a shared mesh.
pub struct Swap3D {
    q_min: f64,
}

impl Swap3D {
    pub fn new(q_min: f64) -> Self {
        Self { q_min }
    }

    /// Run one face-to-edge sweep and one edge-to-face sweep over the poor
    /// elements. Returns the number of accepted swaps.
    pub fn swap(&self, mesh: &mut MeshStore) -> usize {
        debug_assert_eq!(mesh.dim(), 3);
        let nelems = mesh.num_elements();

        let mut quality: Vec<f64> = (0..nelems)
            .into_par_iter()
            .map(|e| mesh.quality(e))
            .collect();

        // Partial element-element graph over the poor elements: entry j is
        // the neighbour across the face opposite local vertex j.
        let mut partial_ee: AHashMap<usize, [i64; 4]> = AHashMap::new();
        for e in 0..nelems {
            if !mesh.element_is_alive(e) || quality[e] >= self.q_min {
                continue;
            }
            let n = mesh.element(e);
            let mut row = [-1i64; 4];
            for (j, slot) in row.iter_mut().enumerate() {
                let a = n[(j + 1) % 4];
                let b = n[(j + 2) % 4];
                let c = n[(j + 3) % 4];
                for &cand in mesh.elements_of(a) {
                    if cand != e
                        && mesh.elements_of(b).contains(&cand)
                        && mesh.elements_of(c).contains(&cand)
                    {
                        *slot = cand as i64;
                        break;
                    }
                }
            }
            partial_ee.insert(e, row);
        }
        if partial_ee.is_empty() {
            return 0;
        }

        // Colour the graph of poor elements and their neighbours.
        let mut nodes: Vec<usize> = partial_ee
            .iter()
            .flat_map(|(&e, row)| {
                std::iter::once(e).chain(row.iter().filter(|&&j| j >= 0).map(|&j| j as usize))
            })
            .collect();
        nodes.sort_unstable();
        nodes.dedup();
        let index_of: AHashMap<usize, usize> =
            nodes.iter().enumerate().map(|(i, &e)| (e, i)).collect();

        let mut adjacency = vec![Vec::new(); nodes.len()];
        for (&e, row) in partial_ee.iter() {
            let ei = index_of[&e];
            for &j in row.iter() {
                if j >= 0 {
                    let ji = index_of[&(j as usize)];
                    if !adjacency[ei].contains(&ji) {
                        adjacency[ei].push(ji);
                        adjacency[ji].push(ei);
                    }
                }
            }
        }
        let colours = colour::greedy(&adjacency);
        let max_colour = colours.iter().copied().max().unwrap_or(0);

        let mut nswaps = 0;

        // Face-to-edge sweep.
        for c in 0..=max_colour {
            for (i, &eid0) in nodes.iter().enumerate() {
                if colours[i] != c || !partial_ee.contains_key(&eid0) {
                    continue;
                }
                if !mesh.element_is_alive(eid0) {
                    continue;
                }
                if self.face_to_edge(mesh, &mut quality, &partial_ee[&eid0], eid0) {
                    nswaps += 1;
                }
            }
        }

        // Edge-to-face sweep.
        for c in 0..=max_colour {
            for (i, &eid0) in nodes.iter().enumerate() {
                if colours[i] != c || !partial_ee.contains_key(&eid0) {
                    continue;
                }
                if !mesh.element_is_alive(eid0) {
                    continue;
                }
                if self.edge_to_face(mesh, &mut quality, eid0) {
                    nswaps += 1;
                }
            }
        }

        mesh.create_adjacency();
        mesh.debug_assert_invariants();
        nswaps
    }

    /// Try the 2-to-3 swap of `eid0` against each face neighbour.
    fn face_to_edge(
        &self,
        mesh: &mut MeshStore,
        quality: &mut Vec<f64>,
        neighbours: &[i64; 4],
        eid0: usize,
    ) -> bool {
        let n: [usize; 4] = mesh.element(eid0).try_into().unwrap();

        // A dead neighbour means this cavity was already rearranged.
        for &j in neighbours.iter() {
            if j >= 0 && !mesh.element_is_alive(j as usize) {
                return false;
            }
        }

        for j in 0..4 {
            let eid1 = neighbours[j];
            if eid1 < 0 {
                continue;
            }
            let eid1 = eid1 as usize;

            // The shared face, wound so the new tets inherit a positive
            // orientation, with hull[3] = this apex, hull[4] = far apex.
            let mut hull = match j {
                0 => [n[1], n[3], n[2], n[0], INVALID],
                1 => [n[2], n[3], n[0], n[1], INVALID],
                2 => [n[0], n[3], n[1], n[2], INVALID],
                _ => [n[0], n[1], n[2], n[3], INVALID],
            };
            let m = mesh.element(eid1);
            for &v in m {
                if !n.contains(&v) {
                    hull[4] = v;
                    break;
                }
            }
            debug_assert_ne!(hull[4], INVALID);

            let t0 = [hull[0], hull[1], hull[4], hull[3]];
            let t1 = [hull[1], hull[2], hull[4], hull[3]];
            let t2 = [hull[2], hull[0], hull[4], hull[3]];
            let q0 = tet_quality(mesh, &t0);
            let q1 = tet_quality(mesh, &t1);
            let q2 = tet_quality(mesh, &t2);

            if quality[eid0].min(quality[eid1]) < q0.min(q1).min(q2) {
                let tags = collect_cavity_tags(mesh, &[eid0, eid1]);
                mesh.erase_element(eid0);
                mesh.erase_element(eid1);
                for (t, q) in [(t0, q0), (t1, q1), (t2, q2)] {
                    append_with_tags(mesh, &t, &tags);
                    quality.push(q);
                }
                return true;
            }
        }
        false
    }

    /// Try the edge-to-face swaps on each edge of `eid0`.
    fn edge_to_face(&self, mesh: &mut MeshStore, quality: &mut Vec<f64>, eid0: usize) -> bool {
        let n: [usize; 4] = mesh.element(eid0).try_into().unwrap();

        for k in 0..3 {
            for l in (k + 1)..4 {
                let cavity: Vec<usize> = mesh
                    .elements_of(n[k])
                    .iter()
                    .copied()
                    .filter(|e| mesh.elements_of(n[l]).contains(e))
                    .collect();

                let mut min_quality = quality[eid0];
                let mut ring_pairs: Vec<(usize, usize)> = Vec::new();
                let mut toxic = false;
                for &e in &cavity {
                    if !mesh.element_is_alive(e) {
                        toxic = true;
                        break;
                    }
                    min_quality = min_quality.min(quality[e]);
                    let m = mesh.element(e);
                    let mut pair = [INVALID; 2];
                    let mut p = 0;
                    for &v in m {
                        if v != n[k] && v != n[l] {
                            pair[p] = v;
                            p += 1;
                        }
                    }
                    ring_pairs.push((pair[0], pair[1]));
                }
                if toxic {
                    return false;
                }

                let nelements = cavity.len();
                if !(3..=6).contains(&nelements) {
                    continue;
                }

                // Chain the per-tet vertex pairs into a ring around the edge.
                let Some(ring) = chain_ring(&ring_pairs) else {
                    // Open ring: the edge lies on the boundary, leave it.
                    continue;
                };

                let templates = cavity_templates(nelements).unwrap();

                // Instantiate every option.
                let mut options: Vec<Vec<[usize; 4]>> = templates
                    .iter()
                    .map(|tpl| {
                        tpl.iter()
                            .map(|&(a, b, c, cap_k)| {
                                let apex = if cap_k { n[k] } else { n[l] };
                                [ring[a], ring[b], ring[c], apex]
                            })
                            .collect()
                    })
                    .collect();

                // Score options; if everything comes out inverted the ring
                // was walked backwards, so flip each tet once and rescore.
                let mut best_option = 0;
                let mut best_quality = f64::NEG_INFINITY;
                let mut best_scores: Vec<f64> = Vec::new();
                for _invert in 0..2 {
                    best_option = 0;
                    best_quality = f64::NEG_INFINITY;
                    for (o, option) in options.iter().enumerate() {
                        let scores: Vec<f64> =
                            option.iter().map(|t| tet_quality(mesh, t)).collect();
                        let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
                        if min > best_quality {
                            best_quality = min;
                            best_option = o;
                            best_scores = scores;
                        }
                    }
                    if best_quality < 0.0 {
                        for option in options.iter_mut() {
                            for t in option.iter_mut() {
                                t.swap(0, 1);
                            }
                        }
                        continue;
                    }
                    break;
                }

                if best_quality <= min_quality {
                    continue;
                }

                let tags = collect_cavity_tags(mesh, &cavity);
                for &e in &cavity {
                    mesh.erase_element(e);
                }
                for (t, q) in options[best_option].iter().zip(best_scores) {
                    append_with_tags(mesh, t, &tags);
                    quality.push(q);
                }
                return true;
            }
        }
        false
    }
}

/// Walk the unordered per-tet apex pairs into a closed ring; `None` when the
/// chain does not close (a boundary edge).
fn chain_ring(pairs: &[(usize, usize)]) -> Option<Vec<usize>> {
    let n = pairs.len();
    let mut chain = vec![pairs[0].0, pairs[0].1];
    let mut used = vec![false; n];
    used[0] = true;
    for _ in 1..n {
        let last = *chain.last().unwrap();
        let mut advanced = false;
        for (e, &(a, b)) in pairs.iter().enumerate() {
            if used[e] {
                continue;
            }
            if a == last {
                chain.push(b);
                used[e] = true;
                advanced = true;
                break;
            }
            if b == last {
                chain.push(a);
                used[e] = true;
                advanced = true;
                break;
            }
        }
        if !advanced {
            return None;
        }
    }
    if chain[0] != *chain.last().unwrap() {
        return None;
    }
    chain.pop();
    Some(chain)
}

/// Boundary tags carried by the cavity facets, keyed by sorted facet.
fn collect_cavity_tags(mesh: &MeshStore, cavity: &[usize]) -> AHashMap<[usize; 3], i32> {
    let mut tags = AHashMap::new();
    for &e in cavity {
        let n = mesh.element(e);
        let bdry = mesh.boundary_of(e);
        for i in 0..4 {
            if bdry[i] > 0 {
                let mut key = [INVALID; 3];
                let mut p = 0;
                for (j, &v) in n.iter().enumerate() {
                    if j != i {
                        key[p] = v;
                        p += 1;
                    }
                }
                key.sort_unstable();
                tags.insert(key, bdry[i]);
            }
        }
    }
    tags
}

/// Append a tet, reattaching any boundary tags its facets carried before the
/// swap.
fn append_with_tags(mesh: &mut MeshStore, t: &[usize; 4], tags: &AHashMap<[usize; 3], i32>) {
    let mut bdry = [0i32; 4];
    if !tags.is_empty() {
        for (i, slot) in bdry.iter_mut().enumerate() {
            let mut key = [INVALID; 3];
            let mut p = 0;
            for (j, &v) in t.iter().enumerate() {
                if j != i {
                    key[p] = v;
                    p += 1;
                }
            }
            key.sort_unstable();
            if let Some(&tag) = tags.get(&key) {
                *slot = tag;
            }
        }
    }
    mesh.append_element_with_boundary(t, &bdry);
}

fn tet_quality(mesh: &MeshStore, t: &[usize; 4]) -> f64 {
    crate::geometry::lipnikov_3d(
        [
            mesh.coords_of(t[0]),
            mesh.coords_of(t[1]),
            mesh.coords_of(t[2]),
            mesh.coords_of(t[3]),
        ],
        [
            mesh.metric_of(t[0]),
            mesh.metric_of(t[1]),
            mesh.metric_of(t[2]),
            mesh.metric_of(t[3]),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{import, MeshData};

    /// Three sliver tets wrapped around a long interior edge; the 3-to-2
    /// swap removes the edge.
    fn three_tet_ring() -> MeshStore {
        let r = 0.3;
        let h = 2.0;
        let mut coords = Vec::new();
        // Ring vertices 0..3 on the equator, poles 3 (bottom) and 4 (top).
        for m in 0..3 {
            let theta = 2.0 * std::f64::consts::PI * m as f64 / 3.0;
            coords.extend_from_slice(&[r * theta.cos(), r * theta.sin(), 0.0]);
        }
        coords.extend_from_slice(&[0.0, 0.0, -h]);
        coords.extend_from_slice(&[0.0, 0.0, h]);

        // Tets (ring_m, ring_m+1, bottom, top) around the central edge.
        let elements = vec![0, 1, 3, 4, 1, 2, 3, 4, 2, 0, 3, 4];
        import(&MeshData {
            dim: 3,
            coords,
            elements,
            metric: None,
            boundary: None,
        })
        .unwrap()
    }

    #[test]
    fn ring_of_three_swaps_to_two() {
        let mut mesh = three_tet_ring();
        let before = mesh.stats();
        assert!(before.quality_min < 0.1, "ring is not poor: {:?}", before);

        let swap = Swap3D::new(0.3);
        let nswaps = swap.swap(&mut mesh);
        assert_eq!(nswaps, 1);
        assert!(mesh.validate_invariants().is_ok());

        let after = mesh.stats();
        assert_eq!(after.elements, 2);
        assert!(after.quality_min > before.quality_min);
        // The central edge (3, 4) is gone.
        assert!(!mesh.neighbours(3).contains(&4));
    }

    #[test]
    fn good_tet_is_untouched() {
        let s = 0.5;
        let coords = vec![
            s,
            0.0,
            -s / 2.0_f64.sqrt(),
            -s,
            0.0,
            -s / 2.0_f64.sqrt(),
            0.0,
            -s,
            s / 2.0_f64.sqrt(),
            0.0,
            s,
            s / 2.0_f64.sqrt(),
        ];
        let mut mesh = import(&MeshData {
            dim: 3,
            coords,
            elements: vec![0, 1, 2, 3],
            metric: None,
            boundary: None,
        })
        .unwrap();

        let swap = Swap3D::new(0.3);
        assert_eq!(swap.swap(&mut mesh), 0);
        assert_eq!(mesh.stats().elements, 1);
    }

    #[test]
    fn chain_ring_orders_pairs() {
        // Pairs of a 4-ring, deliberately shuffled and reversed.
        let pairs = [(7, 9), (8, 6), (9, 8), (6, 7)];
        let ring = chain_ring(&pairs).unwrap();
        assert_eq!(ring.len(), 4);
        assert_eq!(ring[0], 7);
        // Consecutive entries share a source pair.
        for w in 0..4 {
            let a = ring[w];
            let b = ring[(w + 1) % 4];
            assert!(
                pairs.contains(&(a, b)) || pairs.contains(&(b, a)),
                "ring breaks between {a} and {b}"
            );
        }
    }

    #[test]
    fn open_chain_is_rejected() {
        assert!(chain_ring(&[(0, 1), (1, 2), (2, 3)]).is_none());
    }

    #[test]
    fn boundary_tags_survive_the_swap() {
        let mut mesh = three_tet_ring();
        let tagged_before: usize = (0..mesh.num_elements())
            .filter(|&e| mesh.element_is_alive(e))
            .map(|e| mesh.boundary_of(e).iter().filter(|&&t| t > 0).count())
            .sum();
        assert!(tagged_before > 0);

        let swap = Swap3D::new(0.3);
        swap.swap(&mut mesh);

        // The cavity hull is unchanged, so the same facets carry tags.
        let tagged_after: usize = (0..mesh.num_elements())
            .filter(|&e| mesh.element_is_alive(e))
            .map(|e| mesh.boundary_of(e).iter().filter(|&&t| t > 0).count())
            .sum();
        assert_eq!(tagged_after, tagged_before);
    }
}
