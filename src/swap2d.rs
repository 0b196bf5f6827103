//! 2D edge flipping.
//!
//! Flips the shared edge of a triangle pair whenever the worse of the two
//! replacement qualities beats the worse of the current pair. Edges enter
//! the queue when one of their incident elements falls below `q_min`; every
//! accepted flip re-queues the four lateral edges for another look.
//!
//! The parallel schedule is lock-free and works on per-vertex working rows:
//!
//! - `deg` freezes each vertex's degree at the start of a pass ("original"
//!   neighbours); `nn` is the node-node row grown to `3 * deg` slots so
//!   flips can append without reallocation, `ne` the node-element row grown
//!   to twice its live count; empty slots hold a sentinel.
//! - `marked[k]` flags edge `(v, nn[k])`, stored on the lesser endpoint.
//! - A thread owns the edges of the vertices it iterates; before committing
//!   a flip it gives way if a lateral edge is marked (a neighbouring thread
//!   may be about to flip it) or if any participating adjacency is not
//!   original — an index at or past `deg` means the view is stale and the
//!   edge is simply retried next round.
//!
//! After each pass the rows are compacted, sentinels dropped and degrees
//! refrozen; the loop ends when no marks remain or the pass cap is reached.
//! Quality is bounded and every accepted flip strictly raises the local
//! minimum, so the marks drain.

use crate::geometry;
use crate::mesh::{MeshStore, INVALID};
use rayon::prelude::*;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};

const EMPTY: i64 = -1;

/// Working adjacency of one vertex during a swap sweep.
struct VertexRow {
    /// Node-node slots, `3 * deg` long, [`EMPTY`]-padded.
    nn: Vec<AtomicI64>,
    /// Node-element slots; the live half is searched, the upper half
    /// receives elements gained by flips.
    ne: Vec<AtomicI64>,
    /// Mark per original edge slot.
    marked: Vec<AtomicU8>,
    /// Degree frozen at the start of the pass.
    deg: usize,
}

#[inline]
fn load_f64(a: &AtomicU64) -> f64 {
    f64::from_bits(a.load(Ordering::Relaxed))
}

#[inline]
fn store_f64(a: &AtomicU64, v: f64) {
    a.store(v.to_bits(), Ordering::Relaxed);
}

/// Index of `target` among the original neighbours of `v`, or `usize::MAX`
/// when `target` is not an original neighbour (a stale or freshly added
/// adjacency).
fn orig_index(rows: &[VertexRow], v: usize, target: i64) -> usize {
    let row = &rows[v];
    for pos in 0..row.deg {
        if row.nn[pos].load(Ordering::Relaxed) == target {
            return pos;
        }
    }
    usize::MAX
}

/// 2D edge-flip pass over a shared mesh.
pub struct Swap2D {
    q_min: f64,
    pass_cap: usize,
}

impl Swap2D {
    /// `q_min` queues edges of elements below that quality; `pass_cap`
    /// bounds the mark-drain loop.
    pub fn new(q_min: f64, pass_cap: usize) -> Self {
        Self { q_min, pass_cap }
    }

    /// Flip until no marked edge remains. Returns the number of flips.
    pub fn swap(&self, mesh: &mut MeshStore) -> usize {
        debug_assert_eq!(mesh.dim(), 2);
        let nverts = mesh.num_vertices();
        let nelems = mesh.num_elements();

        // Quality cache; dead elements score 0 and never participate.
        let quality: Vec<AtomicU64> = (0..nelems)
            .into_par_iter()
            .map(|e| AtomicU64::new(mesh.quality(e).to_bits()))
            .collect();

        let halo: Vec<bool> = (0..nverts).map(|v| mesh.is_halo(v)).collect();

        // Build working rows; an edge is queued from its lesser endpoint
        // when an incident element is poor.
        let mut rows: Vec<VertexRow> = (0..nverts)
            .into_par_iter()
            .map(|v| {
                let deg = mesh.nnlist[v].len();
                let mut nn: Vec<AtomicI64> = Vec::with_capacity(3 * deg);
                for &w in &mesh.nnlist[v] {
                    nn.push(AtomicI64::new(w as i64));
                }
                nn.resize_with(3 * deg, || AtomicI64::new(EMPTY));

                let live = mesh.nelist[v].len().max(1);
                let mut ne: Vec<AtomicI64> = Vec::with_capacity(2 * live);
                for &e in &mesh.nelist[v] {
                    ne.push(AtomicI64::new(e as i64));
                }
                ne.resize_with(2 * live, || AtomicI64::new(EMPTY));

                let marked: Vec<AtomicU8> = mesh.nnlist[v]
                    .iter()
                    .map(|&w| {
                        let mark = v < w
                            && mesh
                                .edge_elements(v, w)
                                .iter()
                                .any(|&e| load_f64(&quality[e]) < self.q_min);
                        AtomicU8::new(mark as u8)
                    })
                    .collect();

                VertexRow { nn, ne, marked, deg }
            })
            .collect();

        // Element tuples as atomics; EMPTY marks an erased element.
        let en: Vec<AtomicI64> = mesh
            .enlist
            .iter()
            .map(|&v| AtomicI64::new(if v == INVALID { EMPTY } else { v as i64 }))
            .collect();

        let flips = AtomicUsize::new(0);
        let coords = &mesh.coords;
        let metric = &mesh.metric;

        let mut n_marked: usize = rows
            .par_iter()
            .map(|row| {
                row.marked
                    .iter()
                    .filter(|m| m.load(Ordering::Relaxed) == 1)
                    .count()
            })
            .sum();

        let mut pass = 0;
        while n_marked > 0 && pass < self.pass_cap {
            pass += 1;

            (0..nverts).into_par_iter().for_each(|i| {
                if halo[i] {
                    for m in &rows[i].marked {
                        m.store(0, Ordering::Relaxed);
                    }
                    return;
                }
                for it in 0..rows[i].deg {
                    if rows[i].marked[it].load(Ordering::Relaxed) != 1 {
                        continue;
                    }
                    process_edge(
                        &rows, &en, &quality, coords, metric, &halo, &flips, i, it,
                    );
                }
            });

            // Compact rows, drop sentinels, refreeze degrees; count what is
            // left marked.
            n_marked = rows
                .par_iter_mut()
                .map(|row| {
                    let mut live_nn = Vec::new();
                    let mut live_marks = Vec::new();
                    for (pos, slot) in row.nn.iter().enumerate() {
                        let v = slot.load(Ordering::Relaxed);
                        if v != EMPTY {
                            live_nn.push(v);
                            live_marks.push(if pos < row.deg {
                                row.marked[pos].load(Ordering::Relaxed)
                            } else {
                                0
                            });
                        }
                    }
                    let deg = live_nn.len();
                    let mut nn: Vec<AtomicI64> =
                        live_nn.into_iter().map(AtomicI64::new).collect();
                    nn.resize_with(3 * deg, || AtomicI64::new(EMPTY));
                    let count = live_marks.iter().filter(|&&m| m == 1).count();
                    let marked = live_marks.into_iter().map(AtomicU8::new).collect();

                    let mut live_ne = Vec::new();
                    for slot in &row.ne {
                        let e = slot.load(Ordering::Relaxed);
                        if e != EMPTY {
                            live_ne.push(e);
                        }
                    }
                    let slots = 2 * live_ne.len().max(1);
                    let mut ne: Vec<AtomicI64> =
                        live_ne.into_iter().map(AtomicI64::new).collect();
                    ne.resize_with(slots, || AtomicI64::new(EMPTY));

                    *row = VertexRow { nn, ne, marked, deg };
                    count
                })
                .sum();
        }

        // Publish the working rows back into the mesh.
        mesh.nnlist
            .par_iter_mut()
            .zip(rows.par_iter())
            .for_each(|(list, row)| {
                list.clear();
                for slot in &row.nn {
                    let v = slot.load(Ordering::Relaxed);
                    if v != EMPTY {
                        list.push(v as usize);
                    }
                }
            });
        mesh.nelist
            .par_iter_mut()
            .zip(rows.par_iter())
            .for_each(|(list, row)| {
                list.clear();
                for slot in &row.ne {
                    let e = slot.load(Ordering::Relaxed);
                    if e != EMPTY {
                        list.push(e as usize);
                    }
                }
            });
        mesh.enlist
            .par_iter_mut()
            .zip(en.par_iter())
            .for_each(|(slot, cell)| {
                let v = cell.load(Ordering::Relaxed);
                *slot = if v == EMPTY { INVALID } else { v as usize };
            });

        mesh.debug_assert_invariants();
        flips.load(Ordering::Relaxed)
    }
}

#[allow(clippy::too_many_arguments)]
fn process_edge(
    rows: &[VertexRow],
    en: &[AtomicI64],
    quality: &[AtomicU64],
    coords: &[f64],
    metric: &[f64],
    halo: &[bool],
    flips: &AtomicUsize,
    i: usize,
    it: usize,
) {
    let row = &rows[i];
    let opposite = row.nn[it].load(Ordering::Relaxed);
    if opposite < 0 {
        row.marked[it].store(0, Ordering::Relaxed);
        return;
    }
    let opposite_u = opposite as usize;
    if halo[opposite_u] {
        row.marked[it].store(0, Ordering::Relaxed);
        return;
    }

    // Find the two elements sharing the edge by scanning the live halves.
    let mut eid0 = EMPTY;
    let mut eid1 = EMPTY;
    let half_i = rows[i].ne.len() / 2;
    let half_o = rows[opposite_u].ne.len() / 2;
    let mut shared = 0;
    for k in 0..half_i {
        let e = rows[i].ne[k].load(Ordering::Relaxed);
        if e == EMPTY {
            continue;
        }
        for l in 0..half_o {
            if rows[opposite_u].ne[l].load(Ordering::Relaxed) == e {
                if shared == 0 {
                    eid0 = e;
                } else {
                    eid1 = e;
                }
                shared += 1;
                break;
            }
        }
    }
    if shared != 2 {
        row.marked[it].store(0, Ordering::Relaxed);
        return;
    }
    let (eid0, eid1) = (eid0 as usize, eid1 as usize);

    let n = [
        en[3 * eid0].load(Ordering::Relaxed),
        en[3 * eid0 + 1].load(Ordering::Relaxed),
        en[3 * eid0 + 2].load(Ordering::Relaxed),
    ];
    let m = [
        en[3 * eid1].load(Ordering::Relaxed),
        en[3 * eid1 + 1].load(Ordering::Relaxed),
        en[3 * eid1 + 2].load(Ordering::Relaxed),
    ];

    let n_off = (0..3).find(|&k| n[k] != i as i64 && n[k] != opposite);
    let m_off = (0..3).find(|&k| m[k] != i as i64 && m[k] != opposite);

    // A mismatch means another thread flipped a lateral edge and this view
    // is stale; leave the mark for the next round.
    let (n_off, m_off) = match (n_off, m_off) {
        (Some(a), Some(b)) => (a, b),
        _ => return,
    };
    if n[(n_off + 2) % 3] != m[(m_off + 1) % 3] || n[(n_off + 1) % 3] != m[(m_off + 2) % 3] {
        return;
    }

    let lateral_n = n[n_off];
    let lateral_m = m[m_off];
    let lateral_n_u = lateral_n as usize;
    let lateral_m_u = lateral_m as usize;

    // A halo apex would gain an edge and have its elements rewritten; halo
    // entities are immutable here.
    if halo[lateral_n_u] || halo[lateral_m_u] {
        row.marked[it].store(0, Ordering::Relaxed);
        return;
    }

    let mut idx_in_n = usize::MAX;
    let mut idx_in_m = usize::MAX;
    let mut idx_of_n = usize::MAX;
    let mut idx_of_m = usize::MAX;
    let mut min_opp_n = usize::MAX;
    let mut idx_opp_n = usize::MAX;
    let mut min_opp_m = usize::MAX;
    let mut idx_opp_m = usize::MAX;

    // Give way to the neighbouring thread that owns a marked lateral edge;
    // the asymmetric `i > lateral` condition breaks ties between the two
    // owners.
    if (i as i64) > lateral_n {
        idx_in_n = orig_index(rows, lateral_n_u, i as i64);
        if idx_in_n >= rows[lateral_n_u].deg {
            return;
        }
        if rows[lateral_n_u].marked[idx_in_n].load(Ordering::Relaxed) == 1 {
            return;
        }
        min_opp_n = opposite.min(lateral_n) as usize;
        let max_opp_n = opposite.max(lateral_n);
        idx_opp_n = orig_index(rows, min_opp_n, max_opp_n);
        if idx_opp_n >= rows[min_opp_n].deg {
            return;
        }
        if rows[min_opp_n].marked[idx_opp_n].load(Ordering::Relaxed) == 1 {
            return;
        }
    }
    if (i as i64) > lateral_m {
        idx_in_m = orig_index(rows, lateral_m_u, i as i64);
        if idx_in_m >= rows[lateral_m_u].deg {
            return;
        }
        if rows[lateral_m_u].marked[idx_in_m].load(Ordering::Relaxed) == 1 {
            return;
        }
        min_opp_m = opposite.min(lateral_m) as usize;
        let max_opp_m = opposite.max(lateral_m);
        idx_opp_m = orig_index(rows, min_opp_m, max_opp_m);
        if idx_opp_m >= rows[min_opp_m].deg {
            return;
        }
        if rows[min_opp_m].marked[idx_opp_m].load(Ordering::Relaxed) == 1 {
            return;
        }
    }

    // All four lateral adjacencies must be original ones.
    if idx_in_n == usize::MAX {
        idx_of_n = orig_index(rows, i, lateral_n);
        if idx_of_n >= rows[i].deg {
            return;
        }
    }
    if idx_in_m == usize::MAX {
        idx_of_m = orig_index(rows, i, lateral_m);
        if idx_of_m >= rows[i].deg {
            return;
        }
    }
    if idx_opp_n == usize::MAX {
        min_opp_n = opposite.min(lateral_n) as usize;
        let max_opp_n = opposite.max(lateral_n);
        idx_opp_n = orig_index(rows, min_opp_n, max_opp_n);
        if idx_opp_n >= rows[min_opp_n].deg {
            return;
        }
    }
    if idx_opp_m == usize::MAX {
        min_opp_m = opposite.min(lateral_m) as usize;
        let max_opp_m = opposite.max(lateral_m);
        idx_opp_m = orig_index(rows, min_opp_m, max_opp_m);
        if idx_opp_m >= rows[min_opp_m].deg {
            return;
        }
    }

    // The flip replaces edge (i, opposite) with (lateral_n, lateral_m).
    let n_swap = [n[n_off], m[m_off], n[(n_off + 2) % 3]];
    let m_swap = [n[n_off], n[(n_off + 1) % 3], m[m_off]];

    let worst_q = load_f64(&quality[eid0]).min(load_f64(&quality[eid1]));
    let q0 = tri_quality(coords, metric, &n_swap);
    let q1 = tri_quality(coords, metric, &m_swap);

    if q0.min(q1) > worst_q {
        store_f64(&quality[eid0], q0);
        store_f64(&quality[eid1], q1);

        // Drop (i, opposite) from both node-node rows.
        rows[i].nn[it].store(EMPTY, Ordering::Relaxed);
        let opp_idx = orig_index(rows, opposite_u, i as i64);
        rows[opposite_u].nn[opp_idx].store(EMPTY, Ordering::Relaxed);

        // Append each lateral to the other, in the extension region keyed
        // by i's slot in the lateral's original row.
        if idx_in_n == usize::MAX {
            idx_in_n = orig_index(rows, lateral_n_u, i as i64);
        }
        let mut pos = rows[lateral_n_u].deg + idx_in_n;
        if rows[lateral_n_u].nn[pos].load(Ordering::Relaxed) != EMPTY {
            pos += rows[lateral_n_u].deg;
        }
        debug_assert_eq!(rows[lateral_n_u].nn[pos].load(Ordering::Relaxed), EMPTY);
        rows[lateral_n_u].nn[pos].store(lateral_m, Ordering::Relaxed);

        if idx_in_m == usize::MAX {
            idx_in_m = orig_index(rows, lateral_m_u, i as i64);
        }
        let mut pos = rows[lateral_m_u].deg + idx_in_m;
        if rows[lateral_m_u].nn[pos].load(Ordering::Relaxed) != EMPTY {
            pos += rows[lateral_m_u].deg;
        }
        debug_assert_eq!(rows[lateral_m_u].nn[pos].load(Ordering::Relaxed), EMPTY);
        rows[lateral_m_u].nn[pos].store(lateral_n, Ordering::Relaxed);

        // Node-element updates, each in the gaining row's upper half or the
        // losing row's live half.
        ne_gain(rows, n_swap[0] as usize, eid0 as i64, eid1 as i64);
        ne_gain(rows, n_swap[1] as usize, eid1 as i64, eid0 as i64);
        ne_drop(rows, n_swap[2] as usize, eid1 as i64);
        ne_drop(rows, m_swap[1] as usize, eid0 as i64);

        // Rewrite the two element tuples.
        for k in 0..3 {
            en[3 * eid0 + k].store(n_swap[k], Ordering::Relaxed);
            en[3 * eid1 + k].store(m_swap[k], Ordering::Relaxed);
        }

        // Re-queue the four lateral edges.
        if (i as i64) < lateral_n {
            rows[i].marked[idx_of_n].store(1, Ordering::Relaxed);
        } else {
            rows[lateral_n_u].marked[idx_in_n].store(1, Ordering::Relaxed);
        }
        if (i as i64) < lateral_m {
            rows[i].marked[idx_of_m].store(1, Ordering::Relaxed);
        } else {
            rows[lateral_m_u].marked[idx_in_m].store(1, Ordering::Relaxed);
        }
        rows[min_opp_n].marked[idx_opp_n].store(1, Ordering::Relaxed);
        rows[min_opp_m].marked[idx_opp_m].store(1, Ordering::Relaxed);

        flips.fetch_add(1, Ordering::Relaxed);
    }

    // Processed, whether or not the flip was profitable.
    rows[i].marked[it].store(0, Ordering::Relaxed);
}

/// Vertex `v` gains `gained` next to its slot for `search` in the live half.
fn ne_gain(rows: &[VertexRow], v: usize, search: i64, gained: i64) {
    let half = rows[v].ne.len() / 2;
    for k in 0..half {
        if rows[v].ne[k].load(Ordering::Relaxed) == search {
            debug_assert_eq!(rows[v].ne[k + half].load(Ordering::Relaxed), EMPTY);
            rows[v].ne[k + half].store(gained, Ordering::Relaxed);
            return;
        }
    }
    debug_assert!(false, "ne_gain: element {search} not found at vertex {v}");
}

/// Vertex `v` loses element `lost`.
fn ne_drop(rows: &[VertexRow], v: usize, lost: i64) {
    let half = rows[v].ne.len() / 2;
    for k in 0..half {
        if rows[v].ne[k].load(Ordering::Relaxed) == lost {
            rows[v].ne[k].store(EMPTY, Ordering::Relaxed);
            return;
        }
    }
    debug_assert!(false, "ne_drop: element {lost} not found at vertex {v}");
}

fn tri_quality(coords: &[f64], metric: &[f64], n: &[i64; 3]) -> f64 {
    let a = n[0] as usize;
    let b = n[1] as usize;
    let c = n[2] as usize;
    geometry::lipnikov_2d(
        [
            &coords[2 * a..2 * a + 2],
            &coords[2 * b..2 * b + 2],
            &coords[2 * c..2 * c + 2],
        ],
        [
            &metric[3 * a..3 * a + 3],
            &metric[3 * b..3 * b + 3],
            &metric[3 * c..3 * c + 3],
        ],
    )
}
