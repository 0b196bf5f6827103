//! Greedy graph colouring.
//!
//! Used to extract independent sets of mesh operations: element graphs in
//! the 3D swap and vertex stars in smoothing. First-fit over the natural
//! vertex order; two vertices sharing an edge never receive the same colour
//! and the palette never exceeds `max degree + 1`. No balance guarantee.

/// Colour an undirected graph given as per-vertex neighbour lists.
///
/// Returns one colour per vertex, colour 0 being the first assigned.
/// Isolated vertices (empty neighbour lists) all receive colour 0.
pub fn greedy(adjacency: &[Vec<usize>]) -> Vec<u32> {
    let n = adjacency.len();
    let mut colour = vec![u32::MAX; n];
    let mut used: Vec<bool> = Vec::new();

    for v in 0..n {
        let degree = adjacency[v].len();
        used.clear();
        used.resize(degree + 1, false);

        for &w in &adjacency[v] {
            let c = colour[w];
            if c != u32::MAX && (c as usize) <= degree {
                used[c as usize] = true;
            }
        }

        // First-fit: a free slot always exists within degree + 1 candidates.
        let c = used.iter().position(|&taken| !taken).unwrap();
        colour[v] = c as u32;
    }

    colour
}

/// Number of colours in a palette produced by [`greedy`].
pub fn palette_size(colour: &[u32]) -> usize {
    colour.iter().map(|&c| c as usize + 1).max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_proper(adjacency: &[Vec<usize>], colour: &[u32]) {
        for (v, row) in adjacency.iter().enumerate() {
            for &w in row {
                assert_ne!(colour[v], colour[w], "vertices {v} and {w} share a colour");
            }
        }
    }

    #[test]
    fn path_graph_uses_two_colours() {
        let adjacency = vec![vec![1], vec![0, 2], vec![1, 3], vec![2]];
        let colour = greedy(&adjacency);
        assert_proper(&adjacency, &colour);
        assert_eq!(palette_size(&colour), 2);
    }

    #[test]
    fn complete_graph_uses_n_colours() {
        let n = 5;
        let adjacency: Vec<Vec<usize>> = (0..n)
            .map(|v| (0..n).filter(|&w| w != v).collect())
            .collect();
        let colour = greedy(&adjacency);
        assert_proper(&adjacency, &colour);
        assert_eq!(palette_size(&colour), n);
    }

    #[test]
    fn empty_graph() {
        assert!(greedy(&[]).is_empty());
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn colouring_is_always_proper(edges in prop::collection::vec((0usize..30, 0usize..30), 0..120)) {
            let mut adjacency = vec![Vec::new(); 30];
            for (a, b) in edges {
                if a != b && !adjacency[a].contains(&b) {
                    adjacency[a].push(b);
                    adjacency[b].push(a);
                }
            }
            let colour = greedy(&adjacency);
            let max_degree = adjacency.iter().map(Vec::len).max().unwrap_or(0);
            prop_assert!(palette_size(&colour) <= max_degree + 1);
            for (v, row) in adjacency.iter().enumerate() {
                for &w in row {
                    prop_assert_ne!(colour[v], colour[w]);
                }
            }
        }
    }
}
