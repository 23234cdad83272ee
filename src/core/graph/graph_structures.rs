use crate::core::data::sparse_structures::*;

///////////
// Enums //
///////////

/// How to merge duplicated edges when building a graph
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DuplicateEdges {
    /// Keep the largest weight
    Max,
    /// Sum up the weights (used for graph aggregation)
    Sum,
}

/////////////////////////////
// Sparse graph structures //
/////////////////////////////

/// Structure representation of an undirected sparse graph
///
/// ### Fields
///
/// * `adjacency` - Sparse CSR representation of the graph with `f64` as
///   weights. Every edge is stored in both directions; self loops (only
///   produced by graph aggregation) are stored once.
/// * `num_nodes` - Number of nodes represented in the graph.
#[derive(Clone, Debug)]
pub struct SparseGraph {
    adjacency: CompressedSparseData<f64>,
    num_nodes: usize,
}

impl SparseGraph {
    /// Generate an undirected graph from an edge list
    ///
    /// ### Params
    ///
    /// * `num_nodes` - Number of nodes in the graph.
    /// * `edges` - Tuples of `(from, to, weight)`; each undirected edge needs
    ///   to be given once (either direction).
    /// * `duplicates` - How to merge edges that appear multiple times.
    ///
    /// ### Returns
    ///
    /// Initialised self.
    pub fn from_edges(
        num_nodes: usize,
        edges: &[(usize, usize, f64)],
        duplicates: DuplicateEdges,
    ) -> Self {
        let mut directed: Vec<(usize, usize, f64)> = Vec::with_capacity(edges.len() * 2);
        for &(i, j, w) in edges {
            directed.push((i, j, w));
            if i != j {
                directed.push((j, i, w));
            }
        }
        directed.sort_unstable_by_key(|(r, c, _)| (*r, *c));

        let mut data = Vec::with_capacity(directed.len());
        let mut indices = Vec::with_capacity(directed.len());
        let mut indptr = vec![0_usize; num_nodes + 1];

        let mut last: Option<(usize, usize)> = None;
        for (r, c, w) in directed {
            if last == Some((r, c)) {
                if let Some(existing) = data.last_mut() {
                    match duplicates {
                        DuplicateEdges::Max => {
                            if w > *existing {
                                *existing = w
                            }
                        }
                        DuplicateEdges::Sum => *existing += w,
                    }
                }
                continue;
            }
            data.push(w);
            indices.push(c);
            indptr[r + 1] += 1;
            last = Some((r, c));
        }

        for i in 0..num_nodes {
            indptr[i + 1] += indptr[i];
        }

        Self {
            adjacency: CompressedSparseData {
                data,
                indices,
                indptr,
                cs_type: CompressedSparseFormat::Csr,
                shape: (num_nodes, num_nodes),
            },
            num_nodes,
        }
    }

    /// Helper function to get the neighbours and weights
    ///
    /// ### Params
    ///
    /// * `node` - Index of the node for which to get the neighbours
    ///
    /// ### Return
    ///
    /// Tuple of `(neighbour_indices, edge_weights)`
    #[inline]
    pub fn get_neighbours(&self, node: usize) -> (&[usize], &[f64]) {
        self.adjacency.outer(node)
    }

    /// Weighted degree of a node
    ///
    /// Self loops count twice, so that the degrees sum to `2m`.
    pub fn weighted_degree(&self, node: usize) -> f64 {
        let (neighbours, weights) = self.get_neighbours(node);
        neighbours
            .iter()
            .zip(weights.iter())
            .map(|(&j, &w)| if j == node { 2.0 * w } else { w })
            .sum()
    }

    /// Get total weight
    ///
    /// ### Returns
    ///
    /// The total edge weight `m` (each undirected edge counted once)
    pub fn total_weight(&self) -> f64 {
        (0..self.num_nodes)
            .map(|i| self.weighted_degree(i))
            .sum::<f64>()
            * 0.5
    }

    /// Expose the number of nodes
    pub fn get_node_number(&self) -> usize {
        self.num_nodes
    }

    /// Number of undirected edges (self loops included)
    pub fn get_edge_number(&self) -> usize {
        let loops = (0..self.num_nodes)
            .filter(|&i| self.get_neighbours(i).0.contains(&i))
            .count();
        (self.adjacency.nnz() - loops) / 2 + loops
    }

    /// Edge weight between two nodes (0 if not connected)
    pub fn edge_weight(&self, a: usize, b: usize) -> f64 {
        let (neighbours, weights) = self.get_neighbours(a);
        match neighbours.binary_search(&b) {
            Ok(pos) => weights[pos],
            Err(_) => 0.0,
        }
    }

    /// Iterate over the undirected edges as `(i, j, w)` with `i <= j`
    pub fn edges(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        (0..self.num_nodes).flat_map(move |i| {
            let (neighbours, weights) = self.get_neighbours(i);
            neighbours
                .iter()
                .zip(weights.iter())
                .filter(move |(&j, _)| j >= i)
                .map(move |(&j, &w)| (i, j, w))
        })
    }

    /// Check that every edge is present in both directions with equal weight
    pub fn is_symmetric(&self) -> bool {
        (0..self.num_nodes).all(|i| {
            let (neighbours, weights) = self.get_neighbours(i);
            neighbours
                .iter()
                .zip(weights.iter())
                .all(|(&j, &w)| (self.edge_weight(j, i) - w).abs() < 1e-12)
        })
    }

    /// Collapse nodes into super nodes
    ///
    /// Edge weights between super nodes are summed up; weights within one
    /// super node become a self loop.
    ///
    /// ### Params
    ///
    /// * `node_map` - Maps each node to its super node.
    /// * `n_super` - Number of super nodes.
    ///
    /// ### Returns
    ///
    /// The aggregated graph
    pub fn aggregate(&self, node_map: &[usize], n_super: usize) -> Self {
        let edges: Vec<(usize, usize, f64)> = self
            .edges()
            .map(|(i, j, w)| {
                let (a, b) = (node_map[i], node_map[j]);
                if a <= b {
                    (a, b, w)
                } else {
                    (b, a, w)
                }
            })
            .collect();

        Self::from_edges(n_super, &edges, DuplicateEdges::Sum)
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_edges_symmetric_and_dedup() {
        let graph = SparseGraph::from_edges(
            3,
            &[(0, 1, 0.5), (1, 0, 0.7), (1, 2, 0.2)],
            DuplicateEdges::Max,
        );
        assert!(graph.is_symmetric());
        assert_eq!(graph.get_edge_number(), 2);
        assert_eq!(graph.edge_weight(0, 1), 0.7);
        assert_eq!(graph.edge_weight(2, 1), 0.2);
        assert_eq!(graph.edge_weight(0, 2), 0.0);
        assert!((graph.total_weight() - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_aggregate_keeps_weight() {
        // two triangles joined by one edge
        let edges = vec![
            (0, 1, 1.0),
            (1, 2, 1.0),
            (0, 2, 1.0),
            (3, 4, 1.0),
            (4, 5, 1.0),
            (3, 5, 1.0),
            (2, 3, 0.5),
        ];
        let graph = SparseGraph::from_edges(6, &edges, DuplicateEdges::Max);
        let coarse = graph.aggregate(&[0, 0, 0, 1, 1, 1], 2);

        assert_eq!(coarse.get_node_number(), 2);
        assert_eq!(coarse.edge_weight(0, 0), 3.0);
        assert_eq!(coarse.edge_weight(0, 1), 0.5);
        assert!((coarse.total_weight() - graph.total_weight()).abs() < 1e-12);
        assert!((coarse.weighted_degree(0) - 6.5).abs() < 1e-12);
    }
}
