use faer::MatRef;
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::core::graph::graph_structures::*;
use crate::core::graph::knn::*;

///////////
// Enums //
///////////

/// SNN similarity method
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SnnSimilarityMethod {
    /// Jaccard index of the two neighbourhoods (self included)
    #[default]
    Jaccard,
    /// Rank-weighted variant based on the best shared neighbour rank
    Rank,
}

/// Helper function to get the type of sNN similarity
///
/// ### Params
///
/// * `s` - Type of SNN similarity to use
///
/// ### Returns
///
/// Option of the SnnSimilarityMethod
pub fn get_snn_similiarity_method(s: &str) -> Option<SnnSimilarityMethod> {
    match s.to_lowercase().as_str() {
        "jaccard" => Some(SnnSimilarityMethod::Jaccard),
        "rank" => Some(SnnSimilarityMethod::Rank),
        _ => None,
    }
}

////////////
// Params //
////////////

/// Parameters for the neighbour graph generation
///
/// ### Fields
///
/// * `k` - Number of neighbours.
/// * `knn_method` - Exact or approximate (HNSW) kNN search.
/// * `similarity` - Which SNN edge weight to use.
/// * `prune_threshold` - Edges with weights below this are dropped.
/// * `seed` - Seed for the approximate search.
#[derive(Clone, Debug)]
pub struct NeighbourGraphParams {
    pub k: usize,
    pub knn_method: KnnSearch,
    pub similarity: SnnSimilarityMethod,
    pub prune_threshold: f64,
    pub seed: u64,
}

impl Default for NeighbourGraphParams {
    fn default() -> Self {
        Self {
            k: 20,
            knn_method: KnnSearch::Exact,
            similarity: SnnSimilarityMethod::Jaccard,
            prune_threshold: 1.0 / 15.0,
            seed: 42,
        }
    }
}

////////////////
// Structures //
////////////////

/// Shared nearest neighbour graph over cells
///
/// ### Fields
///
/// * `source` - Name of the embedding the graph was built from.
/// * `k` - Number of neighbours used (after capping).
/// * `similarity` - SNN similarity used for the weights.
/// * `knn` - The underlying kNN lists, nearest first.
/// * `graph` - Symmetric graph with weights in `[0, 1]`.
#[derive(Clone, Debug)]
pub struct NeighbourGraph {
    pub source: String,
    pub k: usize,
    pub similarity: SnnSimilarityMethod,
    pub knn: Vec<Vec<usize>>,
    pub graph: SparseGraph,
}

/////////////
// Helpers //
/////////////

/// SNN weight between two cells
///
/// ### Params
///
/// * `knn` - kNN lists (nearest first).
/// * `i` - First cell.
/// * `j` - Second cell.
/// * `method` - Similarity method.
///
/// ### Returns
///
/// The weight in `[0, 1]`.
pub fn snn_weight(knn: &[Vec<usize>], i: usize, j: usize, method: SnnSimilarityMethod) -> f64 {
    match method {
        SnnSimilarityMethod::Jaccard => {
            let neighbours_i: FxHashSet<usize> =
                knn[i].iter().copied().chain(std::iter::once(i)).collect();
            let neighbours_j: FxHashSet<usize> =
                knn[j].iter().copied().chain(std::iter::once(j)).collect();

            let intersection = neighbours_i.intersection(&neighbours_j).count() as f64;
            let union = (neighbours_i.len() + neighbours_j.len()) as f64 - intersection;
            if union > 0.0 {
                intersection / union
            } else {
                0.0
            }
        }
        SnnSimilarityMethod::Rank => {
            let k = knn[i].len().max(knn[j].len());
            if k == 0 {
                return 0.0;
            }

            let mut ranks_i = FxHashMap::default();
            ranks_i.insert(i, 0_usize);
            for (rank, &neighbour) in knn[i].iter().enumerate() {
                ranks_i.insert(neighbour, rank + 1);
            }

            let mut min_combined_rank = 2 * k;
            let self_and_knn_j = std::iter::once(j).chain(knn[j].iter().copied());
            for (rank_j, neighbour) in self_and_knn_j.enumerate() {
                if let Some(&rank_i) = ranks_i.get(&neighbour) {
                    min_combined_rank = min_combined_rank.min(rank_i + rank_j);
                }
            }

            let preliminary = k as f64 - min_combined_rank as f64 / 2.0;
            preliminary.max(1e-6) / k as f64
        }
    }
}

/// Generate an sNN graph based on the kNN graph
///
/// Only kNN pairs are compared; duplicated edges keep the maximum weight.
///
/// ### Params
///
/// * `knn` - kNN lists (nearest first).
/// * `pruning` - Edges with weights below this are dropped.
/// * `method` - Which similarity method to use.
///
/// ### Returns
///
/// The symmetric `SparseGraph`.
pub fn generate_snn_graph(
    knn: &[Vec<usize>],
    pruning: f64,
    method: SnnSimilarityMethod,
) -> SparseGraph {
    let edges: Vec<(usize, usize, f64)> = (0..knn.len())
        .into_par_iter()
        .flat_map(|i| {
            knn[i]
                .iter()
                .filter_map(|&j| {
                    let weight = snn_weight(knn, i, j, method);
                    if weight >= pruning {
                        let (a, b) = if i < j { (i, j) } else { (j, i) };
                        Some((a, b, weight))
                    } else {
                        None
                    }
                })
                .collect::<Vec<_>>()
        })
        .collect();

    SparseGraph::from_edges(knn.len(), &edges, DuplicateEdges::Max)
}

////////////////////
// Main functions //
////////////////////

/// Build the SNN neighbour graph from an embedding
///
/// ### Params
///
/// * `embedding` - Cells x dimensions.
/// * `source` - Name of the embedding (for provenance).
/// * `params` - Neighbour graph parameters.
///
/// ### Returns
///
/// The `NeighbourGraph`.
pub fn build_neighbour_graph(
    embedding: MatRef<f64>,
    source: &str,
    params: &NeighbourGraphParams,
) -> NeighbourGraph {
    let start = Instant::now();

    let knn = generate_knn(embedding, params.k, params.knn_method, params.seed);
    let k = knn.first().map_or(0, |n| n.len());
    let graph = generate_snn_graph(&knn, params.prune_threshold, params.similarity);

    log::info!(
        "SNN graph from '{}': {} nodes, {} edges (k = {}, {:?}) in {:.2?}",
        source,
        graph.get_node_number(),
        graph.get_edge_number(),
        k,
        params.similarity,
        start.elapsed()
    );

    NeighbourGraph {
        source: source.to_string(),
        k,
        similarity: params.similarity,
        knn,
        graph,
    }
}

///////////
// Tests //
///////////
