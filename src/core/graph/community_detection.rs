use rand::prelude::*;
use std::time::Instant;

use crate::core::graph::graph_structures::*;

/// Minimum modularity gain for a node move or a new level to count
const MOVE_EPSILON: f64 = 1e-10;

////////////
// Params //
////////////

/// Parameters for the multi-level Louvain clustering
///
/// ### Fields
///
/// * `resolution` - Resolution parameter; higher values yield more clusters.
/// * `n_starts` - Number of independently seeded runs. The partition with
///   the highest modularity is returned.
/// * `max_levels` - Maximum number of aggregation levels.
/// * `max_passes` - Maximum number of local moving sweeps per level.
/// * `seed` - Seed for the node order shuffling.
#[derive(Clone, Debug)]
pub struct LouvainParams {
    pub resolution: f64,
    pub n_starts: usize,
    pub max_levels: usize,
    pub max_passes: usize,
    pub seed: u64,
}

impl Default for LouvainParams {
    fn default() -> Self {
        Self {
            resolution: 1.0,
            n_starts: 1,
            max_levels: 10,
            max_passes: 100,
            seed: 42,
        }
    }
}

////////////////
// Structures //
////////////////

/// Result of the Louvain clustering
///
/// ### Fields
///
/// * `labels` - Community per node, dense from 0 and ordered by descending
///   community size.
/// * `n_communities` - Number of communities.
/// * `modularity` - Final modularity of the partition.
/// * `modularity_trace` - Modularity after every accepted level, starting
///   with the singleton partition. Non-decreasing.
#[derive(Clone, Debug)]
pub struct LouvainResult {
    pub labels: Vec<usize>,
    pub n_communities: usize,
    pub modularity: f64,
    pub modularity_trace: Vec<f64>,
}

/////////////
// Helpers //
/////////////

/// Calculate the modularity of a partition
///
/// ### Params
///
/// * `graph` - The undirected graph.
/// * `labels` - Community of each node.
/// * `resolution` - Resolution parameter.
///
/// ### Returns
///
/// `Q = sum_c [in_c / 2m - resolution * (tot_c / 2m)^2]`; 0 for graphs
/// without edges.
pub fn modularity(graph: &SparseGraph, labels: &[usize], resolution: f64) -> f64 {
    let n = graph.get_node_number();
    let two_m = 2.0 * graph.total_weight();
    if two_m <= 0.0 {
        return 0.0;
    }

    let n_comms = labels.iter().copied().max().map_or(0, |m| m + 1);
    let mut internal = vec![0.0_f64; n_comms];
    let mut totals = vec![0.0_f64; n_comms];

    for i in 0..n {
        let c = labels[i];
        totals[c] += graph.weighted_degree(i);
        let (neighbours, weights) = graph.get_neighbours(i);
        for (&j, &w) in neighbours.iter().zip(weights.iter()) {
            if labels[j] == c {
                internal[c] += if j == i { 2.0 * w } else { w };
            }
        }
    }

    internal
        .iter()
        .zip(totals.iter())
        .map(|(&inn, &tot)| inn / two_m - resolution * (tot / two_m).powi(2))
        .sum()
}

/// Renumber labels densely by descending community size
///
/// Ties are broken by the smallest node index in the community.
///
/// ### Params
///
/// * `labels` - Arbitrary community labels.
///
/// ### Returns
///
/// Tuple of `(new_labels, n_communities)`.
pub fn relabel_by_size(labels: &[usize]) -> (Vec<usize>, usize) {
    let n_labels = labels.iter().copied().max().map_or(0, |m| m + 1);
    let mut sizes = vec![0_usize; n_labels];
    let mut first_member = vec![usize::MAX; n_labels];

    for (i, &l) in labels.iter().enumerate() {
        sizes[l] += 1;
        if first_member[l] == usize::MAX {
            first_member[l] = i;
        }
    }

    let mut order: Vec<usize> = (0..n_labels).filter(|&l| sizes[l] > 0).collect();
    order.sort_by(|&a, &b| {
        sizes[b]
            .cmp(&sizes[a])
            .then(first_member[a].cmp(&first_member[b]))
    });

    let mut remap = vec![usize::MAX; n_labels];
    for (new, &old) in order.iter().enumerate() {
        remap[old] = new;
    }

    (labels.iter().map(|&l| remap[l]).collect(), order.len())
}

/// Compact labels to `0..n` in order of first appearance
fn compact_labels(labels: &[usize]) -> (Vec<usize>, usize) {
    let mut comm_map = vec![usize::MAX; labels.len()];
    let mut label = 0;
    let res = labels
        .iter()
        .map(|&c| {
            if comm_map[c] == usize::MAX {
                comm_map[c] = label;
                label += 1;
            }
            comm_map[c]
        })
        .collect();
    (res, label)
}

/// Local moving phase of the Louvain algorithm
///
/// Nodes are visited in a shuffled order per sweep. A node is removed from
/// its community and moved to the neighbouring community with the largest
/// gain `k_i,in(C) - resolution * k_i * tot(C) / 2m` if that beats staying
/// by more than `MOVE_EPSILON`. An empty community (gain 0) is a candidate
/// as well, so a weakly attached node can split off on its own. Equal gains
/// resolve to the lowest community id, then to the empty community.
///
/// ### Returns
///
/// Tuple of `(communities, any_node_moved)`.
fn local_moving(
    graph: &SparseGraph,
    resolution: f64,
    max_passes: usize,
    rng: &mut StdRng,
) -> (Vec<usize>, bool) {
    let n = graph.get_node_number();
    let two_m = 2.0 * graph.total_weight();
    let mut communities: Vec<usize> = (0..n).collect();
    if two_m <= 0.0 {
        return (communities, false);
    }
    let res_over_two_m = resolution / two_m;

    let degrees: Vec<f64> = (0..n).map(|i| graph.weighted_degree(i)).collect();
    let mut comm_degree_sums = degrees.clone();
    let mut comm_sizes = vec![1_usize; n];
    let mut empty_comms: Vec<usize> = Vec::new();
    let mut neighbour_weights = vec![0.0_f64; n];
    let mut comm_active = vec![false; n];
    let mut active_comms: Vec<usize> = Vec::with_capacity(256);
    let mut node_order: Vec<usize> = (0..n).collect();
    let mut any_move = false;

    for _ in 0..max_passes {
        let mut move_count = 0;
        node_order.shuffle(rng);

        for &node in &node_order {
            let current_comm = communities[node];
            let k_i = degrees[node];
            let k_i_scaled = k_i * res_over_two_m;

            comm_degree_sums[current_comm] -= k_i;
            comm_sizes[current_comm] -= 1;

            let (neighbours, weights) = graph.get_neighbours(node);
            for (&neighbour, &weight) in neighbours.iter().zip(weights.iter()) {
                if neighbour == node {
                    continue;
                }
                let comm = communities[neighbour];
                if !comm_active[comm] {
                    comm_active[comm] = true;
                    active_comms.push(comm);
                }
                neighbour_weights[comm] += weight;
            }

            let stay_gain =
                neighbour_weights[current_comm] - k_i_scaled * comm_degree_sums[current_comm];

            active_comms.sort_unstable();
            let mut best_comm = current_comm;
            let mut best_gain = f64::NEG_INFINITY;
            for &comm in &active_comms {
                if comm != current_comm {
                    let gain = neighbour_weights[comm] - k_i_scaled * comm_degree_sums[comm];
                    if gain > best_gain {
                        best_gain = gain;
                        best_comm = comm;
                    }
                }
            }
            // a node already alone gains nothing from an empty community
            if comm_sizes[current_comm] > 0 {
                if let Some(&empty) = empty_comms.last() {
                    if 0.0 > best_gain {
                        best_gain = 0.0;
                        best_comm = empty;
                    }
                }
            }

            for &comm in &active_comms {
                neighbour_weights[comm] = 0.0;
                comm_active[comm] = false;
            }
            active_comms.clear();

            if best_comm != current_comm && best_gain > stay_gain + MOVE_EPSILON {
                if comm_sizes[best_comm] == 0 {
                    empty_comms.pop();
                }
                if comm_sizes[current_comm] == 0 {
                    empty_comms.push(current_comm);
                }
                communities[node] = best_comm;
                comm_degree_sums[best_comm] += k_i;
                comm_sizes[best_comm] += 1;
                move_count += 1;
            } else {
                comm_degree_sums[current_comm] += k_i;
                comm_sizes[current_comm] += 1;
            }
        }

        if move_count == 0 {
            break;
        }
        any_move = true;
    }

    (communities, any_move)
}

/// One seeded multi-level Louvain run
fn louvain_single_start(graph: &SparseGraph, params: &LouvainParams, seed: u64) -> LouvainResult {
    let n = graph.get_node_number();
    let mut rng = StdRng::seed_from_u64(seed);

    let mut membership: Vec<usize> = (0..n).collect();
    let mut current_q = modularity(graph, &membership, params.resolution);
    let mut trace = vec![current_q];
    let mut level_graph = graph.clone();

    for level in 0..params.max_levels {
        let (comms, moved) =
            local_moving(&level_graph, params.resolution, params.max_passes, &mut rng);
        if !moved {
            break;
        }
        let (comms, n_comms) = compact_labels(&comms);

        let candidate: Vec<usize> = membership.iter().map(|&m| comms[m]).collect();
        let candidate_q = modularity(graph, &candidate, params.resolution);

        if candidate_q <= current_q + MOVE_EPSILON {
            log::debug!(
                "Louvain level {} does not increase modularity ({:.6} vs {:.6}); stopping",
                level,
                candidate_q,
                current_q
            );
            break;
        }

        membership = candidate;
        current_q = candidate_q;
        trace.push(current_q);

        log::debug!(
            "Louvain level {}: {} communities, modularity {:.6}",
            level,
            n_comms,
            current_q
        );

        if n_comms == level_graph.get_node_number() {
            break;
        }
        level_graph = level_graph.aggregate(&comms, n_comms);
    }

    let (labels, n_communities) = relabel_by_size(&membership);

    LouvainResult {
        labels,
        n_communities,
        modularity: current_q,
        modularity_trace: trace,
    }
}

////////////////////
// Main functions //
////////////////////

/// Multi-level Louvain community detection
///
/// Runs `params.n_starts` independently seeded starts (seeds `seed`,
/// `seed + 1`, ...) and keeps the one with the highest modularity; on equal
/// modularity the earlier start wins. Nodes without edges end up as
/// singleton communities.
///
/// ### Params
///
/// * `graph` - Undirected weighted graph.
/// * `params` - The Louvain parameters.
///
/// ### Returns
///
/// The `LouvainResult` of the best start.
pub fn louvain_sparse_graph(graph: &SparseGraph, params: &LouvainParams) -> LouvainResult {
    let start = Instant::now();
    let n_starts = params.n_starts.max(1);

    let mut best: Option<LouvainResult> = None;
    for s in 0..n_starts {
        let res = louvain_single_start(graph, params, params.seed.wrapping_add(s as u64));
        let better = match &best {
            Some(b) => res.modularity > b.modularity,
            None => true,
        };
        if better {
            best = Some(res);
        }
    }

    let best = best.unwrap_or(LouvainResult {
        labels: Vec::new(),
        n_communities: 0,
        modularity: 0.0,
        modularity_trace: vec![0.0],
    });

    log::info!(
        "Louvain clustering: {} communities, modularity {:.4} ({} start(s)) in {:.2?}",
        best.n_communities,
        best.modularity,
        n_starts,
        start.elapsed()
    );

    best
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    fn two_cliques(size: usize, bridge: f64) -> SparseGraph {
        let mut edges = Vec::new();
        for offset in [0, size] {
            for i in 0..size {
                for j in (i + 1)..size {
                    edges.push((offset + i, offset + j, 1.0));
                }
            }
        }
        edges.push((size - 1, size, bridge));
        SparseGraph::from_edges(2 * size, &edges, DuplicateEdges::Max)
    }

    #[test]
    fn test_two_cliques_recovered() {
        let graph = two_cliques(6, 0.1);
        let res = louvain_sparse_graph(&graph, &LouvainParams::default());

        assert_eq!(res.n_communities, 2);
        assert!(res.labels[..6].iter().all(|&l| l == res.labels[0]));
        assert!(res.labels[6..].iter().all(|&l| l == res.labels[6]));
        assert_ne!(res.labels[0], res.labels[6]);
        // equal size -> the community holding node 0 comes first
        assert_eq!(res.labels[0], 0);
    }

    #[test]
    fn test_modularity_trace_non_decreasing() {
        let graph = two_cliques(8, 0.5);
        let params = LouvainParams {
            n_starts: 3,
            ..Default::default()
        };
        let res = louvain_sparse_graph(&graph, &params);

        for w in res.modularity_trace.windows(2) {
            assert!(w[1] >= w[0]);
        }
        let last = *res.modularity_trace.last().unwrap();
        assert!((last - res.modularity).abs() < 1e-12);
        assert!((modularity(&graph, &res.labels, 1.0) - res.modularity).abs() < 1e-9);
    }

    #[test]
    fn test_no_edges_gives_singletons() {
        let graph = SparseGraph::from_edges(4, &[], DuplicateEdges::Max);
        let res = louvain_sparse_graph(&graph, &LouvainParams::default());

        assert_eq!(res.n_communities, 4);
        assert_eq!(res.labels, vec![0, 1, 2, 3]);
        assert_eq!(res.modularity, 0.0);
    }

    #[test]
    fn test_weakly_attached_node_splits_off() {
        // node 10 hangs on node 0 with a tiny weight; at resolution 2.2 its
        // gain for the full clique is negative
        let mut edges = Vec::new();
        for offset in [0, 5] {
            for i in 0..5 {
                for j in (i + 1)..5 {
                    edges.push((offset + i, offset + j, 1.0));
                }
            }
        }
        edges.push((0, 10, 0.1));
        let graph = SparseGraph::from_edges(11, &edges, DuplicateEdges::Max);

        for seed in 0..5 {
            let mut rng = StdRng::seed_from_u64(seed);
            let (comms, moved) = local_moving(&graph, 2.2, 100, &mut rng);
            assert!(moved);
            assert!(comms[..5].iter().all(|&c| c == comms[0]));
            assert!(comms[5..10].iter().all(|&c| c == comms[5]));
            assert!(comms[..10].iter().all(|&c| c != comms[10]), "seed {}", seed);
        }

        let params = LouvainParams {
            resolution: 2.2,
            ..Default::default()
        };
        let res = louvain_sparse_graph(&graph, &params);
        assert_eq!(res.n_communities, 3);
        assert_ne!(res.labels[10], res.labels[0]);
    }

    #[test]
    fn test_relabel_by_size() {
        let (labels, n) = relabel_by_size(&[5, 2, 2, 5, 2, 7]);
        assert_eq!(n, 3);
        assert_eq!(labels, vec![1, 0, 0, 1, 0, 2]);
    }

    #[test]
    fn test_deterministic_with_seed() {
        let graph = two_cliques(10, 1.0);
        let params = LouvainParams::default();
        let a = louvain_sparse_graph(&graph, &params);
        let b = louvain_sparse_graph(&graph, &params);
        assert_eq!(a.labels, b.labels);
    }
}
