use serde::Serialize;

use crate::core::graph::community_detection::{louvain_sparse_graph, LouvainParams};
use crate::single_cell::sc_knn_snn::NeighbourGraph;

////////////////
// Structures //
////////////////

/// Cluster assignment of every cell
///
/// ### Fields
///
/// * `source` - Name of the embedding the graph was built on.
/// * `resolution` - Louvain resolution used.
/// * `labels` - Cluster per cell; dense from 0, cluster 0 is the largest.
/// * `n_clusters` - Number of clusters.
/// * `modularity` - Modularity of the final partition.
/// * `modularity_trace` - Modularity after every aggregation level.
#[derive(Clone, Debug, Serialize)]
pub struct ClusterAssignment {
    pub source: String,
    pub resolution: f64,
    pub labels: Vec<usize>,
    pub n_clusters: usize,
    pub modularity: f64,
    pub modularity_trace: Vec<f64>,
}

impl ClusterAssignment {
    /// Number of cells per cluster
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.n_clusters];
        for &l in &self.labels {
            sizes[l] += 1;
        }
        sizes
    }

    /// Cell indices of one cluster
    pub fn members(&self, cluster: usize) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, &l)| l == cluster)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Artifact id of a clustering at a given resolution
pub fn cluster_artifact_id(resolution: f64) -> String {
    format!("clusters_res{}", resolution)
}

////////////////////
// Main functions //
////////////////////

/// Cluster the cells on the SNN graph
///
/// ### Params
///
/// * `graph` - The neighbour graph.
/// * `params` - Louvain parameters (resolution, starts, levels, seed).
///
/// ### Returns
///
/// The `ClusterAssignment`.
pub fn cluster_cells(graph: &NeighbourGraph, params: &LouvainParams) -> ClusterAssignment {
    let res = louvain_sparse_graph(&graph.graph, params);

    let assignment = ClusterAssignment {
        source: graph.source.clone(),
        resolution: params.resolution,
        labels: res.labels,
        n_clusters: res.n_communities,
        modularity: res.modularity,
        modularity_trace: res.modularity_trace,
    };

    log::debug!(
        "Cluster sizes at resolution {}: {:?}",
        params.resolution,
        assignment.cluster_sizes()
    );

    assignment
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::single_cell::sc_knn_snn::{build_neighbour_graph, NeighbourGraphParams};
    use faer::Mat;
    use rand::prelude::*;
    use rand_distr::Normal;

    fn three_blobs() -> Mat<f64> {
        let mut rng = StdRng::seed_from_u64(123);
        let noise = Normal::new(0.0, 1.0).unwrap();
        Mat::from_fn(90, 5, |i, j| {
            let centre = if j == 0 { (i / 30) as f64 * 40.0 } else { 0.0 };
            centre + noise.sample(&mut rng)
        })
    }

    #[test]
    fn test_three_blobs_clustered() {
        let emb = three_blobs();
        let graph = build_neighbour_graph(emb.as_ref(), "pca", &NeighbourGraphParams {
            k: 10,
            ..Default::default()
        });
        let res = cluster_cells(&graph, &LouvainParams::default());

        assert_eq!(res.source, "pca");
        assert_eq!(res.n_clusters, 3);
        assert_eq!(res.cluster_sizes(), vec![30, 30, 30]);
        for blob in 0..3 {
            let first = res.labels[blob * 30];
            assert!((blob * 30..(blob + 1) * 30).all(|i| res.labels[i] == first));
        }
        assert_eq!(res.members(res.labels[0]).len(), 30);
        for w in res.modularity_trace.windows(2) {
            assert!(w[1] >= w[0]);
        }
    }

    #[test]
    fn test_artifact_id() {
        assert_eq!(cluster_artifact_id(0.6), "clusters_res0.6");
        assert_eq!(cluster_artifact_id(1.0), "clusters_res1");
    }
}
