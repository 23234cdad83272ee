use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::core::base::stats::{bonferroni, rank_sparse_column, wilcoxon_z, z_score_to_pval};
use crate::core::data::sparse_structures::*;
use crate::error::{PipelineWarning, Result};
use crate::single_cell::clustering::ClusterAssignment;

////////////
// Params //
////////////

/// Parameters for the marker gene detection
///
/// ### Fields
///
/// * `de_min_pct` - Minimum fraction of expressing cells.
/// * `de_logfc_threshold` - Minimum absolute log2 fold change.
/// * `only_positive` - Only report genes higher in the cluster.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeParams {
    pub de_min_pct: f64,
    pub de_logfc_threshold: f64,
    pub only_positive: bool,
}

impl Default for DeParams {
    fn default() -> Self {
        Self {
            de_min_pct: 0.25,
            de_logfc_threshold: 1.2_f64.ln(),
            only_positive: true,
        }
    }
}

////////////////
// Structures //
////////////////

/// One marker gene of one cluster
#[derive(Clone, Debug, Serialize)]
pub struct MarkerGene {
    pub cluster: usize,
    pub gene: String,
    #[serde(skip)]
    pub gene_index: usize,
    #[serde(rename = "logFC")]
    pub log_fc: f64,
    #[serde(rename = "pct.in")]
    pub pct_in: f64,
    #[serde(rename = "pct.out")]
    pub pct_out: f64,
    #[serde(rename = "stat")]
    pub statistic: f64,
    pub p_val: f64,
    pub p_val_adj: f64,
}

/// Marker genes of all clusters, cluster by cluster
#[derive(Clone, Debug, Default)]
pub struct MarkerTable {
    pub markers: Vec<MarkerGene>,
    pub warnings: Vec<PipelineWarning>,
}

impl MarkerTable {
    /// Markers of one cluster, best first
    pub fn cluster(&self, cluster: usize) -> Vec<&MarkerGene> {
        self.markers.iter().filter(|m| m.cluster == cluster).collect()
    }
}

/// Per cluster summaries of one gene
struct GeneClusterStats {
    rank_sum: Vec<f64>,
    n_expressed: Vec<usize>,
    sum_expm1: Vec<f64>,
}

/////////////
// Helpers //
/////////////

/// Accumulate the rank sums, detection counts and linear-scale sums per
/// cluster for one gene
fn gene_cluster_stats(
    indices: &[usize],
    values: &[f64],
    labels: &[usize],
    cluster_sizes: &[usize],
    ranks: &[f64],
    zero_rank: f64,
) -> GeneClusterStats {
    let n_clusters = cluster_sizes.len();
    let mut rank_sum = vec![0.0; n_clusters];
    let mut n_expressed = vec![0_usize; n_clusters];
    let mut sum_expm1 = vec![0.0; n_clusters];

    for ((&cell, &v), &r) in indices.iter().zip(values.iter()).zip(ranks.iter()) {
        let c = labels[cell];
        rank_sum[c] += r;
        n_expressed[c] += 1;
        sum_expm1[c] += v.exp_m1();
    }
    for c in 0..n_clusters {
        rank_sum[c] += zero_rank * (cluster_sizes[c] - n_expressed[c]) as f64;
    }

    GeneClusterStats {
        rank_sum,
        n_expressed,
        sum_expm1,
    }
}

////////////////////
// Main functions //
////////////////////

/// Find marker genes of every cluster (one cluster versus the rest)
///
/// Wilcoxon rank-sum test per gene and cluster on the log-normalised data
/// with zeros tied, normal approximation with tie and continuity
/// correction, Bonferroni-adjusted p-values over all genes. Fold changes are
/// computed on the linear scale: `log2(mean(expm1(x_in)) + 1) -
/// log2(mean(expm1(x_out)) + 1)`.
///
/// ### Params
///
/// * `normalised` - Log-normalised cells x genes (CSR).
/// * `genes` - Gene identifiers.
/// * `assignment` - The cluster assignment.
/// * `params` - The `DeParams`.
///
/// ### Returns
///
/// The `MarkerTable`, each cluster sorted by p-value, then by absolute log
/// fold change (descending), then by gene index.
pub fn find_markers(
    normalised: &CompressedSparseData<f64>,
    genes: &[String],
    assignment: &ClusterAssignment,
    params: &DeParams,
) -> Result<MarkerTable> {
    let start = Instant::now();
    let (n_cells, n_genes) = normalised.shape;
    crate::ensure_dims!("cluster labels vs. cells", n_cells, assignment.labels.len());
    crate::ensure_dims!("gene ids vs. columns", n_genes, genes.len());

    let labels = &assignment.labels;
    let cluster_sizes = assignment.cluster_sizes();

    let mut warnings = Vec::new();
    let testable: Vec<bool> = cluster_sizes
        .iter()
        .enumerate()
        .map(|(c, &size)| {
            let reason = if size == 0 {
                Some("no member cells")
            } else if size == n_cells {
                Some("no cells outside the cluster")
            } else {
                None
            };
            if let Some(reason) = reason {
                let warning = PipelineWarning::EmptyCluster {
                    cluster: c,
                    reason: reason.to_string(),
                };
                log::warn!("{}", warning);
                warnings.push(warning);
            }
            reason.is_none()
        })
        .collect();

    let csc = normalised.drop_stored(|v| v == 0.0).transform_format();

    let mut markers: Vec<MarkerGene> = (0..n_genes)
        .into_par_iter()
        .flat_map_iter(|g| {
            let (indices, values) = csc.outer(g);
            let sparse_ranks = rank_sparse_column(values, n_cells);
            let stats = gene_cluster_stats(
                indices,
                values,
                labels,
                &cluster_sizes,
                &sparse_ranks.ranks,
                sparse_ranks.zero_rank,
            );
            let total_expressed = values.len();
            let total_expm1: f64 = stats.sum_expm1.iter().sum();

            let mut res = Vec::new();
            for (c, &size) in cluster_sizes.iter().enumerate() {
                if !testable[c] {
                    continue;
                }
                let n_in = size as f64;
                let n_out = (n_cells - size) as f64;

                let pct_in = stats.n_expressed[c] as f64 / n_in;
                let pct_out = (total_expressed - stats.n_expressed[c]) as f64 / n_out;
                let min_pct_ok = if params.only_positive {
                    pct_in >= params.de_min_pct
                } else {
                    pct_in.max(pct_out) >= params.de_min_pct
                };
                if !min_pct_ok {
                    continue;
                }

                let mean_in = stats.sum_expm1[c] / n_in;
                let mean_out = (total_expm1 - stats.sum_expm1[c]) / n_out;
                let log_fc = (mean_in + 1.0).log2() - (mean_out + 1.0).log2();
                if log_fc.abs() < params.de_logfc_threshold {
                    continue;
                }
                if params.only_positive && log_fc <= 0.0 {
                    continue;
                }

                let statistic = wilcoxon_z(
                    stats.rank_sum[c],
                    size,
                    n_cells - size,
                    sparse_ranks.tie_sum,
                );
                let p_val = z_score_to_pval(statistic);

                res.push(MarkerGene {
                    cluster: c,
                    gene: genes[g].clone(),
                    gene_index: g,
                    log_fc,
                    pct_in,
                    pct_out,
                    statistic,
                    p_val,
                    p_val_adj: bonferroni(p_val, n_genes),
                });
            }
            res
        })
        .collect();

    markers.sort_by(|a, b| {
        a.cluster
            .cmp(&b.cluster)
            .then(a.p_val.total_cmp(&b.p_val))
            .then(b.log_fc.abs().total_cmp(&a.log_fc.abs()))
            .then(a.gene_index.cmp(&b.gene_index))
    });

    log::info!(
        "Marker detection: {} markers over {} clusters in {:.2?}",
        markers.len(),
        assignment.n_clusters,
        start.elapsed()
    );

    Ok(MarkerTable { markers, warnings })
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn assignment(labels: Vec<usize>, n_clusters: usize) -> ClusterAssignment {
        ClusterAssignment {
            source: "pca".to_string(),
            resolution: 1.0,
            labels,
            n_clusters,
            modularity: 0.0,
            modularity_trace: vec![0.0],
        }
    }

    fn gene_names(n: usize) -> Vec<String> {
        (0..n).map(|g| format!("g{}", g)).collect()
    }

    #[test]
    fn test_cluster_specific_marker() {
        // gene 0 only in cluster 0, gene 1 everywhere, gene 2 only in cluster 1
        let rows: Vec<Vec<f64>> = (0..20)
            .map(|i| {
                let in_a = i < 10;
                vec![
                    if in_a { 2.0 + (i % 3) as f64 * 0.1 } else { 0.0 },
                    1.0 + (i % 4) as f64 * 0.05,
                    if in_a { 0.0 } else { 1.5 },
                ]
            })
            .collect();
        let mat = CompressedSparseData::from_dense_rows(&rows, 3, 0.0).unwrap();
        let labels: Vec<usize> = (0..20).map(|i| usize::from(i >= 10)).collect();

        let res = find_markers(&mat, &gene_names(3), &assignment(labels, 2), &DeParams::default())
            .unwrap();

        let c0 = res.cluster(0);
        assert_eq!(c0.len(), 1);
        let top = c0[0];
        assert_eq!(top.gene, "g0");
        assert_eq!(top.pct_in, 1.0);
        assert_eq!(top.pct_out, 0.0);
        assert!(top.log_fc > 0.0);
        assert!(top.statistic > 0.0);
        assert!(top.p_val < 1e-3);
        assert_relative_eq!(top.p_val_adj, (top.p_val * 3.0).min(1.0));

        let c1 = res.cluster(1);
        assert_eq!(c1.len(), 1);
        assert_eq!(c1[0].gene, "g2");
        assert!(res.warnings.is_empty());
    }

    #[test]
    fn test_statistic_matches_hand_computation() {
        // one gene, cluster 0 = {3, 4, 5}, cluster 1 = {0, 0, 1}
        let rows: Vec<Vec<f64>> = [3.0, 4.0, 5.0, 0.0, 0.0, 1.0]
            .iter()
            .map(|&v| vec![v])
            .collect();
        let mat = CompressedSparseData::from_dense_rows(&rows, 1, 0.0).unwrap();
        let params = DeParams {
            de_min_pct: 0.0,
            de_logfc_threshold: 0.0,
            only_positive: false,
        };
        let res =
            find_markers(&mat, &gene_names(1), &assignment(vec![0, 0, 0, 1, 1, 1], 2), &params)
                .unwrap();

        // ranks: zeros 1.5, 1.5; 1 -> 3; 3, 4, 5 -> 4, 5, 6; R0 = 15, ties 6
        let expected_z = wilcoxon_z(15.0, 3, 3, 6.0);
        let m0 = &res.cluster(0)[0];
        assert_relative_eq!(m0.statistic, expected_z, epsilon = 1e-12);
        let m1 = &res.cluster(1)[0];
        assert_relative_eq!(m1.statistic, -expected_z, epsilon = 1e-12);
        assert!(m1.log_fc < 0.0);
    }

    #[test]
    fn test_stored_zeroes_are_not_expressed() {
        // g0 stored as explicit 0.0 in cells outside cluster 0
        let dense: Vec<Vec<f64>> = (0..10)
            .map(|i| vec![if i < 5 { 2.0 } else { 0.0 }, 1.0])
            .collect();
        let implicit = CompressedSparseData::from_dense_rows(&dense, 2, 0.0).unwrap();
        let explicit = CompressedSparseData::from_dense_rows(&dense, 2, -1.0).unwrap();
        assert_eq!(explicit.nnz(), 20);

        let labels: Vec<usize> = (0..10).map(|i| usize::from(i >= 5)).collect();
        let params = DeParams {
            de_min_pct: 0.0,
            ..Default::default()
        };
        let a = find_markers(&implicit, &gene_names(2), &assignment(labels.clone(), 2), &params)
            .unwrap();
        let b = find_markers(&explicit, &gene_names(2), &assignment(labels, 2), &params).unwrap();

        let hit = b.cluster(0).into_iter().find(|m| m.gene == "g0").unwrap();
        assert_eq!(hit.pct_in, 1.0);
        assert_eq!(hit.pct_out, 0.0);
        let reference = a.cluster(0).into_iter().find(|m| m.gene == "g0").unwrap();
        assert_relative_eq!(hit.statistic, reference.statistic, epsilon = 1e-12);
        assert_relative_eq!(hit.p_val, reference.p_val, epsilon = 1e-12);
    }

    #[test]
    fn test_single_cluster_warns() {
        let rows = vec![vec![1.0], vec![2.0]];
        let mat = CompressedSparseData::from_dense_rows(&rows, 1, 0.0).unwrap();
        let res = find_markers(&mat, &gene_names(1), &assignment(vec![0, 0], 1), &DeParams::default())
            .unwrap();
        assert!(res.markers.is_empty());
        assert_eq!(res.warnings.len(), 1);
        assert!(matches!(
            res.warnings[0],
            PipelineWarning::EmptyCluster { cluster: 0, .. }
        ));
    }
}
