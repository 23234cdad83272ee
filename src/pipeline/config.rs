use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::graph::community_detection::LouvainParams;
use crate::core::graph::knn::KnnSearch;
use crate::core::methods::meta_programs::MetaProgramParams;
use crate::core::methods::nmf::NmfParams;
use crate::error::{Result, ScError};
use crate::single_cell::batch_corrections::{HarmonyConvergence, HarmonyParams};
use crate::single_cell::dge::DeParams;
use crate::single_cell::matrix_store::QcParams;
use crate::single_cell::processing::{HvgParams, NormaliseParams, PcaParams, ScaleParams};
use crate::single_cell::sc_knn_snn::{NeighbourGraphParams, SnnSimilarityMethod};

/////////////
// Helpers //
/////////////

fn check(ok: bool, msg: impl FnOnce() -> String) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(ScError::Config(msg()))
    }
}

////////////////////
// Config section //
////////////////////

/// Batch correction settings
///
/// `batch_correction_dims` also sets the width of the neighbour graph
/// input: the graph is built on the first `batch_correction_dims`
/// components of the corrected embedding, or of the PCA embedding when no
/// correction runs, so corrected and uncorrected runs share one space.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub enabled: bool,
    pub batch_correction_dims: usize,
    pub batch_correction_max_iter: usize,
    pub n_clusters: Option<usize>,
    pub sigma: f64,
    pub theta: f64,
    pub lambda: f64,
    pub block_size: f64,
    pub max_iter_cluster: usize,
    pub epsilon_cluster: f64,
    pub convergence: HarmonyConvergence,
    pub convergence_threshold: Option<f64>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        let params = HarmonyParams::default();
        Self {
            enabled: true,
            batch_correction_dims: params.dims,
            batch_correction_max_iter: params.max_iter,
            n_clusters: params.n_clusters,
            sigma: params.sigma,
            theta: params.theta,
            lambda: params.lambda,
            block_size: params.block_size,
            max_iter_cluster: params.max_iter_cluster,
            epsilon_cluster: params.epsilon_cluster,
            convergence: params.convergence,
            convergence_threshold: params.convergence_threshold,
        }
    }
}

impl BatchConfig {
    pub fn to_params(&self, seed: u64) -> HarmonyParams {
        HarmonyParams {
            dims: self.batch_correction_dims,
            max_iter: self.batch_correction_max_iter,
            n_clusters: self.n_clusters,
            sigma: self.sigma,
            theta: self.theta,
            lambda: self.lambda,
            block_size: self.block_size,
            max_iter_cluster: self.max_iter_cluster,
            epsilon_cluster: self.epsilon_cluster,
            convergence: self.convergence,
            convergence_threshold: self.convergence_threshold,
            seed,
        }
    }
}

/// Neighbour graph settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub neighbor_k: usize,
    pub knn_method: KnnSearch,
    pub snn_similarity: SnnSimilarityMethod,
    pub snn_prune_threshold: f64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        let params = NeighbourGraphParams::default();
        Self {
            neighbor_k: params.k,
            knn_method: params.knn_method,
            snn_similarity: params.similarity,
            snn_prune_threshold: params.prune_threshold,
        }
    }
}

impl GraphConfig {
    pub fn to_params(&self, seed: u64) -> NeighbourGraphParams {
        NeighbourGraphParams {
            k: self.neighbor_k,
            knn_method: self.knn_method,
            similarity: self.snn_similarity,
            prune_threshold: self.snn_prune_threshold,
            seed,
        }
    }
}

/// Community detection settings
///
/// ### Fields
///
/// * `cluster_resolution` - Resolution of the main clustering.
/// * `extra_resolutions` - Additional resolutions stored as
///   `clusters_res<value>` artifacts.
/// * `n_starts` - Independently seeded Louvain starts.
/// * `max_levels` - Maximum aggregation levels.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub cluster_resolution: f64,
    pub extra_resolutions: Vec<f64>,
    pub n_starts: usize,
    pub max_levels: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_resolution: 1.0,
            extra_resolutions: Vec::new(),
            n_starts: 1,
            max_levels: 10,
        }
    }
}

impl ClusterConfig {
    pub fn to_params(&self, resolution: f64, seed: u64) -> LouvainParams {
        LouvainParams {
            resolution,
            n_starts: self.n_starts,
            max_levels: self.max_levels,
            seed,
            ..Default::default()
        }
    }
}

/// NMF settings
///
/// ### Fields
///
/// * `nmf_rank_range` - Inclusive `[min, max]` rank range.
/// * `max_iter` - Maximum multiplicative update rounds.
/// * `tol` - Relative error change to stop at.
/// * `use_variable_genes` - Factorise the selected genes only.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NmfConfig {
    pub nmf_rank_range: (usize, usize),
    pub max_iter: usize,
    pub tol: f64,
    pub use_variable_genes: bool,
}

impl Default for NmfConfig {
    fn default() -> Self {
        let params = NmfParams::default();
        Self {
            nmf_rank_range: (4, 9),
            max_iter: params.max_iter,
            tol: params.tol,
            use_variable_genes: true,
        }
    }
}

impl NmfConfig {
    pub fn ranks(&self) -> Vec<usize> {
        (self.nmf_rank_range.0..=self.nmf_rank_range.1).collect()
    }

    pub fn to_params(&self, seed: u64) -> NmfParams {
        NmfParams {
            max_iter: self.max_iter,
            tol: self.tol,
            seed,
        }
    }
}

///////////////////
// Main config   //
///////////////////

/// Configuration of the whole pipeline
///
/// Every section falls back to its defaults when missing from the JSON.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub seed: u64,
    pub qc: QcParams,
    pub normalise: NormaliseParams,
    pub hvg: HvgParams,
    pub scale: ScaleParams,
    pub pca: PcaParams,
    pub batch: BatchConfig,
    pub graph: GraphConfig,
    pub cluster: ClusterConfig,
    pub de: DeParams,
    pub nmf: NmfConfig,
    pub meta: MetaProgramParams,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            qc: QcParams::default(),
            normalise: NormaliseParams::default(),
            hvg: HvgParams::default(),
            scale: ScaleParams::default(),
            pca: PcaParams::default(),
            batch: BatchConfig::default(),
            graph: GraphConfig::default(),
            cluster: ClusterConfig::default(),
            de: DeParams::default(),
            nmf: NmfConfig::default(),
            meta: MetaProgramParams::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON configuration file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Reject inconsistent or out of range values
    pub fn validate(&self) -> Result<()> {
        let qc = &self.qc;
        if let Some(max) = qc.max_features {
            check(max >= qc.min_features, || {
                format!(
                    "qc.max_features ({}) below qc.min_features ({})",
                    max, qc.min_features
                )
            })?;
        }
        check((0.0..=100.0).contains(&qc.max_mito_pct), || {
            format!("qc.max_mito_pct must be in [0, 100], got {}", qc.max_mito_pct)
        })?;

        check(self.normalise.scale_factor > 0.0, || {
            format!(
                "normalise.scale_factor must be positive, got {}",
                self.normalise.scale_factor
            )
        })?;

        check(self.hvg.n_variable_features > 0, || {
            "hvg.n_variable_features must be at least 1".to_string()
        })?;
        check(self.hvg.loess_span > 0.0 && self.hvg.loess_span <= 1.0, || {
            format!("hvg.loess_span must be in (0, 1], got {}", self.hvg.loess_span)
        })?;
        if let Some(clip) = self.hvg.clip_max {
            check(clip > 0.0, || format!("hvg.clip_max must be positive, got {}", clip))?;
        }
        if let Some(max) = self.scale.scale_max {
            check(max > 0.0, || format!("scale.scale_max must be positive, got {}", max))?;
        }

        check(self.pca.n_pca_dims > 0, || {
            "pca.n_pca_dims must be at least 1".to_string()
        })?;

        let batch = &self.batch;
        check(batch.batch_correction_dims > 0, || {
            "batch.batch_correction_dims must be at least 1".to_string()
        })?;
        check(batch.batch_correction_dims <= self.pca.n_pca_dims, || {
            format!(
                "batch.batch_correction_dims ({}) exceeds pca.n_pca_dims ({})",
                batch.batch_correction_dims, self.pca.n_pca_dims
            )
        })?;
        check(batch.batch_correction_max_iter > 0, || {
            "batch.batch_correction_max_iter must be at least 1".to_string()
        })?;
        check(batch.sigma > 0.0 && batch.theta >= 0.0 && batch.lambda >= 0.0, || {
            "batch.sigma must be positive, theta and lambda non-negative".to_string()
        })?;
        check(batch.block_size > 0.0 && batch.block_size <= 1.0, || {
            format!("batch.block_size must be in (0, 1], got {}", batch.block_size)
        })?;
        if let Some(k) = batch.n_clusters {
            check(k > 0, || "batch.n_clusters must be at least 1".to_string())?;
        }

        check(self.graph.neighbor_k > 0, || {
            "graph.neighbor_k must be at least 1".to_string()
        })?;
        check((0.0..=1.0).contains(&self.graph.snn_prune_threshold), || {
            format!(
                "graph.snn_prune_threshold must be in [0, 1], got {}",
                self.graph.snn_prune_threshold
            )
        })?;

        for &res in std::iter::once(&self.cluster.cluster_resolution)
            .chain(self.cluster.extra_resolutions.iter())
        {
            check(res > 0.0, || format!("cluster resolution must be positive, got {}", res))?;
        }
        check(self.cluster.n_starts > 0 && self.cluster.max_levels > 0, || {
            "cluster.n_starts and cluster.max_levels must be at least 1".to_string()
        })?;

        check((0.0..=1.0).contains(&self.de.de_min_pct), || {
            format!("de.de_min_pct must be in [0, 1], got {}", self.de.de_min_pct)
        })?;
        check(self.de.de_logfc_threshold >= 0.0, || {
            "de.de_logfc_threshold must be non-negative".to_string()
        })?;

        let (lo, hi) = self.nmf.nmf_rank_range;
        check(lo >= 1 && lo <= hi, || {
            format!("nmf.nmf_rank_range must satisfy 1 <= min <= max, got [{}, {}]", lo, hi)
        })?;
        check(self.nmf.max_iter > 0, || "nmf.max_iter must be at least 1".to_string())?;

        check(self.meta.n_meta_programs > 0, || {
            "meta.n_meta_programs must be at least 1".to_string()
        })?;
        check(
            self.meta.weight_explained_cutoff > 0.0 && self.meta.weight_explained_cutoff <= 1.0,
            || {
                format!(
                    "meta.weight_explained_cutoff must be in (0, 1], got {}",
                    self.meta.weight_explained_cutoff
                )
            },
        )?;
        check(self.meta.max_program_genes > 0, || {
            "meta.max_program_genes must be at least 1".to_string()
        })?;

        Ok(())
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.seed, 42);
        assert_eq!(config.hvg.n_variable_features, 2000);
        assert_eq!(config.pca.n_pca_dims, 50);
        assert_eq!(config.graph.neighbor_k, 20);
        assert_eq!(config.nmf.ranks(), vec![4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_partial_json() {
        let json = r#"{
            "seed": 7,
            "graph": { "neighbor_k": 15, "snn_similarity": "rank", "knn_method": "hnsw" },
            "batch": { "convergence": "objective_change" },
            "scale": { "regress_out": ["n_features", "mito_fraction"] },
            "nmf": { "nmf_rank_range": [2, 3] }
        }"#;
        let config = PipelineConfig::from_json_str(json).unwrap();

        assert_eq!(config.seed, 7);
        assert_eq!(config.graph.neighbor_k, 15);
        assert_eq!(config.graph.snn_similarity, SnnSimilarityMethod::Rank);
        assert_eq!(config.graph.knn_method, KnnSearch::Hnsw);
        assert_eq!(config.batch.convergence, HarmonyConvergence::ObjectiveChange);
        assert_eq!(config.scale.regress_out.len(), 2);
        assert_eq!(config.nmf.ranks(), vec![2, 3]);
        // untouched sections keep their defaults
        assert_eq!(config.pca.n_pca_dims, 50);
        assert_eq!(config.graph.to_params(config.seed).seed, 7);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad = [
            r#"{ "nmf": { "nmf_rank_range": [5, 3] } }"#,
            r#"{ "graph": { "snn_prune_threshold": 1.5 } }"#,
            r#"{ "cluster": { "cluster_resolution": 0.0 } }"#,
            r#"{ "batch": { "batch_correction_dims": 60 } }"#,
            r#"{ "qc": { "min_features": 200, "max_features": 100 } }"#,
            r#"{ "meta": { "weight_explained_cutoff": 0.0 } }"#,
        ];
        for json in bad {
            assert!(
                matches!(PipelineConfig::from_json_str(json), Err(ScError::Config(_))),
                "accepted {}",
                json
            );
        }
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            PipelineConfig::from_json_str("{ seed: }"),
            Err(ScError::Json(_))
        ));
    }
}
