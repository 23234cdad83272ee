//! Composition of the stages into the clustering and meta-program branches.
//!
//! Every stage reads its inputs from the `ArtifactStore` and writes its
//! result under a fixed id. Upstream artifacts that already exist are reused,
//! so both branches can run on the same store in either order.

use std::time::Instant;

use crate::core::graph::knn::generate_knn_exact;
use crate::core::methods::meta_programs::build_meta_programs;
use crate::core::methods::nmf::run_nmf_grid;
use crate::error::{PipelineWarning, Result, ScError};
use crate::pipeline::artifacts::{ArtifactData, ArtifactStore};
use crate::pipeline::config::PipelineConfig;
use crate::single_cell::batch_corrections::{
    harmonise_embedding, kbet, kbet_acceptance_rate, same_batch_neighbour_fraction,
};
use crate::single_cell::clustering::{cluster_artifact_id, cluster_cells};
use crate::single_cell::dge::find_markers;
use crate::single_cell::matrix_store::MatrixStore;
use crate::single_cell::processing::{
    find_variable_features, normalise_counts, run_pca, scale_features, Embedding,
};
use crate::single_cell::sc_knn_snn::build_neighbour_graph;

//////////////////
// Artifact ids //
//////////////////

pub const COUNTS: &str = "counts";
pub const FILTERED: &str = "counts.filtered";
pub const NORMALISED: &str = "normalised";
pub const GENES: &str = "genes";
pub const SCALED: &str = "scaled";
pub const PCA: &str = "pca";
pub const HARMONY: &str = "harmony";
pub const SNN: &str = "snn";
pub const CLUSTERS: &str = "clusters";
pub const MARKERS: &str = "markers";
pub const NMF: &str = "nmf";
pub const META_PROGRAMS: &str = "meta_programs";

////////////////
// Structures //
////////////////

/// Artifact ids produced by the clustering branch
///
/// ### Fields
///
/// * `embedding` - Embedding the graph was built on (`pca` or `harmony`).
/// * `graph` - The SNN graph.
/// * `clusters` - Clustering at the main resolution.
/// * `markers` - Marker table of the main clustering.
/// * `extra_clusters` - Clusterings at the additional resolutions.
#[derive(Clone, Debug)]
pub struct ClusteringOutputs {
    pub embedding: String,
    pub graph: String,
    pub clusters: String,
    pub markers: String,
    pub extra_clusters: Vec<String>,
}

/// Artifact ids and run counts of the meta-program branch
#[derive(Clone, Debug)]
pub struct MetaProgramOutputs {
    pub nmf: String,
    pub meta_programs: String,
    pub n_runs: usize,
    pub n_skipped: usize,
}

#[derive(Clone, Debug)]
pub struct PipelineOutputs {
    pub clustering: ClusteringOutputs,
    pub meta_programs: MetaProgramOutputs,
}

/////////////
// Helpers //
/////////////

/// Store the raw and QC filtered counts, the normalised matrix and the gene
/// table unless they already exist
fn ensure_preprocessed(
    store: &MatrixStore,
    config: &PipelineConfig,
    artifacts: &mut ArtifactStore,
) -> Result<()> {
    if !artifacts.contains(COUNTS) {
        artifacts.insert(COUNTS, &[], ArtifactData::Counts(store.clone()), Vec::new())?;
    }

    if !artifacts.contains(FILTERED) {
        let filtered = {
            let raw = artifacts.counts(COUNTS)?;
            raw.filter_genes(config.qc.min_cells)?
                .filter_cells(&config.qc)?
        };
        if filtered.n_cells() < 2 || filtered.n_genes() == 0 {
            return Err(ScError::InputFormat(format!(
                "{} cells x {} genes left after QC",
                filtered.n_cells(),
                filtered.n_genes()
            )));
        }
        artifacts.insert(FILTERED, &[COUNTS], ArtifactData::Counts(filtered), Vec::new())?;
    }

    if !artifacts.contains(NORMALISED) {
        let normalised = normalise_counts(artifacts.counts(FILTERED)?, &config.normalise)?;
        artifacts.insert(
            NORMALISED,
            &[FILTERED],
            ArtifactData::Normalised(normalised),
            Vec::new(),
        )?;
    }

    if !artifacts.contains(GENES) {
        let genes = find_variable_features(artifacts.counts(FILTERED)?, &config.hvg)?;
        artifacts.insert(GENES, &[FILTERED], ArtifactData::GeneTable(genes), Vec::new())?;
    }

    Ok(())
}

fn n_batches(batches: &[usize]) -> usize {
    batches.iter().max().map_or(0, |&b| b + 1)
}

////////////////////
// Main functions //
////////////////////

/// Cluster the cells at an additional resolution on the existing SNN graph
///
/// ### Params
///
/// * `artifacts` - Store holding the `snn` artifact.
/// * `config` - Pipeline configuration.
/// * `resolution` - Louvain resolution.
///
/// ### Returns
///
/// The id of the new `clusters_res<resolution>` artifact.
pub fn recluster(
    artifacts: &mut ArtifactStore,
    config: &PipelineConfig,
    resolution: f64,
) -> Result<String> {
    if resolution <= 0.0 {
        return Err(ScError::Config(format!(
            "cluster resolution must be positive, got {}",
            resolution
        )));
    }
    let id = cluster_artifact_id(resolution);
    let assignment = cluster_cells(
        artifacts.graph(SNN)?,
        &config.cluster.to_params(resolution, config.seed),
    );
    log::info!(
        "Resolution {}: {} clusters (modularity {:.4})",
        resolution,
        assignment.n_clusters,
        assignment.modularity
    );
    artifacts.insert(&id, &[SNN], ArtifactData::Clusters(assignment), Vec::new())?;
    Ok(id)
}

/// Run the clustering branch
///
/// QC, normalisation, feature selection, scaling, PCA, optional batch
/// correction, SNN graph, Louvain and marker detection.
///
/// ### Params
///
/// * `store` - The raw counts.
/// * `config` - Pipeline configuration.
/// * `artifacts` - Store receiving every intermediate result.
///
/// ### Returns
///
/// The `ClusteringOutputs` naming the produced artifacts.
pub fn run_clustering(
    store: &MatrixStore,
    config: &PipelineConfig,
    artifacts: &mut ArtifactStore,
) -> Result<ClusteringOutputs> {
    let start = Instant::now();
    ensure_preprocessed(store, config, artifacts)?;

    if !artifacts.contains(SCALED) {
        let scaled = scale_features(
            artifacts.normalised(NORMALISED)?,
            artifacts.counts(FILTERED)?.cells(),
            artifacts.gene_table(GENES)?,
            &config.scale,
        )?;
        let warnings = scaled.warnings.clone();
        artifacts.insert(
            SCALED,
            &[NORMALISED, GENES],
            ArtifactData::Scaled(scaled),
            warnings,
        )?;
    }

    if !artifacts.contains(PCA) {
        let pca = run_pca(
            artifacts.scaled(SCALED)?,
            &artifacts.counts(FILTERED)?.cells().ids,
            &config.pca,
            config.seed,
        )?;
        artifacts.insert(PCA, &[SCALED], ArtifactData::Embedding(pca), Vec::new())?;
    }

    let batches = artifacts.counts(FILTERED)?.batch_labels();
    let correct = config.batch.enabled && n_batches(&batches) > 1;
    let embedding_id = if correct { HARMONY } else { PCA };

    if correct && !artifacts.contains(HARMONY) {
        let corrected = harmonise_embedding(
            artifacts.embedding(PCA)?,
            &batches,
            &config.batch.to_params(config.seed),
        )?;
        if log::log_enabled!(log::Level::Debug) {
            let k = config.graph.neighbor_k;
            let before = artifacts.embedding(PCA)?.first_dims(config.batch.batch_correction_dims);
            log::debug!(
                "Same-batch neighbour fraction (k = {}): {:.3} before, {:.3} after correction",
                k,
                same_batch_neighbour_fraction(before.as_ref(), &batches, k)?,
                same_batch_neighbour_fraction(corrected.coords.as_ref(), &batches, k)?
            );
            let knn = generate_knn_exact(corrected.coords.as_ref(), k);
            let pvals = kbet(&knn, &batches)?;
            log::debug!(
                "kBET acceptance rate: {:.3}",
                kbet_acceptance_rate(&pvals, 0.05)
            );
        }
        let warnings = corrected.warnings.clone();
        artifacts.insert(HARMONY, &[PCA], ArtifactData::Embedding(corrected), warnings)?;
    } else if !correct {
        log::info!("Batch correction skipped ({} batches)", n_batches(&batches));
    }

    let graph = {
        let embedding: &Embedding = artifacts.embedding(embedding_id)?;
        let coords = embedding.first_dims(config.batch.batch_correction_dims);
        log::debug!(
            "Neighbour graph on the first {} of {} dimensions of '{}'",
            coords.ncols(),
            embedding.n_dims(),
            embedding_id
        );
        build_neighbour_graph(
            coords.as_ref(),
            embedding_id,
            &config.graph.to_params(config.seed),
        )
    };
    artifacts.insert(SNN, &[embedding_id], ArtifactData::Graph(graph), Vec::new())?;

    let assignment = cluster_cells(
        artifacts.graph(SNN)?,
        &config
            .cluster
            .to_params(config.cluster.cluster_resolution, config.seed),
    );
    log::info!(
        "Resolution {}: {} clusters (modularity {:.4})",
        config.cluster.cluster_resolution,
        assignment.n_clusters,
        assignment.modularity
    );
    artifacts.insert(CLUSTERS, &[SNN], ArtifactData::Clusters(assignment), Vec::new())?;

    let markers = find_markers(
        artifacts.normalised(NORMALISED)?,
        artifacts.counts(FILTERED)?.genes(),
        artifacts.clusters(CLUSTERS)?,
        &config.de,
    )?;
    let warnings = markers.warnings.clone();
    artifacts.insert(
        MARKERS,
        &[NORMALISED, CLUSTERS],
        ArtifactData::Markers(markers),
        warnings,
    )?;

    let extra_clusters = config
        .cluster
        .extra_resolutions
        .iter()
        .map(|&res| recluster(artifacts, config, res))
        .collect::<Result<Vec<_>>>()?;

    log::info!("Clustering branch finished in {:.2?}", start.elapsed());

    Ok(ClusteringOutputs {
        embedding: embedding_id.to_string(),
        graph: SNN.to_string(),
        clusters: CLUSTERS.to_string(),
        markers: MARKERS.to_string(),
        extra_clusters,
    })
}

/// Run the meta-program branch
///
/// Factorises the normalised matrix of every sample at every configured
/// rank and builds the consensus meta-programs. Failed runs are skipped
/// with a `SampleSkipped` warning.
///
/// ### Params
///
/// * `store` - The raw counts.
/// * `config` - Pipeline configuration.
/// * `artifacts` - Store receiving every intermediate result.
///
/// ### Returns
///
/// The `MetaProgramOutputs`.
pub fn run_meta_programs(
    store: &MatrixStore,
    config: &PipelineConfig,
    artifacts: &mut ArtifactStore,
) -> Result<MetaProgramOutputs> {
    let start = Instant::now();
    ensure_preprocessed(store, config, artifacts)?;

    let (samples, genes) = {
        let filtered = artifacts.counts(FILTERED)?;
        let normalised = artifacts.normalised(NORMALISED)?;
        let gene_table = artifacts.gene_table(GENES)?;

        let gene_idx: Vec<usize> = if config.nmf.use_variable_genes {
            gene_table.top.clone()
        } else {
            (0..filtered.n_genes()).collect()
        };
        let genes: Vec<String> = gene_idx
            .iter()
            .map(|&g| filtered.genes()[g].clone())
            .collect();

        let samples: Vec<_> = filtered
            .sample_indices()
            .into_iter()
            .map(|(name, cells)| {
                let x = normalised.select_outer(&cells).select_inner(&gene_idx);
                (name, x)
            })
            .collect();

        (samples, genes)
    };

    let ranks = config.nmf.ranks();
    let jobs: Vec<(String, usize)> = samples
        .iter()
        .flat_map(|(name, _)| ranks.iter().map(move |&r| (name.clone(), r)))
        .collect();
    let results = run_nmf_grid(&samples, &ranks, &config.nmf.to_params(config.seed));

    let mut factorisations = Vec::with_capacity(results.len());
    let mut warnings: Vec<PipelineWarning> = Vec::new();
    for ((sample, rank), res) in jobs.into_iter().zip(results) {
        match res {
            Ok(f) => {
                warnings.extend(f.warnings.iter().cloned());
                factorisations.push(f);
            }
            Err(ScError::SampleFactorisation { reason, .. }) => {
                let warning = PipelineWarning::SampleSkipped {
                    sample,
                    rank,
                    reason,
                };
                log::warn!("{}", warning);
                warnings.push(warning);
            }
            Err(e) => return Err(e),
        }
    }
    let n_runs = factorisations.len();
    let n_skipped = ranks.len() * samples.len() - n_runs;

    let set = build_meta_programs(&factorisations, &genes, &config.meta)?;
    artifacts.insert(
        NMF,
        &[NORMALISED, GENES],
        ArtifactData::Nmf(factorisations),
        warnings,
    )?;
    let set_warnings = set.warnings.clone();
    log::info!(
        "{} meta-programs from {} NMF runs ({} skipped)",
        set.programs.len(),
        n_runs,
        n_skipped
    );
    artifacts.insert(
        META_PROGRAMS,
        &[NMF],
        ArtifactData::MetaPrograms(set),
        set_warnings,
    )?;

    log::info!("Meta-program branch finished in {:.2?}", start.elapsed());

    Ok(MetaProgramOutputs {
        nmf: NMF.to_string(),
        meta_programs: META_PROGRAMS.to_string(),
        n_runs,
        n_skipped,
    })
}

/// Run both branches on a fresh artifact store
///
/// ### Params
///
/// * `store` - The raw counts.
/// * `config` - Pipeline configuration; validated first.
///
/// ### Returns
///
/// The populated `ArtifactStore` and the ids of the final outputs.
pub fn run_pipeline(
    store: &MatrixStore,
    config: &PipelineConfig,
) -> Result<(ArtifactStore, PipelineOutputs)> {
    config.validate()?;
    let mut artifacts = ArtifactStore::new();

    let clustering = run_clustering(store, config, &mut artifacts)?;
    let meta_programs = run_meta_programs(store, config, &mut artifacts)?;

    Ok((
        artifacts,
        PipelineOutputs {
            clustering,
            meta_programs,
        },
    ))
}

///////////
// Tests //
///////////
