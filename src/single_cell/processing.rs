//! Normalisation, highly variable gene selection, scaling and PCA of single
//! cell count data.

use faer::Mat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::core::base::loess::LoessRegression;
use crate::core::base::pca_svd::pca;
use crate::core::base::utils::{col_means, col_sds, regress_out};
use crate::core::data::sparse_structures::*;
use crate::error::{PipelineWarning, Result, ScError};
use crate::single_cell::matrix_store::{CellTable, MatrixStore};

///////////
// Enums //
///////////

/// Per-cell covariates that can be regressed out before scaling
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Covariate {
    NFeatures,
    MitoFraction,
    TotalCount,
}

/// Helper function to parse a covariate name
///
/// ### Params
///
/// * `s` - Name of the covariate
///
/// ### Returns
///
/// Option of the Covariate
pub fn parse_covariate(s: &str) -> Option<Covariate> {
    match s.to_lowercase().as_str() {
        "n_features" | "nfeatures" => Some(Covariate::NFeatures),
        "mito_fraction" | "percent_mt" => Some(Covariate::MitoFraction),
        "total_count" | "ncount" => Some(Covariate::TotalCount),
        _ => None,
    }
}

////////////
// Params //
////////////

/// Normalisation parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NormaliseParams {
    /// Target library size before the log transform
    pub scale_factor: f64,
}

impl Default for NormaliseParams {
    fn default() -> Self {
        Self {
            scale_factor: 10_000.0,
        }
    }
}

/// Highly variable gene parameters
///
/// ### Fields
///
/// * `n_variable_features` - Number of genes to select.
/// * `loess_span` - Span of the mean-variance loess fit.
/// * `clip_max` - Clipping of the standardised values; defaults to
///   `sqrt(n_cells)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HvgParams {
    pub n_variable_features: usize,
    pub loess_span: f64,
    pub clip_max: Option<f64>,
}

impl Default for HvgParams {
    fn default() -> Self {
        Self {
            n_variable_features: 2000,
            loess_span: 0.3,
            clip_max: None,
        }
    }
}

/// Scaling parameters
///
/// ### Fields
///
/// * `regress_out` - Covariates to regress out before the z-scoring.
/// * `scale_max` - Upper clipping value of the scaled data.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleParams {
    pub regress_out: Vec<Covariate>,
    pub scale_max: Option<f64>,
}

impl Default for ScaleParams {
    fn default() -> Self {
        Self {
            regress_out: Vec::new(),
            scale_max: Some(10.0),
        }
    }
}

/// PCA parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PcaParams {
    /// Number of principal components
    pub n_pca_dims: usize,
    /// Use the randomised SVD instead of the exact thin SVD
    pub random_svd: bool,
}

impl Default for PcaParams {
    fn default() -> Self {
        Self {
            n_pca_dims: 50,
            random_svd: false,
        }
    }
}

////////////////
// Structures //
////////////////

/// Per-gene record
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GeneMetadata {
    pub id: String,
    pub mean: f64,
    pub variance: f64,
    pub variance_expected: f64,
    pub variance_standardised: f64,
    pub selected: bool,
}

/// Columnar gene metadata as produced by the feature selection
///
/// ### Fields
///
/// * `ids` - Gene identifiers.
/// * `mean` - Mean raw count.
/// * `variance` - Sample variance of the raw counts.
/// * `variance_expected` - Variance predicted by the mean-variance trend.
/// * `variance_standardised` - Variance of the clipped standardised values.
/// * `selected` - Whether the gene is a highly variable gene.
/// * `top` - Indices of the selected genes, most variable first.
#[derive(Clone, Debug)]
pub struct GeneTable {
    pub ids: Vec<String>,
    pub mean: Vec<f64>,
    pub variance: Vec<f64>,
    pub variance_expected: Vec<f64>,
    pub variance_standardised: Vec<f64>,
    pub selected: Vec<bool>,
    pub top: Vec<usize>,
}

impl GeneTable {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn get(&self, i: usize) -> GeneMetadata {
        GeneMetadata {
            id: self.ids[i].clone(),
            mean: self.mean[i],
            variance: self.variance[i],
            variance_expected: self.variance_expected[i],
            variance_standardised: self.variance_standardised[i],
            selected: self.selected[i],
        }
    }
}

/// Dense scaled data on the selected genes
///
/// ### Fields
///
/// * `matrix` - Cells x selected genes.
/// * `genes` - Gene index (into the full gene list) of every column.
/// * `warnings` - Zero variance genes.
#[derive(Clone, Debug)]
pub struct ScaledData {
    pub matrix: Mat<f64>,
    pub genes: Vec<usize>,
    pub warnings: Vec<PipelineWarning>,
}

/// Named low-dimensional representation of the cells
///
/// ### Fields
///
/// * `name` - Name of the embedding (e.g. `"pca"`).
/// * `method` - Method that produced it.
/// * `parent` - Name of the embedding / artifact it was derived from.
/// * `cell_ids` - Cell identifier of every row.
/// * `coords` - Cells x dimensions.
/// * `stdev` - Optional standard deviation per dimension.
/// * `loadings` - Optional features x dimensions loadings.
/// * `warnings` - Non-fatal issues of the producing stage.
#[derive(Clone, Debug)]
pub struct Embedding {
    pub name: String,
    pub method: String,
    pub parent: Option<String>,
    pub cell_ids: Vec<String>,
    pub coords: Mat<f64>,
    pub stdev: Option<Vec<f64>>,
    pub loadings: Option<Mat<f64>>,
    pub warnings: Vec<PipelineWarning>,
}

impl Embedding {
    pub fn n_dims(&self) -> usize {
        self.coords.ncols()
    }

    /// New embedding restricted to the first `n` dimensions
    pub fn first_dims(&self, n: usize) -> Mat<f64> {
        let n = n.min(self.coords.ncols());
        self.coords
            .as_ref()
            .submatrix(0, 0, self.coords.nrows(), n)
            .to_owned()
    }
}

////////////////////
// Main functions //
////////////////////

/// Log-normalise the counts
///
/// Every count is divided by the cell's total, multiplied by the scale
/// factor and `log1p` transformed.
///
/// ### Params
///
/// * `store` - The matrix store.
/// * `params` - Normalisation parameters.
///
/// ### Returns
///
/// New CSR matrix of the same shape, or `DegenerateCell` if a cell has a
/// total count of zero.
pub fn normalise_counts(
    store: &MatrixStore,
    params: &NormaliseParams,
) -> Result<CompressedSparseData<f64>> {
    let start = Instant::now();
    let counts = store.counts();

    let totals: Vec<f64> = (0..counts.outer_dim())
        .map(|i| counts.outer(i).1.iter().map(|&v| v as f64).sum())
        .collect();

    if let Some(i) = totals.iter().position(|&t| t <= 0.0) {
        return Err(ScError::DegenerateCell {
            cell: store.cells().ids[i].clone(),
        });
    }

    let data: Vec<f64> = (0..counts.outer_dim())
        .into_par_iter()
        .flat_map_iter(|i| {
            let factor = params.scale_factor / totals[i];
            counts
                .outer(i)
                .1
                .iter()
                .map(move |&v| (v as f64 * factor).ln_1p())
        })
        .collect();

    let res = CompressedSparseData {
        data,
        indices: counts.indices.clone(),
        indptr: counts.indptr.clone(),
        cs_type: CompressedSparseFormat::Csr,
        shape: counts.shape,
    };

    log::info!(
        "Normalised {} cells (scale factor {}) in {:.2?}",
        res.shape.0,
        params.scale_factor,
        start.elapsed()
    );

    Ok(res)
}

/// Identify highly variable genes (variance stabilising transformation)
///
/// Fits `log10(variance) ~ log10(mean)` via loess on the raw counts,
/// standardises every gene with the expected standard deviation, clips and
/// ranks the genes by the variance of the standardised values.
///
/// ### Params
///
/// * `store` - The matrix store (raw counts).
/// * `params` - HVG parameters.
///
/// ### Returns
///
/// The `GeneTable`.
pub fn find_variable_features(store: &MatrixStore, params: &HvgParams) -> Result<GeneTable> {
    let start = Instant::now();
    let n_cells = store.n_cells();
    let n_genes = store.n_genes();

    if n_cells < 2 {
        return Err(ScError::InputFormat(format!(
            "feature selection needs at least 2 cells, found {}",
            n_cells
        )));
    }
    let n = n_cells as f64;

    let csc = store.counts().transform_format();

    let (mean, variance): (Vec<f64>, Vec<f64>) = (0..n_genes)
        .into_par_iter()
        .map(|g| {
            let vals = csc.outer(g).1;
            let sum: f64 = vals.iter().map(|&v| v as f64).sum();
            let mean = sum / n;
            let sq: f64 = vals.iter().map(|&v| (v as f64 - mean).powi(2)).sum();
            let zeros = (n_cells - vals.len()) as f64;
            (mean, (sq + zeros * mean * mean) / (n - 1.0))
        })
        .unzip();

    let valid: Vec<usize> = (0..n_genes).filter(|&g| variance[g] > 0.0).collect();
    let x: Vec<f64> = valid.iter().map(|&g| mean[g].log10()).collect();
    let y: Vec<f64> = valid.iter().map(|&g| variance[g].log10()).collect();

    let loess = LoessRegression::new(params.loess_span, 2)?;
    let fit = loess.fit(&x, &y);

    let mut variance_expected = vec![0.0; n_genes];
    for (pos, &g) in valid.iter().enumerate() {
        variance_expected[g] = 10_f64.powf(fit.fitted_vals[pos]);
    }

    let clip = params.clip_max.unwrap_or_else(|| n.sqrt());

    let variance_standardised: Vec<f64> = (0..n_genes)
        .into_par_iter()
        .map(|g| {
            if variance[g] <= 0.0 || variance_expected[g] <= 0.0 {
                return 0.0;
            }
            let sd = variance_expected[g].sqrt();
            let vals = csc.outer(g).1;
            let zeros = (n_cells - vals.len()) as f64;
            let zero_z = ((0.0 - mean[g]) / sd).min(clip);
            let non_zero: f64 = vals
                .iter()
                .map(|&v| ((v as f64 - mean[g]) / sd).min(clip).powi(2))
                .sum();
            (non_zero + zeros * zero_z * zero_z) / (n - 1.0)
        })
        .collect();

    let ids = store.genes();
    let mut order: Vec<usize> = (0..n_genes).collect();
    order.sort_by(|&a, &b| {
        variance_standardised[b]
            .total_cmp(&variance_standardised[a])
            .then(a.cmp(&b))
    });
    let n_top = params.n_variable_features.min(n_genes);
    let top: Vec<usize> = order.into_iter().take(n_top).collect();

    let mut selected = vec![false; n_genes];
    for &g in &top {
        selected[g] = true;
    }

    log::info!(
        "Selected {} variable features out of {} genes in {:.2?}",
        top.len(),
        n_genes,
        start.elapsed()
    );

    Ok(GeneTable {
        ids: ids.to_vec(),
        mean,
        variance,
        variance_expected,
        variance_standardised,
        selected,
        top,
    })
}

/// Collect the requested covariates into a cells x covariates matrix
fn covariate_matrix(cells: &CellTable, covariates: &[Covariate]) -> Mat<f64> {
    Mat::from_fn(cells.len(), covariates.len(), |i, j| match covariates[j] {
        Covariate::NFeatures => cells.n_features[i] as f64,
        Covariate::MitoFraction => cells.mito_fraction[i],
        Covariate::TotalCount => cells.total_counts[i] as f64,
    })
}

/// Scale the normalised data of the selected genes
///
/// Optionally regresses out per-cell covariates, then z-scores every gene
/// (sample standard deviation) and clips at `scale_max`. Genes with zero
/// standard deviation are set to 0 and reported as warnings.
///
/// ### Params
///
/// * `normalised` - Log-normalised cells x genes (CSR).
/// * `cells` - Cell metadata (for the covariates).
/// * `genes` - The gene table from the feature selection.
/// * `params` - Scaling parameters.
///
/// ### Returns
///
/// The `ScaledData`.
pub fn scale_features(
    normalised: &CompressedSparseData<f64>,
    cells: &CellTable,
    genes: &GeneTable,
    params: &ScaleParams,
) -> Result<ScaledData> {
    let start = Instant::now();
    crate::ensure_dims!("cell table vs. normalised rows", normalised.shape.0, cells.len());
    crate::ensure_dims!("gene table vs. normalised columns", normalised.shape.1, genes.len());

    let mut dense = normalised.select_inner(&genes.top).to_dense();

    if !params.regress_out.is_empty() {
        let cov = covariate_matrix(cells, &params.regress_out);
        dense = regress_out(dense.as_ref(), cov.as_ref())?;
        log::debug!("Regressed out {:?}", params.regress_out);
    }

    let means = col_means(dense.as_ref());
    let sds = col_sds(dense.as_ref());
    let scale_max = params.scale_max.unwrap_or(f64::INFINITY);

    let mut warnings = Vec::new();
    for (j, &sd) in sds.iter().enumerate() {
        if sd <= 1e-12 {
            let warning = PipelineWarning::ZeroVariance {
                gene: genes.ids[genes.top[j]].clone(),
            };
            log::warn!("{}", warning);
            warnings.push(warning);
        }
    }

    let matrix = Mat::from_fn(dense.nrows(), dense.ncols(), |i, j| {
        if sds[j] <= 1e-12 {
            0.0
        } else {
            ((dense[(i, j)] - means[j]) / sds[j]).min(scale_max)
        }
    });

    log::info!(
        "Scaled {} genes in {:.2?}",
        matrix.ncols(),
        start.elapsed()
    );

    Ok(ScaledData {
        matrix,
        genes: genes.top.clone(),
        warnings,
    })
}

/// Run PCA on the scaled data
///
/// ### Params
///
/// * `scaled` - The scaled data.
/// * `cell_ids` - Identifier of every row of the scaled data.
/// * `params` - PCA parameters.
/// * `seed` - Seed for the randomised SVD.
///
/// ### Returns
///
/// `Embedding("pca")` with scores, loadings and per-component standard
/// deviations.
pub fn run_pca(
    scaled: &ScaledData,
    cell_ids: &[String],
    params: &PcaParams,
    seed: u64,
) -> Result<Embedding> {
    let start = Instant::now();
    crate::ensure_dims!("cell ids vs. scaled rows", scaled.matrix.nrows(), cell_ids.len());

    let res = pca(
        scaled.matrix.as_ref(),
        params.n_pca_dims,
        params.random_svd,
        seed,
    )?;

    log::info!(
        "PCA: {} components ({} SVD) in {:.2?}",
        res.scores.ncols(),
        if params.random_svd { "randomised" } else { "exact" },
        start.elapsed()
    );

    Ok(Embedding {
        name: "pca".to_string(),
        method: "pca".to_string(),
        parent: Some("scaled".to_string()),
        cell_ids: cell_ids.to_vec(),
        coords: res.scores,
        stdev: Some(res.stdev),
        loadings: Some(res.loadings),
        warnings: scaled.warnings.clone(),
    })
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::synthetic_data::generate_group_counts;
    use crate::single_cell::matrix_store::SampleCounts;
    use approx::assert_relative_eq;

    fn store_from_rows(rows: &[Vec<u32>]) -> MatrixStore {
        let n_genes = rows[0].len();
        let sample = SampleCounts {
            name: "s1".to_string(),
            barcodes: (0..rows.len()).map(|i| format!("c{}", i)).collect(),
            genes: (0..n_genes).map(|g| format!("g{}", g)).collect(),
            counts: CompressedSparseData::from_dense_rows(rows, n_genes, 0).unwrap(),
        };
        MatrixStore::from_samples(vec![sample], "MT-").unwrap()
    }

    #[test]
    fn test_normalisation_sums_to_scale_factor() {
        let store = store_from_rows(&[vec![1, 3, 0, 6], vec![0, 2, 2, 0], vec![7, 0, 0, 1]]);
        let params = NormaliseParams::default();
        let norm = normalise_counts(&store, &params).unwrap();

        assert_eq!(norm.shape, store.counts().shape);
        for i in 0..3 {
            let linear: f64 = norm.outer(i).1.iter().map(|v| v.exp_m1()).sum();
            assert_relative_eq!(linear, params.scale_factor, max_relative = 1e-10);
        }
    }

    #[test]
    fn test_zero_total_cell_is_degenerate() {
        let store = store_from_rows(&[vec![1, 3], vec![0, 0]]);
        let res = normalise_counts(&store, &NormaliseParams::default());
        match res {
            Err(ScError::DegenerateCell { cell }) => assert_eq!(cell, "s1_c1"),
            other => panic!("expected DegenerateCell, got {:?}", other),
        }
    }

    #[test]
    fn test_variable_features_pick_bimodal_genes() {
        use rand::prelude::*;
        use rand_distr::Poisson;

        // 60 Poisson background genes over a range of means, 5 bimodal genes
        let mut rng = StdRng::seed_from_u64(5);
        let n_cells = 120;
        let rows: Vec<Vec<u32>> = (0..n_cells)
            .map(|i| {
                let mut row: Vec<u32> = (0..5)
                    .map(|_| {
                        let rate = if i < n_cells / 2 { 10.0 } else { 0.5 };
                        Poisson::new(rate).unwrap().sample(&mut rng) as u32
                    })
                    .collect();
                row.extend((0..60).map(|g| {
                    let rate = 0.5 + g as f64 * 0.25;
                    Poisson::new(rate).unwrap().sample(&mut rng) as u32
                }));
                row
            })
            .collect();
        let store = store_from_rows(&rows);

        let params = HvgParams {
            n_variable_features: 5,
            ..Default::default()
        };
        let genes = find_variable_features(&store, &params).unwrap();

        assert_eq!(genes.top.len(), 5);
        assert!(genes.top.iter().all(|&g| g < 5));
        assert_eq!(genes.selected.iter().filter(|&&s| s).count(), 5);
        for w in genes.top.windows(2) {
            assert!(genes.variance_standardised[w[0]] >= genes.variance_standardised[w[1]]);
        }
    }

    #[test]
    fn test_variable_features_ties_by_gene_index() {
        // all genes identical -> identical standardised variance; with 12
        // genes "g10" sorts before "g2" as a string
        let rows: Vec<Vec<u32>> = (0..20).map(|i| vec![(i % 4) as u32 + 1; 12]).collect();
        let store = store_from_rows(&rows);
        let params = HvgParams {
            n_variable_features: 3,
            ..Default::default()
        };
        let genes = find_variable_features(&store, &params).unwrap();
        assert_eq!(genes.top, vec![0, 1, 2]);
    }

    #[test]
    fn test_scaling_and_zero_variance() {
        let rows: Vec<Vec<u32>> = (0..12)
            .map(|i| vec![(i % 3) as u32 + 1, 5, (i % 4) as u32, 1 + (i % 2) as u32])
            .collect();
        let store = store_from_rows(&rows);
        let norm = normalise_counts(&store, &NormaliseParams::default()).unwrap();
        let mut genes = find_variable_features(&store, &HvgParams::default()).unwrap();
        // force the constant gene into the selection
        genes.top = vec![0, 1];

        let scaled =
            scale_features(&norm, store.cells(), &genes, &ScaleParams::default()).unwrap();

        assert_eq!(scaled.matrix.ncols(), 2);
        let mean: f64 = scaled.matrix.col(0).iter().sum::<f64>() / 12.0;
        assert_relative_eq!(mean, 0.0, epsilon = 1e-10);
        let sd = col_sds(scaled.matrix.as_ref())[0];
        assert_relative_eq!(sd, 1.0, epsilon = 1e-10);

        // constant raw count, but not constant after normalisation
        assert!(scaled.matrix.col(1).iter().all(|&v| v <= 10.0));
    }

    #[test]
    fn test_scaling_with_regressed_covariate() {
        let rows: Vec<Vec<u32>> = (0..30)
            .map(|i| {
                vec![
                    2 + (i % 7) as u32,
                    3 + (i / 3) as u32,
                    1 + ((i * 5) % 4) as u32,
                    4 + (i % 2) as u32 * 6,
                ]
            })
            .collect();
        let store = store_from_rows(&rows);
        let norm = normalise_counts(&store, &NormaliseParams::default()).unwrap();
        let mut genes = find_variable_features(&store, &HvgParams::default()).unwrap();
        genes.top = vec![0, 1, 3];

        let params = ScaleParams {
            regress_out: vec![Covariate::TotalCount],
            scale_max: None,
        };
        let scaled = scale_features(&norm, store.cells(), &genes, &params).unwrap();
        let plain = scale_features(
            &norm,
            store.cells(),
            &genes,
            &ScaleParams {
                scale_max: None,
                ..Default::default()
            },
        )
        .unwrap();

        let total: Vec<f64> = store.cells().total_counts.iter().map(|&t| t as f64).collect();
        let total_mean = total.iter().sum::<f64>() / 30.0;
        let means = col_means(scaled.matrix.as_ref());
        let sds = col_sds(scaled.matrix.as_ref());
        for j in 0..3 {
            assert_relative_eq!(means[j], 0.0, epsilon = 1e-10);
            assert_relative_eq!(sds[j], 1.0, epsilon = 1e-10);
            let cross: f64 = (0..30)
                .map(|i| scaled.matrix[(i, j)] * (total[i] - total_mean))
                .sum();
            assert!(cross.abs() < 1e-8, "gene {} cross {}", j, cross);

            let plain_cross: f64 = (0..30)
                .map(|i| plain.matrix[(i, j)] * (total[i] - total_mean))
                .sum();
            if j == 1 {
                // gene 1 tracks the library size
                assert!(plain_cross.abs() > 1.0);
            }
        }
        assert!(scaled.warnings.is_empty());
    }

    #[test]
    fn test_zero_variance_warning() {
        let rows: Vec<Vec<u32>> = (0..10).map(|i| vec![(i % 3) as u32 + 1, 0, 4]).collect();
        let store = store_from_rows(&rows);
        let norm = normalise_counts(&store, &NormaliseParams::default()).unwrap();
        let mut genes = find_variable_features(&store, &HvgParams::default()).unwrap();
        genes.top = vec![0, 1];

        let scaled =
            scale_features(&norm, store.cells(), &genes, &ScaleParams::default()).unwrap();
        assert_eq!(
            scaled.warnings,
            vec![PipelineWarning::ZeroVariance {
                gene: "g1".to_string()
            }]
        );
        assert!(scaled.matrix.col(1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_pca_embedding() {
        let data = generate_group_counts(60, 20, 2, 20.0, 2.0, 11).unwrap();
        let sample = SampleCounts {
            name: "s".to_string(),
            barcodes: (0..60).map(|i| i.to_string()).collect(),
            genes: (0..20).map(|g| format!("g{}", g)).collect(),
            counts: data.counts,
        };
        let store = MatrixStore::from_samples(vec![sample], "MT-").unwrap();
        let norm = normalise_counts(&store, &NormaliseParams::default()).unwrap();
        let genes = find_variable_features(&store, &HvgParams::default()).unwrap();
        let scaled = scale_features(&norm, store.cells(), &genes, &ScaleParams::default()).unwrap();
        let emb = run_pca(&scaled, &store.cells().ids, &PcaParams::default(), 42).unwrap();

        assert_eq!(emb.name, "pca");
        assert_eq!(emb.coords.nrows(), 60);
        assert_eq!(emb.n_dims(), 20);
        let stdev = emb.stdev.as_ref().unwrap();
        for w in stdev.windows(2) {
            assert!(w[0] >= w[1]);
        }
        // PC1 separates the two groups
        let pc1_a: f64 = (0..30).map(|i| emb.coords[(i, 0)]).sum::<f64>() / 30.0;
        let pc1_b: f64 = (30..60).map(|i| emb.coords[(i, 0)]).sum::<f64>() / 30.0;
        assert!((pc1_a - pc1_b).abs() > 2.0);
    }
}
