use rayon::prelude::*;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::core::data::sparse_structures::*;
use crate::error::{Result, ScError};

////////////
// Params //
////////////

/// Cell and gene QC thresholds
///
/// ### Fields
///
/// * `min_features` - Minimum number of detected genes per cell.
/// * `max_features` - Optional maximum number of detected genes per cell.
/// * `max_mito_pct` - Maximum mitochondrial percentage per cell (0 to 100).
/// * `min_cells` - Genes detected in fewer cells are removed.
/// * `mito_prefix` - Case-insensitive prefix of mitochondrial gene ids.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QcParams {
    pub min_features: usize,
    pub max_features: Option<usize>,
    pub max_mito_pct: f64,
    pub min_cells: usize,
    pub mito_prefix: String,
}

impl Default for QcParams {
    fn default() -> Self {
        Self {
            min_features: 0,
            max_features: None,
            max_mito_pct: 100.0,
            min_cells: 0,
            mito_prefix: "MT-".to_string(),
        }
    }
}

////////////////
// Structures //
////////////////

/// Per-cell record
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CellMetadata {
    pub id: String,
    pub sample: String,
    pub total_count: u64,
    pub n_features: usize,
    pub mito_fraction: f64,
}

/// Columnar cell metadata, joined to the matrix rows by index
///
/// ### Fields
///
/// * `ids` - Cell identifiers (`{sample}_{barcode}` after concatenation).
/// * `samples` - Sample / batch label per cell.
/// * `total_counts` - Library size per cell.
/// * `n_features` - Number of detected genes per cell.
/// * `mito_fraction` - Fraction of counts from mitochondrial genes.
#[derive(Clone, Debug, Default)]
pub struct CellTable {
    pub ids: Vec<String>,
    pub samples: Vec<String>,
    pub total_counts: Vec<u64>,
    pub n_features: Vec<usize>,
    pub mito_fraction: Vec<f64>,
}

impl CellTable {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Get the record of one cell
    pub fn get(&self, i: usize) -> CellMetadata {
        CellMetadata {
            id: self.ids[i].clone(),
            sample: self.samples[i].clone(),
            total_count: self.total_counts[i],
            n_features: self.n_features[i],
            mito_fraction: self.mito_fraction[i],
        }
    }

    /// Subset to the given rows
    pub fn select(&self, keep: &[usize]) -> Self {
        Self {
            ids: keep.iter().map(|&i| self.ids[i].clone()).collect(),
            samples: keep.iter().map(|&i| self.samples[i].clone()).collect(),
            total_counts: keep.iter().map(|&i| self.total_counts[i]).collect(),
            n_features: keep.iter().map(|&i| self.n_features[i]).collect(),
            mito_fraction: keep.iter().map(|&i| self.mito_fraction[i]).collect(),
        }
    }
}

/// Counts of one sample as delivered by the loader
///
/// ### Fields
///
/// * `name` - Sample name; used as cell id prefix and batch label.
/// * `barcodes` - Cell barcodes (rows).
/// * `genes` - Gene ids (columns).
/// * `counts` - Cells x genes in CSR.
#[derive(Clone, Debug)]
pub struct SampleCounts {
    pub name: String,
    pub barcodes: Vec<String>,
    pub genes: Vec<String>,
    pub counts: CompressedSparseData<u32>,
}

/// Immutable raw count matrix plus metadata
///
/// ### Fields
///
/// * `counts` - Cells x genes raw counts in CSR.
/// * `cells` - Cell metadata table.
/// * `genes` - Gene ids (columns).
/// * `mito_prefix` - Prefix used for the mitochondrial fraction.
#[derive(Clone, Debug)]
pub struct MatrixStore {
    counts: CompressedSparseData<u32>,
    cells: CellTable,
    genes: Vec<String>,
    mito_prefix: String,
}

/////////////
// Helpers //
/////////////

fn mito_mask(genes: &[String], prefix: &str) -> Vec<bool> {
    let prefix = prefix.to_lowercase();
    genes
        .iter()
        .map(|g| !prefix.is_empty() && g.to_lowercase().starts_with(&prefix))
        .collect()
}

/// Per-cell library size, detected genes and mitochondrial fraction
fn cell_qc_metrics(counts: &CompressedSparseData<u32>, mito: &[bool]) -> (Vec<u64>, Vec<usize>, Vec<f64>) {
    let metrics: Vec<(u64, usize, f64)> = (0..counts.outer_dim())
        .into_par_iter()
        .map(|i| {
            let (idx, vals) = counts.outer(i);
            let total: u64 = vals.iter().map(|&v| v as u64).sum();
            let n_features = vals.iter().filter(|&&v| v > 0).count();
            let mito_total: u64 = idx
                .iter()
                .zip(vals.iter())
                .filter(|(&g, _)| mito[g])
                .map(|(_, &v)| v as u64)
                .sum();
            let frac = if total > 0 {
                mito_total as f64 / total as f64
            } else {
                0.0
            };
            (total, n_features, frac)
        })
        .collect();

    let mut totals = Vec::with_capacity(metrics.len());
    let mut features = Vec::with_capacity(metrics.len());
    let mut fractions = Vec::with_capacity(metrics.len());
    for (t, f, m) in metrics {
        totals.push(t);
        features.push(f);
        fractions.push(m);
    }
    (totals, features, fractions)
}

impl MatrixStore {
    /// Generate a new matrix store
    ///
    /// ### Params
    ///
    /// * `counts` - Cells x genes counts (CSR).
    /// * `cell_ids` - Cell identifiers.
    /// * `samples` - Sample label per cell.
    /// * `genes` - Gene identifiers; must be unique.
    /// * `mito_prefix` - Prefix of mitochondrial genes.
    ///
    /// ### Returns
    ///
    /// The store or an `InputFormat` / `DimensionMismatch` error.
    pub fn new(
        counts: CompressedSparseData<u32>,
        cell_ids: Vec<String>,
        samples: Vec<String>,
        genes: Vec<String>,
        mito_prefix: &str,
    ) -> Result<Self> {
        if counts.cs_type != CompressedSparseFormat::Csr {
            return Err(ScError::InputFormat(
                "count matrix must be in CSR format (cells x genes)".to_string(),
            ));
        }
        counts.validate()?;
        // explicit zeroes would count as detected genes downstream
        let counts = if counts.data.contains(&0) {
            counts.drop_stored(|v| v == 0)
        } else {
            counts
        };

        crate::ensure_dims!("cell ids vs. matrix rows", counts.shape.0, cell_ids.len());
        crate::ensure_dims!("sample labels vs. matrix rows", counts.shape.0, samples.len());
        crate::ensure_dims!("gene ids vs. matrix columns", counts.shape.1, genes.len());

        let mut seen = FxHashSet::default();
        for g in &genes {
            if !seen.insert(g.as_str()) {
                return Err(ScError::InputFormat(format!("duplicated gene id '{}'", g)));
            }
        }
        let mut seen = FxHashSet::default();
        for c in &cell_ids {
            if !seen.insert(c.as_str()) {
                return Err(ScError::InputFormat(format!("duplicated cell id '{}'", c)));
            }
        }

        let mito = mito_mask(&genes, mito_prefix);
        let (total_counts, n_features, mito_fraction) = cell_qc_metrics(&counts, &mito);

        Ok(Self {
            counts,
            cells: CellTable {
                ids: cell_ids,
                samples,
                total_counts,
                n_features,
                mito_fraction,
            },
            genes,
            mito_prefix: mito_prefix.to_string(),
        })
    }

    /// Concatenate the counts of several samples
    ///
    /// Cell ids become `{sample}_{barcode}`. All samples need to share the
    /// same genes in the same order.
    ///
    /// ### Params
    ///
    /// * `samples` - Per-sample counts.
    /// * `mito_prefix` - Prefix of mitochondrial genes.
    ///
    /// ### Returns
    ///
    /// The combined store.
    pub fn from_samples(samples: Vec<SampleCounts>, mito_prefix: &str) -> Result<Self> {
        let start = Instant::now();

        let first = samples
            .first()
            .ok_or_else(|| ScError::InputFormat("no samples supplied".to_string()))?;
        let genes = first.genes.clone();

        let mut data = Vec::new();
        let mut indices = Vec::new();
        let mut indptr = vec![0_usize];
        let mut cell_ids = Vec::new();
        let mut sample_labels = Vec::new();

        for sample in &samples {
            if sample.counts.cs_type != CompressedSparseFormat::Csr {
                return Err(ScError::InputFormat(format!(
                    "counts of sample '{}' must be in CSR format",
                    sample.name
                )));
            }
            sample.counts.validate()?;
            crate::ensure_dims!(
                format!("genes of sample '{}'", sample.name),
                genes.len(),
                sample.genes.len()
            );
            if let Some(pos) = sample.genes.iter().zip(genes.iter()).position(|(a, b)| a != b) {
                return Err(ScError::InputFormat(format!(
                    "gene '{}' at position {} of sample '{}' does not match '{}'",
                    sample.genes[pos], pos, sample.name, genes[pos]
                )));
            }
            crate::ensure_dims!(
                format!("barcodes of sample '{}'", sample.name),
                sample.counts.shape.0,
                sample.barcodes.len()
            );
            crate::ensure_dims!(
                format!("columns of sample '{}'", sample.name),
                genes.len(),
                sample.counts.shape.1
            );

            let offset = data.len();
            data.extend_from_slice(&sample.counts.data);
            indices.extend_from_slice(&sample.counts.indices);
            indptr.extend(sample.counts.indptr[1..].iter().map(|&p| p + offset));
            cell_ids.extend(
                sample
                    .barcodes
                    .iter()
                    .map(|b| format!("{}_{}", sample.name, b)),
            );
            sample_labels.extend(vec![sample.name.clone(); sample.barcodes.len()]);
        }

        let n_cells = cell_ids.len();
        let counts = CompressedSparseData::new_csr(data, indices, indptr, (n_cells, genes.len()))?;
        let store = Self::new(counts, cell_ids, sample_labels, genes, mito_prefix)?;

        log::info!(
            "Matrix store: {} cells x {} genes from {} sample(s) in {:.2?}",
            store.n_cells(),
            store.n_genes(),
            samples.len(),
            start.elapsed()
        );

        Ok(store)
    }

    pub fn n_cells(&self) -> usize {
        self.counts.shape.0
    }

    pub fn n_genes(&self) -> usize {
        self.counts.shape.1
    }

    pub fn counts(&self) -> &CompressedSparseData<u32> {
        &self.counts
    }

    pub fn cells(&self) -> &CellTable {
        &self.cells
    }

    pub fn genes(&self) -> &[String] {
        &self.genes
    }

    /// Cells per sample, in order of first appearance
    ///
    /// ### Returns
    ///
    /// Vector of `(sample, row indices)`.
    pub fn sample_indices(&self) -> Vec<(String, Vec<usize>)> {
        let mut res: Vec<(String, Vec<usize>)> = Vec::new();
        for (i, s) in self.cells.samples.iter().enumerate() {
            match res.iter_mut().find(|(name, _)| name == s) {
                Some((_, idx)) => idx.push(i),
                None => res.push((s.clone(), vec![i])),
            }
        }
        res
    }

    /// Numeric batch index per cell (order of first appearance)
    pub fn batch_labels(&self) -> Vec<usize> {
        let mut labels = vec![0; self.n_cells()];
        for (b, (_, idx)) in self.sample_indices().iter().enumerate() {
            for &i in idx {
                labels[i] = b;
            }
        }
        labels
    }

    /// Filter cells on the QC thresholds
    ///
    /// Cells with a total count of zero are always removed.
    ///
    /// ### Params
    ///
    /// * `qc` - The QC parameters.
    ///
    /// ### Returns
    ///
    /// A new store holding the surviving cells.
    pub fn filter_cells(&self, qc: &QcParams) -> Result<Self> {
        let max_features = qc.max_features.unwrap_or(usize::MAX);
        let keep: Vec<usize> = (0..self.n_cells())
            .filter(|&i| {
                let nf = self.cells.n_features[i];
                self.cells.total_counts[i] > 0
                    && nf >= qc.min_features
                    && nf <= max_features
                    && self.cells.mito_fraction[i] * 100.0 <= qc.max_mito_pct
            })
            .collect();

        log::info!(
            "Cell QC: kept {} of {} cells",
            keep.len(),
            self.n_cells()
        );

        Ok(Self {
            counts: self.counts.select_outer(&keep),
            cells: self.cells.select(&keep),
            genes: self.genes.clone(),
            mito_prefix: self.mito_prefix.clone(),
        })
    }

    /// Remove genes detected in fewer than `min_cells` cells
    ///
    /// ### Params
    ///
    /// * `min_cells` - Minimum number of cells with a non-zero count.
    ///
    /// ### Returns
    ///
    /// A new store; cell metrics are recomputed on the remaining genes.
    pub fn filter_genes(&self, min_cells: usize) -> Result<Self> {
        let mut detected = vec![0_usize; self.n_genes()];
        for &g in &self.counts.indices {
            detected[g] += 1;
        }
        let keep: Vec<usize> = (0..self.n_genes())
            .filter(|&g| detected[g] >= min_cells)
            .collect();

        log::info!(
            "Gene QC: kept {} of {} genes",
            keep.len(),
            self.n_genes()
        );

        Self::new(
            self.counts.select_inner(&keep),
            self.cells.ids.clone(),
            self.cells.samples.clone(),
            keep.iter().map(|&g| self.genes[g].clone()).collect(),
            &self.mito_prefix,
        )
    }

    /// Subset the store to the given cells (in the given order)
    pub fn select_cells(&self, keep: &[usize]) -> Self {
        Self {
            counts: self.counts.select_outer(keep),
            cells: self.cells.select(keep),
            genes: self.genes.clone(),
            mito_prefix: self.mito_prefix.clone(),
        }
    }
}

///////////
// Tests //
///////////
