use faer::Mat;
use rand::prelude::*;
use rand_distr::{Normal, Poisson};

use crate::core::data::sparse_structures::CompressedSparseData;
use crate::error::{Result, ScError};

////////////////
// Structures //
////////////////

/// Structure for synthetic single cell counts
///
/// ### Fields
///
/// * `counts` - Cells x genes counts in CSR.
/// * `groups` - Ground truth group of every cell.
#[derive(Clone, Debug)]
pub struct SyntheticCounts {
    pub counts: CompressedSparseData<u32>,
    pub groups: Vec<usize>,
}

/// Structure for a synthetic batch-affected embedding
///
/// ### Fields
///
/// * `embedding` - Cells x dimensions.
/// * `groups` - Biological group per cell.
/// * `batches` - Batch per cell.
#[derive(Clone, Debug)]
pub struct SyntheticEmbedding {
    pub embedding: Mat<f64>,
    pub groups: Vec<usize>,
    pub batches: Vec<usize>,
}

/////////////
// Helpers //
/////////////

fn poisson(lambda: f64) -> Result<Poisson<f64>> {
    Poisson::new(lambda)
        .map_err(|e| ScError::Config(format!("invalid Poisson rate {}: {}", lambda, e)))
}

fn normal(mean: f64, sd: f64) -> Result<Normal<f64>> {
    Normal::new(mean, sd)
        .map_err(|e| ScError::Config(format!("invalid normal ({}, {}): {}", mean, sd, e)))
}

/////////////////////
// Synthetic data  //
/////////////////////

/// Generate Poisson counts from well separated groups of cells
///
/// Genes are split into `n_groups` blocks; cells of group `g` express the
/// genes of block `g` at `high` and every other gene at `low`. Cells are
/// assigned to groups in contiguous runs.
///
/// ### Params
///
/// * `n_cells` - Number of cells.
/// * `n_genes` - Number of genes.
/// * `n_groups` - Number of groups.
/// * `high` - Poisson rate of the group-specific genes.
/// * `low` - Poisson rate of all other genes.
/// * `seed` - Seed for reproducibility purposes.
///
/// ### Returns
///
/// The `SyntheticCounts`.
pub fn generate_group_counts(
    n_cells: usize,
    n_genes: usize,
    n_groups: usize,
    high: f64,
    low: f64,
    seed: u64,
) -> Result<SyntheticCounts> {
    let mut rng = StdRng::seed_from_u64(seed);
    let high_dist = poisson(high)?;
    let low_dist = poisson(low)?;

    let groups: Vec<usize> = (0..n_cells).map(|i| i * n_groups / n_cells).collect();
    let genes_per_group = n_genes.div_ceil(n_groups);

    let rows: Vec<Vec<u32>> = groups
        .iter()
        .map(|&g| {
            (0..n_genes)
                .map(|j| {
                    let dist = if j / genes_per_group == g {
                        &high_dist
                    } else {
                        &low_dist
                    };
                    dist.sample(&mut rng) as u32
                })
                .collect()
        })
        .collect();

    let counts = CompressedSparseData::from_dense_rows(&rows, n_genes, 0)?;

    Ok(SyntheticCounts { counts, groups })
}

/// Generate an embedding with groups and an additive batch shift
///
/// ### Params
///
/// * `n_cells` - Number of cells.
/// * `n_groups` - Number of biological groups (centres on a simplex-like
///   layout, `separation` apart).
/// * `n_batches` - Number of batches; batch `b` is shifted by `b * shift`
///   along the last dimension.
/// * `dims` - Number of dimensions.
/// * `separation` - Distance scale between groups.
/// * `shift` - Size of the batch shift.
/// * `seed` - Seed for reproducibility purposes.
///
/// ### Returns
///
/// The `SyntheticEmbedding`.
pub fn generate_batch_embedding(
    n_cells: usize,
    n_groups: usize,
    n_batches: usize,
    dims: usize,
    separation: f64,
    shift: f64,
    seed: u64,
) -> Result<SyntheticEmbedding> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = normal(0.0, 1.0)?;

    let groups: Vec<usize> = (0..n_cells).map(|i| i % n_groups).collect();
    let batches: Vec<usize> = (0..n_cells).map(|i| (i / n_groups) % n_batches).collect();

    let mut embedding = Mat::<f64>::zeros(n_cells, dims);
    for i in 0..n_cells {
        for d in 0..dims {
            let centre = if d == groups[i] % dims.max(1) {
                separation
            } else {
                0.0
            };
            let batch_shift = if d + 1 == dims {
                batches[i] as f64 * shift
            } else {
                0.0
            };
            embedding[(i, d)] = centre + batch_shift + noise.sample(&mut rng);
        }
    }

    Ok(SyntheticEmbedding {
        embedding,
        groups,
        batches,
    })
}

/// Generate a non-negative matrix built from disjoint rank-1 programs
///
/// Cell `i` belongs to program `i % n_programs`; its values on the genes of
/// that program are `a_i * b_g` with positive random `a`, `b`; every other
/// entry is zero.
///
/// ### Params
///
/// * `n_cells` - Number of cells.
/// * `genes_per_program` - Signature genes per program.
/// * `n_programs` - Number of programs.
/// * `seed` - Seed for reproducibility purposes.
///
/// ### Returns
///
/// Tuple of `(matrix (cells x genes, CSR), program of each gene)`.
pub fn generate_program_matrix(
    n_cells: usize,
    genes_per_program: usize,
    n_programs: usize,
    seed: u64,
) -> Result<(CompressedSparseData<f64>, Vec<usize>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let n_genes = genes_per_program * n_programs;

    let cell_scale: Vec<f64> = (0..n_cells)
        .map(|_| 0.5 + rng.random::<f64>())
        .collect();
    let gene_weight: Vec<f64> = (0..n_genes)
        .map(|_| 0.5 + 2.0 * rng.random::<f64>())
        .collect();
    let gene_program: Vec<usize> = (0..n_genes).map(|g| g / genes_per_program).collect();

    let rows: Vec<Vec<f64>> = (0..n_cells)
        .map(|i| {
            let p = i % n_programs;
            (0..n_genes)
                .map(|g| {
                    if gene_program[g] == p {
                        cell_scale[i] * gene_weight[g]
                    } else {
                        0.0
                    }
                })
                .collect()
        })
        .collect();

    let matrix = CompressedSparseData::from_dense_rows(&rows, n_genes, 0.0)?;

    Ok((matrix, gene_program))
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_counts_shape_and_signal() {
        let data = generate_group_counts(40, 20, 2, 20.0, 1.0, 1).unwrap();
        assert_eq!(data.counts.shape, (40, 20));
        assert_eq!(data.groups.iter().filter(|&&g| g == 0).count(), 20);

        let dense = data.counts.to_dense();
        let mean_in: f64 = (0..20).map(|i| dense[(i, 0)]).sum::<f64>() / 20.0;
        let mean_out: f64 = (20..40).map(|i| dense[(i, 0)]).sum::<f64>() / 20.0;
        assert!(mean_in > 5.0 * mean_out);
    }

    #[test]
    fn test_program_matrix_disjoint() {
        let (mat, programs) = generate_program_matrix(10, 4, 2, 7).unwrap();
        assert_eq!(mat.shape, (10, 8));
        for i in 0..10 {
            let (idx, _) = mat.outer(i);
            assert!(idx.iter().all(|&g| programs[g] == i % 2));
        }
    }
}
