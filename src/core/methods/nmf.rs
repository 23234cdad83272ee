use faer::Mat;
use rand::prelude::*;
use rayon::prelude::*;
use std::time::Instant;

use crate::core::data::sparse_structures::*;
use crate::error::{PipelineWarning, Result, ScError};

/// Floor for the denominators of the multiplicative updates
const NMF_EPSILON: f64 = 1e-10;

////////////
// Params //
////////////

/// Parameters for the non-negative matrix factorisation
///
/// ### Fields
///
/// * `max_iter` - Maximum number of multiplicative update rounds.
/// * `tol` - Relative change of the reconstruction error to stop at.
/// * `seed` - Base seed for the initialisation.
#[derive(Clone, Debug)]
pub struct NmfParams {
    pub max_iter: usize,
    pub tol: f64,
    pub seed: u64,
}

impl Default for NmfParams {
    fn default() -> Self {
        Self {
            max_iter: 200,
            tol: 1e-4,
            seed: 42,
        }
    }
}

////////////////
// Structures //
////////////////

/// Factorisation `X ~ W H^T` of one sample at one rank
///
/// ### Fields
///
/// * `sample` - Sample the factorisation belongs to.
/// * `rank` - Number of components.
/// * `w` - Cells x rank usage matrix.
/// * `h` - Genes x rank program matrix.
/// * `reconstruction_error` - Frobenius norm of `X - W H^T`.
/// * `n_iter` - Number of update rounds.
/// * `converged` - Whether the tolerance was met.
/// * `warnings` - Convergence warnings.
#[derive(Clone, Debug)]
pub struct NmfFactorisation {
    pub sample: String,
    pub rank: usize,
    pub w: Mat<f64>,
    pub h: Mat<f64>,
    pub reconstruction_error: f64,
    pub n_iter: usize,
    pub converged: bool,
    pub warnings: Vec<PipelineWarning>,
}

/////////////
// Helpers //
/////////////

#[inline]
fn frobenius_sq(x: &CompressedSparseData<f64>) -> f64 {
    x.data.iter().map(|v| v * v).sum()
}

/// Sum of the element-wise product of two equally shaped matrices
#[inline]
fn elementwise_dot(a: &Mat<f64>, b: &Mat<f64>) -> f64 {
    a.col_iter()
        .zip(b.col_iter())
        .map(|(ca, cb)| ca.iter().zip(cb.iter()).map(|(x, y)| x * y).sum::<f64>())
        .sum()
}

/// `M <- M * numerator / max(denominator, eps)`
fn multiplicative_update(m: &Mat<f64>, numerator: &Mat<f64>, denominator: &Mat<f64>) -> Mat<f64> {
    Mat::from_fn(m.nrows(), m.ncols(), |i, j| {
        m[(i, j)] * numerator[(i, j)] / denominator[(i, j)].max(NMF_EPSILON)
    })
}

fn all_finite(m: &Mat<f64>) -> bool {
    m.col_iter().all(|c| c.iter().all(|v| v.is_finite()))
}

////////////////////
// Main functions //
////////////////////

/// Run NMF on a sparse non-negative matrix
///
/// Lee & Seung multiplicative updates for the Frobenius loss. `X H` and
/// `X^T W` are computed on the sparse data; the loss is evaluated as
/// `||X||^2 - 2 tr(W^T X H) + tr(W^T W H^T H)`.
///
/// ### Params
///
/// * `x` - Non-negative cells x genes matrix (CSR).
/// * `sample` - Name of the sample (for errors and warnings).
/// * `rank` - Number of components.
/// * `params` - The `NmfParams`.
///
/// ### Returns
///
/// The `NmfFactorisation` or a `SampleFactorisation` error if the input
/// has no signal or the updates produce non-finite values.
pub fn nmf_sparse(
    x: &CompressedSparseData<f64>,
    sample: &str,
    rank: usize,
    params: &NmfParams,
) -> Result<NmfFactorisation> {
    let fail = |reason: String| ScError::SampleFactorisation {
        sample: sample.to_string(),
        rank,
        reason,
    };

    let (n, m) = x.shape;
    if rank == 0 || n == 0 || m == 0 {
        return Err(fail(format!("cannot factorise a {}x{} matrix at rank {}", n, m, rank)));
    }
    if rank > n.min(m) {
        return Err(fail(format!(
            "rank {} exceeds the {} cells x {} genes of the sample",
            rank, n, m
        )));
    }
    if x.data.iter().any(|&v| v < 0.0 || !v.is_finite()) {
        return Err(fail("matrix contains negative or non-finite values".to_string()));
    }
    let total: f64 = x.data.iter().sum();
    if total <= 0.0 {
        return Err(fail("matrix has no positive entries".to_string()));
    }

    let x_csr = match x.cs_type {
        CompressedSparseFormat::Csr => x.clone(),
        CompressedSparseFormat::Csc => x.transform_format(),
    };
    let x_csc = x_csr.transform_format();

    let scale = (total / (n * m) as f64 / rank as f64).sqrt();
    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut w = Mat::from_fn(n, rank, |_, _| scale * rng.random::<f64>());
    let mut h = Mat::from_fn(m, rank, |_, _| scale * rng.random::<f64>());

    let x_norm_sq = frobenius_sq(&x_csr);
    let mut prev_error = f64::INFINITY;
    let mut error = f64::INFINITY;
    let mut converged = false;
    let mut n_iter = 0;

    for iter in 1..=params.max_iter {
        // W <- W * (X H) / (W H^T H)
        let xh = sparse_outer_times_dense(&x_csr, &h);
        let hth = h.transpose() * &h;
        let w_den = &w * &hth;
        w = multiplicative_update(&w, &xh, &w_den);

        // H <- H * (X^T W) / (H W^T W)
        let xtw = sparse_outer_times_dense(&x_csc, &w);
        let wtw = w.transpose() * &w;
        let h_den = &h * &wtw;
        h = multiplicative_update(&h, &xtw, &h_den);

        if !all_finite(&w) || !all_finite(&h) {
            return Err(fail(format!("non-finite values after {} iterations", iter)));
        }

        let hth = h.transpose() * &h;
        let cross = elementwise_dot(&xtw, &h);
        let gram = elementwise_dot(&wtw, &hth);
        error = (x_norm_sq - 2.0 * cross + gram).max(0.0).sqrt();
        n_iter = iter;

        if prev_error.is_finite() {
            let change = (prev_error - error).abs() / prev_error.max(NMF_EPSILON);
            if change < params.tol {
                converged = true;
                break;
            }
        }
        prev_error = error;
    }

    let mut warnings = Vec::new();
    if !converged {
        let warning = PipelineWarning::ConvergenceFailure {
            stage: format!("nmf[{}, rank {}]", sample, rank),
            iterations: n_iter,
        };
        log::warn!("{}", warning);
        warnings.push(warning);
    }

    Ok(NmfFactorisation {
        sample: sample.to_string(),
        rank,
        w,
        h,
        reconstruction_error: error,
        n_iter,
        converged,
        warnings,
    })
}

/// Run NMF for every sample at every rank in parallel
///
/// Each run gets its own seed derived from `params.seed`, the sample
/// position and the rank, so results do not depend on scheduling.
///
/// ### Params
///
/// * `samples` - Tuples of `(sample name, cells x genes matrix)`.
/// * `ranks` - Ranks to factorise at.
/// * `params` - The `NmfParams`.
///
/// ### Returns
///
/// One result per `(sample, rank)`, ordered by sample then rank.
pub fn run_nmf_grid(
    samples: &[(String, CompressedSparseData<f64>)],
    ranks: &[usize],
    params: &NmfParams,
) -> Vec<Result<NmfFactorisation>> {
    let start = Instant::now();

    let jobs: Vec<(usize, usize)> = (0..samples.len())
        .flat_map(|s| ranks.iter().map(move |&r| (s, r)))
        .collect();

    let res: Vec<Result<NmfFactorisation>> = jobs
        .par_iter()
        .map(|&(s, rank)| {
            let (name, x) = &samples[s];
            let run_params = NmfParams {
                seed: params
                    .seed
                    .wrapping_add((s as u64) << 16)
                    .wrapping_add(rank as u64),
                ..params.clone()
            };
            nmf_sparse(x, name, rank, &run_params)
        })
        .collect();

    log::info!(
        "NMF: {} samples x {} ranks in {:.2?}",
        samples.len(),
        ranks.len(),
        start.elapsed()
    );

    res
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::synthetic_data::generate_program_matrix;

    #[test]
    fn test_recovers_disjoint_programs() {
        let (x, gene_program) = generate_program_matrix(60, 10, 2, 4).unwrap();
        let params = NmfParams {
            max_iter: 1000,
            tol: 1e-10,
            seed: 1,
        };
        let res = nmf_sparse(&x, "s1", 2, &params).unwrap();

        assert_eq!(res.w.nrows(), 60);
        assert_eq!(res.h.nrows(), 20);
        assert!(res.w.col_iter().all(|c| c.iter().all(|&v| v >= 0.0)));
        assert!(res.h.col_iter().all(|c| c.iter().all(|&v| v >= 0.0)));

        let mut dominant = Vec::new();
        for c in 0..2 {
            let total: f64 = res.h.col(c).iter().sum();
            let per_program: Vec<f64> = (0..2)
                .map(|p| {
                    (0..20)
                        .filter(|&g| gene_program[g] == p)
                        .map(|g| res.h[(g, c)])
                        .sum::<f64>()
                })
                .collect();
            let best = if per_program[0] >= per_program[1] { 0 } else { 1 };
            assert!(per_program[best] / total > 0.9);
            dominant.push(best);
        }
        dominant.sort_unstable();
        assert_eq!(dominant, vec![0, 1]);

        let x_norm = frobenius_sq(&x).sqrt();
        assert!(res.reconstruction_error < 0.1 * x_norm);
    }

    #[test]
    fn test_error_matches_dense_residual() {
        let (x, _) = generate_program_matrix(12, 3, 2, 8).unwrap();
        let params = NmfParams {
            max_iter: 5,
            tol: 0.0,
            seed: 3,
        };
        let res = nmf_sparse(&x, "s", 2, &params).unwrap();

        let dense = x.to_dense();
        let approx = res.w.as_ref() * res.h.transpose();
        let mut sq = 0.0;
        for i in 0..12 {
            for j in 0..6 {
                sq += (dense[(i, j)] - approx[(i, j)]).powi(2);
            }
        }
        assert!((sq.sqrt() - res.reconstruction_error).abs() < 1e-8);
        assert!(!res.converged);
        assert_eq!(res.warnings.len(), 1);
    }

    #[test]
    fn test_zero_matrix_fails() {
        let x = CompressedSparseData::from_dense_rows(&[vec![0.0, 0.0], vec![0.0, 0.0]], 2, 0.0)
            .unwrap();
        let res = nmf_sparse(&x, "empty", 2, &NmfParams::default());
        assert!(matches!(res, Err(ScError::SampleFactorisation { .. })));
    }

    #[test]
    fn test_rank_above_cell_count_fails() {
        let x = CompressedSparseData::from_dense_rows(&[vec![1.0, 2.0, 3.0], vec![2.0, 0.0, 1.0]], 3, 0.0)
            .unwrap();
        let res = nmf_sparse(&x, "tiny", 3, &NmfParams::default());
        assert!(matches!(
            res,
            Err(ScError::SampleFactorisation { rank: 3, .. })
        ));
        assert!(nmf_sparse(&x, "tiny", 2, &NmfParams::default()).is_ok());
    }

    #[test]
    fn test_grid_order_and_determinism() {
        let (x, _) = generate_program_matrix(20, 4, 2, 2).unwrap();
        let samples = vec![("a".to_string(), x.clone()), ("b".to_string(), x)];
        let params = NmfParams {
            max_iter: 20,
            ..Default::default()
        };
        let first = run_nmf_grid(&samples, &[2, 3], &params);
        let second = run_nmf_grid(&samples, &[2, 3], &params);

        let keys: Vec<(String, usize)> = first
            .iter()
            .map(|r| {
                let f = r.as_ref().unwrap();
                (f.sample.clone(), f.rank)
            })
            .collect();
        assert_eq!(
            keys,
            vec![
                ("a".to_string(), 2),
                ("a".to_string(), 3),
                ("b".to_string(), 2),
                ("b".to_string(), 3)
            ]
        );
        for (a, b) in first.iter().zip(second.iter()) {
            let (a, b) = (a.as_ref().unwrap(), b.as_ref().unwrap());
            assert_eq!(a.reconstruction_error, b.reconstruction_error);
        }
    }
}
