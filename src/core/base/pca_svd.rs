use faer::{Mat, MatRef};
use rand::prelude::*;
use rand_distr::Normal;

use crate::error::{Result, ScError};

////////////////
// Structures //
////////////////

/// Structure for (truncated) SVD results
///
/// ### Fields
///
/// * `u` - Left singular vectors (nrow x rank)
/// * `v` - Right singular vectors (ncol x rank)
/// * `s` - Singular values, descending
#[derive(Clone, Debug)]
pub struct SvdResults {
    pub u: Mat<f64>,
    pub v: Mat<f64>,
    pub s: Vec<f64>,
}

/// Structure for the PCA results
///
/// ### Fields
///
/// * `scores` - Cell scores (`U * S`), samples x components.
/// * `loadings` - Feature loadings, features x components.
/// * `singular_values` - Singular values per component.
/// * `stdev` - Standard deviation of the scores per component.
#[derive(Clone, Debug)]
pub struct PcaResults {
    pub scores: Mat<f64>,
    pub loadings: Mat<f64>,
    pub singular_values: Vec<f64>,
    pub stdev: Vec<f64>,
}

///////////////
// Functions //
///////////////

/// Exact thin SVD, truncated to `rank` components
///
/// ### Params
///
/// * `x` - The matrix to decompose.
/// * `rank` - Number of components to keep.
///
/// ### Returns
///
/// The `SvdResults` or a `Numerical` error if faer fails to converge.
pub fn exact_svd(x: MatRef<f64>, rank: usize) -> Result<SvdResults> {
    let svd = x
        .thin_svd()
        .map_err(|e| ScError::Numerical(format!("thin SVD failed: {:?}", e)))?;

    let rank = rank.min(x.nrows()).min(x.ncols());

    Ok(SvdResults {
        u: svd.U().submatrix(0, 0, x.nrows(), rank).to_owned(),
        v: svd.V().submatrix(0, 0, x.ncols(), rank).to_owned(),
        s: svd
            .S()
            .column_vector()
            .iter()
            .take(rank)
            .copied()
            .collect(),
    })
}

/// Randomised SVD
///
/// ### Params
///
/// * `x` - The matrix on which to apply the randomised SVD.
/// * `rank` - The target rank of the approximation (number of singular values,
///   vectors to compute).
/// * `seed` - Random seed for reproducible results.
/// * `oversampling` - Additional samples beyond the target rank to improve
///   accuracy. Defaults to 10 if not specified.
/// * `n_power_iter` - Number of power iterations to perform for better
///   approximation quality. Defaults to 2 if not specified.
///
/// ### Returns
///
/// The randomised SVD results in form of `SvdResults`.
///
/// ### Algorithm Details
///
/// 1. Generate a random Gaussian matrix Ω of size n × (rank + oversampling)
/// 2. Compute Y = X * Ω to capture the range of X
/// 3. Orthogonalize Y using QR decomposition to get Q
/// 4. Apply power iterations: Z = X^T * Q, then Q = QR(X * Z)
/// 5. Form B = Q^T * X and compute its SVD
/// 6. Reconstruct the final SVD: U = Q * U_B, V = V_B, S = S_B
pub fn randomised_svd(
    x: MatRef<f64>,
    rank: usize,
    seed: u64,
    oversampling: Option<usize>,
    n_power_iter: Option<usize>,
) -> Result<SvdResults> {
    let ncol = x.ncols();
    let nrow = x.nrows();

    let os = oversampling.unwrap_or(10);
    let sample_size = (rank + os).min(ncol.min(nrow));
    let n_iter = n_power_iter.unwrap_or(2);
    let rank = rank.min(sample_size);

    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0)
        .map_err(|e| ScError::Numerical(format!("normal distribution: {}", e)))?;
    let omega = Mat::from_fn(ncol, sample_size, |_, _| normal.sample(&mut rng));

    let y = x * omega;

    let mut q = y.qr().compute_thin_Q();
    for _ in 0..n_iter {
        let z = x.transpose() * &q;
        q = (x * z).qr().compute_thin_Q();
    }

    let b = q.transpose() * x;
    let svd = b
        .thin_svd()
        .map_err(|e| ScError::Numerical(format!("randomised SVD failed: {:?}", e)))?;

    let u = &q * svd.U();

    Ok(SvdResults {
        u: u.as_ref().submatrix(0, 0, nrow, rank).to_owned(),
        v: svd.V().submatrix(0, 0, ncol, rank).to_owned(),
        s: svd
            .S()
            .column_vector()
            .iter()
            .take(rank)
            .copied()
            .collect(),
    })
}

/// PCA on a (samples x features) matrix
///
/// Columns are centred before the decomposition. Components are ordered by
/// decreasing singular value and the sign of every component is fixed so
/// that its largest-magnitude loading is positive.
///
/// ### Params
///
/// * `x` - Samples x features.
/// * `n_comp` - Number of components; capped at `min(nrow, ncol)`.
/// * `random_svd` - Use the randomised SVD instead of the exact one.
/// * `seed` - Seed for the randomised SVD.
///
/// ### Returns
///
/// The `PcaResults`.
pub fn pca(x: MatRef<f64>, n_comp: usize, random_svd: bool, seed: u64) -> Result<PcaResults> {
    let (nrow, ncol) = (x.nrows(), x.ncols());
    let n_comp = n_comp.min(nrow).min(ncol);

    let means: Vec<f64> = (0..ncol)
        .map(|j| x.col(j).iter().sum::<f64>() / nrow.max(1) as f64)
        .collect();
    let centred = Mat::from_fn(nrow, ncol, |i, j| x[(i, j)] - means[j]);

    let svd = if random_svd {
        randomised_svd(centred.as_ref(), n_comp, seed, None, None)?
    } else {
        exact_svd(centred.as_ref(), n_comp)?
    };

    let mut order: Vec<usize> = (0..svd.s.len()).collect();
    order.sort_by(|&a, &b| svd.s[b].total_cmp(&svd.s[a]).then(a.cmp(&b)));

    let n_out = order.len();
    let mut scores = Mat::<f64>::zeros(nrow, n_out);
    let mut loadings = Mat::<f64>::zeros(ncol, n_out);
    let mut singular_values = Vec::with_capacity(n_out);

    for (c, &src) in order.iter().enumerate() {
        let (mut max_abs, mut sign) = (0.0_f64, 1.0_f64);
        for g in 0..ncol {
            let v = svd.v[(g, src)];
            if v.abs() > max_abs {
                max_abs = v.abs();
                sign = if v < 0.0 { -1.0 } else { 1.0 };
            }
        }

        let s = svd.s[src];
        for g in 0..ncol {
            loadings[(g, c)] = sign * svd.v[(g, src)];
        }
        for i in 0..nrow {
            scores[(i, c)] = sign * svd.u[(i, src)] * s;
        }
        singular_values.push(s);
    }

    let denom = (nrow.saturating_sub(1)).max(1) as f64;
    let stdev = singular_values.iter().map(|s| s / denom.sqrt()).collect();

    Ok(PcaResults {
        scores,
        loadings,
        singular_values,
        stdev,
    })
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn test_matrix() -> Mat<f64> {
        let mut rng = StdRng::seed_from_u64(1);
        Mat::from_fn(60, 12, |i, j| {
            let signal = if j < 6 { (i % 3) as f64 } else { (i % 5) as f64 * 0.5 };
            signal + rng.random::<f64>() * 0.1
        })
    }

    #[test]
    fn test_pca_orthogonal_and_sorted() {
        let x = test_matrix();
        let res = pca(x.as_ref(), 5, false, 42).unwrap();

        assert_eq!(res.scores.ncols(), 5);
        for a in 0..5 {
            for b in (a + 1)..5 {
                let dot_l: f64 = (0..12).map(|g| res.loadings[(g, a)] * res.loadings[(g, b)]).sum();
                let dot_s: f64 = (0..60).map(|i| res.scores[(i, a)] * res.scores[(i, b)]).sum();
                assert_relative_eq!(dot_l, 0.0, epsilon = 1e-8);
                assert_relative_eq!(dot_s, 0.0, epsilon = 1e-6);
            }
        }
        for w in res.singular_values.windows(2) {
            assert!(w[0] >= w[1]);
        }
    }

    #[test]
    fn test_sign_convention() {
        let x = test_matrix();
        let res = pca(x.as_ref(), 3, false, 42).unwrap();
        for c in 0..3 {
            let max = (0..12)
                .map(|g| res.loadings[(g, c)])
                .max_by(|a, b| a.abs().total_cmp(&b.abs()))
                .unwrap();
            assert!(max > 0.0);
        }
    }

    #[test]
    fn test_randomised_matches_exact() {
        let x = test_matrix();
        let exact = pca(x.as_ref(), 2, false, 42).unwrap();
        let random = pca(x.as_ref(), 2, true, 42).unwrap();

        for c in 0..2 {
            assert_relative_eq!(
                exact.singular_values[c],
                random.singular_values[c],
                max_relative = 1e-6
            );
        }
    }

    #[test]
    fn test_components_capped() {
        let x = Mat::from_fn(4, 3, |i, j| (i * j) as f64 + i as f64);
        let res = pca(x.as_ref(), 50, false, 42).unwrap();
        assert_eq!(res.scores.ncols(), 3);
        assert_eq!(res.stdev.len(), 3);
    }
}
