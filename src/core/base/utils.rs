use faer::{
    linalg::solvers::{PartialPivLu, Solve},
    Mat, MatRef,
};
use rayon::prelude::*;

use crate::error::{Result, ScError};

////////////////////
// Util functions //
////////////////////

/// Calculates the columns means of a matrix
///
/// ### Params
///
/// * `mat` - The matrix for which to calculate the column-wise means
///
/// ### Returns
///
/// Vector of the column means.
pub fn col_means(mat: MatRef<f64>) -> Vec<f64> {
    let n_rows = mat.nrows().max(1) as f64;
    (0..mat.ncols())
        .map(|j| mat.col(j).iter().sum::<f64>() / n_rows)
        .collect()
}

/// Calculate the column standard deviations
///
/// Sample standard deviation (n - 1), computed with Welford's algorithm.
///
/// ### Params
///
/// * `mat` - The matrix for which to calculate the column-wise standard
///   deviations
///
/// ### Returns
///
/// Vector of the column standard deviations.
pub fn col_sds(mat: MatRef<f64>) -> Vec<f64> {
    let n = mat.nrows() as f64;

    (0..mat.ncols())
        .map(|j| {
            let mut mean = 0.0;
            let mut m2 = 0.0;
            let mut count = 0.0;

            for i in 0..mat.nrows() {
                count += 1.0;
                let delta = mat[(i, j)] - mean;
                mean += delta / count;
                let delta2 = mat[(i, j)] - mean;
                m2 += delta * delta2;
            }
            if n > 1.0 {
                (m2 / (n - 1.0)).sqrt()
            } else {
                0.0
            }
        })
        .collect()
}

/// Row wise L2 normalisation
///
/// Rows with a norm below `1e-10` are left untouched.
///
/// ### Params
///
/// * `mat` - The matrix on which to apply row-wise L2 normalisation
///
/// ### Returns
///
/// The matrix with the rows being L2 normalised.
pub fn normalise_matrix_row_l2(mat: MatRef<f64>) -> Mat<f64> {
    let norms: Vec<f64> = (0..mat.nrows())
        .map(|i| mat.row(i).iter().map(|x| x * x).sum::<f64>().sqrt())
        .collect();

    Mat::from_fn(mat.nrows(), mat.ncols(), |i, j| {
        if norms[i] > 1e-10 {
            mat[(i, j)] / norms[i]
        } else {
            mat[(i, j)]
        }
    })
}

/// Regress out covariates from every column of a matrix
///
/// Fits an ordinary least squares model with intercept per column of `y`
/// (normal equations solved via LU) and returns the residuals. Covariates
/// are standardised first; constant covariates are dropped.
///
/// ### Params
///
/// * `y` - Samples x features.
/// * `covariates` - Samples x covariates.
///
/// ### Returns
///
/// The residual matrix or a `Numerical` error if the system is singular.
pub fn regress_out(y: MatRef<f64>, covariates: MatRef<f64>) -> Result<Mat<f64>> {
    let n = y.nrows();
    if covariates.nrows() != n {
        return Err(ScError::DimensionMismatch {
            what: "covariate rows".to_string(),
            expected: n,
            found: covariates.nrows(),
        });
    }

    let means = col_means(covariates);
    let sds = col_sds(covariates);
    let kept: Vec<usize> = (0..covariates.ncols())
        .filter(|&j| sds[j] > 1e-12)
        .collect();

    let p = kept.len() + 1;
    let design = Mat::from_fn(n, p, |i, j| {
        if j == 0 {
            1.0
        } else {
            let c = kept[j - 1];
            (covariates[(i, c)] - means[c]) / sds[c]
        }
    });

    let xtx = design.transpose() * &design;
    let xty = design.transpose() * y;

    let lu = PartialPivLu::new(xtx.as_ref());
    let beta = lu.solve(&xty);

    if beta.col_iter().any(|c| c.iter().any(|v| !v.is_finite())) {
        return Err(ScError::Numerical(
            "covariate regression produced non-finite coefficients".to_string(),
        ));
    }

    let fitted = &design * &beta;
    let n_cols = y.ncols();
    let cols: Vec<Vec<f64>> = (0..n_cols)
        .into_par_iter()
        .map(|j| (0..n).map(|i| y[(i, j)] - fitted[(i, j)]).collect())
        .collect();

    Ok(Mat::from_fn(n, n_cols, |i, j| cols[j][i]))
}

/// Cosine similarity between two slices
///
/// ### Returns
///
/// The cosine similarity; 0 if either vector has zero norm.
#[inline]
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let mut dot = 0.0;
    let mut na = 0.0;
    let mut nb = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na <= 0.0 || nb <= 0.0 {
        0.0
    } else {
        dot / (na.sqrt() * nb.sqrt())
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_col_stats() {
        let mat = Mat::from_fn(4, 2, |i, j| (i + j * 10) as f64);
        assert_eq!(col_means(mat.as_ref()), vec![1.5, 11.5]);
        let sds = col_sds(mat.as_ref());
        assert_relative_eq!(sds[0], (5.0_f64 / 3.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_regress_out_linear_signal() {
        let n = 50;
        let cov = Mat::from_fn(n, 1, |i, _| i as f64);
        let y = Mat::from_fn(n, 2, |i, j| {
            let noise = if i % 2 == 0 { 0.5 } else { -0.5 };
            3.0 * i as f64 + j as f64 * 7.0 + noise
        });

        let res = regress_out(y.as_ref(), cov.as_ref()).unwrap();
        for j in 0..2 {
            let mean: f64 = res.col(j).iter().sum::<f64>() / n as f64;
            assert_relative_eq!(mean, 0.0, epsilon = 1e-8);
            // remaining residuals hold the alternating noise only
            for i in 0..n {
                assert!(res[(i, j)].abs() < 0.6);
            }
        }
    }

    #[test]
    fn test_row_l2_and_cosine() {
        let mat = Mat::from_fn(2, 2, |i, j| if i == 0 { 3.0 + j as f64 } else { 0.0 });
        let norm = normalise_matrix_row_l2(mat.as_ref());
        assert_relative_eq!(norm[(0, 0)], 0.6);
        assert_relative_eq!(norm[(0, 1)], 0.8);
        assert_eq!(norm[(1, 0)], 0.0);

        assert_relative_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 1.0]), 1.0 / 2.0_f64.sqrt());
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
