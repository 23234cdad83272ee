//! Module containing key statistic functions that include loess fits,
//! PCA/SVD, rank-based tests and matrix helpers.

pub mod loess;
pub mod pca_svd;
pub mod stats;
pub mod utils;
