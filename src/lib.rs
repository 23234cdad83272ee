//! Single-cell clustering and cross-sample NMF meta-programs.
//!
//! The library is organised like this:
//!
//! - `core` holds the domain agnostic building blocks (sparse matrices,
//!   loess, PCA, rank statistics, kNN and SNN graphs, Louvain, NMF and the
//!   meta-program consensus).
//! - `single_cell` applies them to count matrices (QC, normalisation,
//!   feature selection, scaling, batch correction, clustering and markers).
//! - `pipeline` wires the stages into an artifact store and reads/writes
//!   the tabular inputs and outputs.

pub mod core;
pub mod error;
pub mod pipeline;
pub mod single_cell;
pub mod utils;
