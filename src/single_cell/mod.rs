//! Contains the core single cell functionalities. There are dependencies on
//! other parts of the crate, specifically around the generation of kNN
//! graphs, sparse matrix methods, etc.

pub mod batch_corrections;
pub mod clustering;
pub mod dge;
pub mod labels;
pub mod matrix_store;
pub mod processing;
pub mod sc_knn_snn;
