//! Building blocks that are not specific to single cell data

pub mod base;
pub mod data;
pub mod graph;
pub mod methods;
