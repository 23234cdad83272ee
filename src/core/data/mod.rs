//! Module containing anything and everything related to data and data
//! structures

pub mod sparse_structures;
pub mod synthetic_data;
