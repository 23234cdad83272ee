//! Stage composition, configuration and tabular input/output

pub mod artifacts;
pub mod config;
pub mod input;
pub mod output;
pub mod runner;
