//! Matrix factorisation and the consensus built on top of it

pub mod meta_programs;
pub mod nmf;
