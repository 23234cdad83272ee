//! Error and warning types shared by all stages.
//!
//! Structural problems (malformed input, inconsistent dimensions, invalid
//! configuration) are returned as `ScError` and stop the pipeline. Numerical
//! degradations are recorded as `PipelineWarning` values on the artifact they
//! affect so downstream consumers can detect reduced confidence.

use serde::Serialize;
use thiserror::Error;

////////////
// Errors //
////////////

/// Fatal errors of the pipeline
#[derive(Debug, Error)]
pub enum ScError {
    /// Malformed matrix or metadata
    #[error("input format error: {0}")]
    InputFormat(String),

    /// Inconsistent sizes between matrix parts or tables
    #[error("dimension mismatch in {what}: expected {expected}, found {found}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        found: usize,
    },

    /// A cell with zero total count reached the normaliser
    #[error("cell '{cell}' has a total count of zero and cannot be normalised")]
    DegenerateCell { cell: String },

    /// Invalid or inconsistent configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// A single NMF run blew up
    #[error("NMF failed for sample '{sample}' at rank {rank}: {reason}")]
    SampleFactorisation {
        sample: String,
        rank: usize,
        reason: String,
    },

    /// Failure inside a dense linear algebra routine
    #[error("numerical error: {0}")]
    Numerical(String),

    #[error("artifact '{0}' not found")]
    MissingArtifact(String),

    #[error("artifact '{0}' already exists")]
    DuplicateArtifact(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ScError>;

//////////////
// Warnings //
//////////////

/// Non-fatal conditions attached to output artifacts
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
pub enum PipelineWarning {
    /// Gene with zero standard deviation, scaled values fixed at 0
    #[error("gene '{gene}' has zero variance; scaled values fixed at 0")]
    ZeroVariance { gene: String },

    /// Iterative stage ran out of iterations before meeting its tolerance
    #[error("{stage} did not converge within {iterations} iterations")]
    ConvergenceFailure { stage: String, iterations: usize },

    /// Cluster without members (or without any cells outside of it)
    #[error("cluster {cluster} skipped: {reason}")]
    EmptyCluster { cluster: usize, reason: String },

    /// NMF run excluded from the consensus
    #[error("sample '{sample}' at rank {rank} skipped: {reason}")]
    SampleSkipped {
        sample: String,
        rank: usize,
        reason: String,
    },

    /// NMF component without any gene weight, left out of the consensus
    #[error("component {component} of sample '{sample}' at rank {rank} has no weight; dropped")]
    ProgramDropped {
        sample: String,
        rank: usize,
        component: usize,
    },
}
