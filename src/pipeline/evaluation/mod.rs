//! Weighted quality evaluation of filled structures.
//!
//! Filled values are flattened to dotted paths, each populated path is
//! scored 1–100 against the transcript, and the weighted mean decides
//! whether the run should go to human review.

pub mod flatten;
pub mod weights;
pub mod evaluator;

pub use flatten::*;
pub use weights::*;
pub use evaluator::*;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("Cannot read weight table {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid weight table JSON: {0}")]
    Parse(String),

    #[error("Invalid weight {weight} for path '{path}' (must be positive and finite)")]
    InvalidWeight { path: String, weight: f64 },
}
