//! Two-stage section extraction, the bounded scheduler that runs it, and
//! the merged run report.

pub mod types;
pub mod prompt;
pub mod kernel;
pub mod scheduler;
pub mod merge;

pub use types::*;
pub use prompt::*;
pub use kernel::*;
pub use scheduler::*;
pub use merge::*;

use thiserror::Error;

use crate::pipeline::llm::LlmError;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Text generation failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Structure synthesis produced no usable structure: {0}")]
    Synthesis(String),

    #[error("Field fill produced no usable values: {0}")]
    Fill(String),

    #[error("Section {section_id} refers to chunk {index}, which does not exist")]
    MissingChunk { section_id: usize, index: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
