//! Text-generation service boundary.
//!
//! Every consumer (partitioner, kernel, evaluator) talks to the model through
//! the injected `LlmClient` trait and reads its output through the shared
//! `response` normalization adapter.

pub mod types;
pub mod ollama;
pub mod response;
pub mod sanitize;

pub use types::*;
pub use ollama::*;
pub use response::*;
pub use sanitize::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Ollama is not running at {0}")]
    Connection(String),

    #[error("Ollama returned error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("No compatible model available")]
    NoModelAvailable,

    #[error("Model '{0}' does not accept image inputs")]
    VisionUnsupported(String),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Malformed model response: {0}")]
    MalformedResponse(String),

    #[error("Response parsing error: {0}")]
    ResponseParsing(String),
}

impl LlmError {
    /// True when the failure means the model cannot take image input, so
    /// the same request is worth retrying without images.
    pub fn is_image_rejection(&self) -> bool {
        match self {
            LlmError::VisionUnsupported(_) => true,
            LlmError::Api { status, body } => *status >= 400 && body_rejects_images(body),
            _ => false,
        }
    }
}

/// Whether an error body from the model server complains about image input.
pub(crate) fn body_rejects_images(body: &str) -> bool {
    let lower = body.to_lowercase();
    ["image", "vision", "multimodal"]
        .iter()
        .any(|needle| lower.contains(needle))
}
