//! Parsed-document chunks and the cache that guarantees one parse per document.

pub mod types;
pub mod parser;
pub mod store;
pub mod cache;

pub use types::*;
pub use parser::*;
pub use store::*;
pub use cache::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parsing service returned error (status {status}): {body}")]
    ParserService { status: u16, body: String },

    #[error("Parsing service HTTP error: {0}")]
    HttpClient(String),

    #[error("Parsing service response unreadable: {0}")]
    ResponseParsing(String),

    #[error("Parsing service API key not set (expected env var {0})")]
    MissingApiKey(String),

    #[error("Invalid document path: {0}")]
    InvalidDocument(String),

    #[error("Cache store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Cache store lock poisoned")]
    StoreLock,

    #[error("Cache serialization error: {0}")]
    Serialization(String),
}
