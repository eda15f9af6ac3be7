use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::parser::DocumentParser;
use super::store::ChunkStore;
use super::types::Chunk;
use super::ChunkError;

/// Characters of the URL-safe base64 content digest appended to the stem.
const HASH_PREFIX_LEN: usize = 16;

/// How a document path maps to its cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKeyStrategy {
    /// File name without extension. Two files sharing a stem share an entry.
    #[default]
    FileStem,
    /// `<stem>-<sha256 prefix>` of the file bytes.
    ContentHash,
}

impl CacheKeyStrategy {
    pub fn key_for(&self, document: &Path) -> Result<String, ChunkError> {
        let stem = document
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ChunkError::InvalidDocument(document.display().to_string()))?;

        match self {
            CacheKeyStrategy::FileStem => Ok(stem.to_string()),
            CacheKeyStrategy::ContentHash => {
                let bytes = std::fs::read(document)?;
                let digest = content_digest(&bytes);
                Ok(format!("{stem}-{}", &digest[..HASH_PREFIX_LEN]))
            }
        }
    }
}

/// SHA-256 of `bytes`, URL-safe base64 without padding (file-name safe).
fn content_digest(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hash)
}

/// Result of a cache lookup.
#[derive(Debug, Clone)]
pub struct CachedChunks {
    pub key: String,
    pub chunks: Vec<Chunk>,
    /// `true` when served from the store without calling the parser.
    pub hit: bool,
}

/// Parse-once cache in front of the document parser.
pub struct ChunkCache {
    parser: Box<dyn DocumentParser>,
    store: Arc<dyn ChunkStore>,
    strategy: CacheKeyStrategy,
}

impl ChunkCache {
    pub fn new(
        parser: Box<dyn DocumentParser>,
        store: Arc<dyn ChunkStore>,
        strategy: CacheKeyStrategy,
    ) -> Self {
        Self {
            parser,
            store,
            strategy,
        }
    }

    pub fn key_for(&self, document: &Path) -> Result<String, ChunkError> {
        self.strategy.key_for(document)
    }

    /// Return cached chunks for `document`, parsing it on first request.
    ///
    /// Parser failures are returned as-is and nothing is cached for them.
    pub fn fetch(&self, document: &Path) -> Result<CachedChunks, ChunkError> {
        let key = self.key_for(document)?;

        if let Some(chunks) = self.store.load_chunks(&key)? {
            tracing::info!(doc_key = %key, chunk_count = chunks.len(), "Chunk cache hit");
            return Ok(CachedChunks {
                key,
                chunks,
                hit: true,
            });
        }

        tracing::info!(doc_key = %key, "Chunk cache miss, parsing document");
        let mut chunks = self.parser.parse(document)?;
        for (position, chunk) in chunks.iter_mut().enumerate() {
            chunk.index = position;
        }
        self.store.save_chunks(&key, &chunks)?;

        Ok(CachedChunks {
            key,
            chunks,
            hit: false,
        })
    }

    pub fn get_or_parse(&self, document: &Path) -> Result<Vec<Chunk>, ChunkError> {
        Ok(self.fetch(document)?.chunks)
    }
}
