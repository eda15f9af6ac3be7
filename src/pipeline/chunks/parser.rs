//! Document parsing service client.
//!
//! The parsing service segments a document into layout chunks with page and
//! box grounding. It is expensive, so callers reach it only through
//! `ChunkCache`.

use std::path::Path;

use serde::Deserialize;

use super::types::{Chunk, NormalizedBox};
use super::ChunkError;

/// Parsing service abstraction (allows mocking).
pub trait DocumentParser: Send + Sync {
    /// Parse a document into chunks in document order.
    fn parse(&self, document: &Path) -> Result<Vec<Chunk>, ChunkError>;
}

/// HTTP client for an agentic document-analysis endpoint.
///
/// Uploads the file as multipart (`pdf` for PDFs, `image` otherwise) and
/// reads back `chunks` (top-level or under `data`).
pub struct HttpDocumentParser {
    endpoint: String,
    api_key: String,
    client: reqwest::blocking::Client,
}

impl HttpDocumentParser {
    pub fn new(endpoint: &str, api_key: &str, timeout_secs: u64) -> Result<Self, ChunkError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ChunkError::HttpClient(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
            client,
        })
    }

    /// Build from an endpoint and the name of the env var holding the key.
    pub fn from_env(endpoint: &str, api_key_env: &str, timeout_secs: u64) -> Result<Self, ChunkError> {
        let api_key = std::env::var(api_key_env)
            .map_err(|_| ChunkError::MissingApiKey(api_key_env.to_string()))?;
        Self::new(endpoint, &api_key, timeout_secs)
    }
}

impl DocumentParser for HttpDocumentParser {
    fn parse(&self, document: &Path) -> Result<Vec<Chunk>, ChunkError> {
        let _span = tracing::info_span!("parse_document", document = %document.display()).entered();
        let start = std::time::Instant::now();

        let field = if is_pdf(document) { "pdf" } else { "image" };
        let form = reqwest::blocking::multipart::Form::new().file(field, document)?;

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .map_err(|e| ChunkError::HttpClient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ChunkError::ParserService {
                status: status.as_u16(),
                body,
            });
        }

        let raw: RawParseResponse = response
            .json()
            .map_err(|e| ChunkError::ResponseParsing(e.to_string()))?;
        let chunks = chunks_from_response(raw);

        tracing::info!(
            chunk_count = chunks.len(),
            elapsed_ms = %start.elapsed().as_millis(),
            "Document parsed"
        );
        Ok(chunks)
    }
}

fn is_pdf(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("pdf"))
        .unwrap_or(false)
}

// ── Wire format ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct RawParseResponse {
    #[serde(default)]
    chunks: Vec<RawChunk>,
    #[serde(default)]
    data: Option<RawData>,
}

#[derive(Debug, Deserialize)]
struct RawData {
    #[serde(default)]
    chunks: Vec<RawChunk>,
}

#[derive(Debug, Deserialize)]
struct RawChunk {
    #[serde(default, alias = "markdown")]
    text: String,
    #[serde(default, alias = "type")]
    chunk_type: String,
    #[serde(default)]
    grounding: Vec<RawGrounding>,
}

#[derive(Debug, Deserialize)]
struct RawGrounding {
    page: Option<usize>,
    #[serde(rename = "box")]
    bbox: Option<RawBox>,
}

#[derive(Debug, Deserialize)]
struct RawBox {
    #[serde(alias = "l")]
    left: f32,
    #[serde(alias = "t")]
    top: f32,
    #[serde(alias = "r")]
    right: f32,
    #[serde(alias = "b")]
    bottom: f32,
}

/// Convert the wire response into chunks indexed by position.
///
/// Only the first grounding entry of a chunk is kept; chunks spanning pages
/// are anchored to where they start.
pub(crate) fn chunks_from_response(raw: RawParseResponse) -> Vec<Chunk> {
    let raw_chunks = if raw.chunks.is_empty() {
        raw.data.map(|d| d.chunks).unwrap_or_default()
    } else {
        raw.chunks
    };

    raw_chunks
        .into_iter()
        .enumerate()
        .map(|(index, rc)| {
            let grounding = rc.grounding.into_iter().next();
            let (page, bbox) = match grounding {
                Some(g) => (
                    g.page,
                    g.bbox
                        .map(|b| NormalizedBox::new(b.left, b.top, b.right, b.bottom)),
                ),
                None => (None, None),
            };
            let chunk_kind = if rc.chunk_type.is_empty() {
                "text".to_string()
            } else {
                rc.chunk_type
            };
            Chunk {
                index,
                text: rc.text,
                chunk_kind,
                page,
                bbox,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_data_chunks() {
        let body = r#"{
            "data": {
                "chunks": [
                    {"text": "PATIENT INFORMATION", "chunk_type": "title",
                     "grounding": [{"page": 0, "box": {"l": 0.1, "t": 0.05, "r": 0.9, "b": 0.1}}]},
                    {"markdown": "Name: ______", "type": "form",
                     "grounding": [{"page": 0, "box": {"l": 0.1, "t": 0.12, "r": 0.5, "b": 0.15}}]},
                    {"text": "Signature", "chunk_type": "text", "grounding": []}
                ]
            }
        }"#;
        let raw: RawParseResponse = serde_json::from_str(body).unwrap();
        let chunks = chunks_from_response(raw);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chunk_kind, "title");
        assert_eq!(chunks[1].text, "Name: ______");
        assert_eq!(chunks[1].chunk_kind, "form");
        assert_eq!(chunks[1].page, Some(0));
        assert!((chunks[1].bbox.unwrap().right - 0.5).abs() < f32::EPSILON);
        assert!(!chunks[2].is_groundable());
        assert_eq!(
            chunks.iter().map(|c| c.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn parses_top_level_chunks_with_full_box_names() {
        let body = r#"{"chunks": [{"text": "Allergies", "grounding": [{"page": 2,
            "box": {"left": 0.0, "top": 0.5, "right": 1.0, "bottom": 0.6}}]}]}"#;
        let raw: RawParseResponse = serde_json::from_str(body).unwrap();
        let chunks = chunks_from_response(raw);

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_kind, "text");
        assert_eq!(chunks[0].page, Some(2));
    }

    #[test]
    fn empty_response_yields_no_chunks() {
        let raw: RawParseResponse = serde_json::from_str("{}").unwrap();
        assert!(chunks_from_response(raw).is_empty());
    }

    #[test]
    fn pdf_extension_detection() {
        assert!(is_pdf(Path::new("intake.PDF")));
        assert!(!is_pdf(Path::new("intake.png")));
        assert!(!is_pdf(Path::new("intake")));
    }

    #[test]
    fn missing_api_key_env_is_reported() {
        let err = HttpDocumentParser::from_env(
            "http://localhost:9/parse",
            "INTAKE_FORMS_TEST_KEY_THAT_IS_NEVER_SET",
            10,
        )
        .err()
        .unwrap();
        assert!(matches!(err, ChunkError::MissingApiKey(_)));
    }
}
