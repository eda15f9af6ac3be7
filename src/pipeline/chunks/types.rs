use serde::{Deserialize, Serialize};

/// Rectangle in page-relative coordinates, each edge in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl NormalizedBox {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }
}

/// One parser-defined unit of document content.
///
/// Produced once by the parsing service and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Position in document order.
    pub index: usize,
    pub text: String,
    /// Parser-assigned category; opaque to this crate.
    pub chunk_kind: String,
    /// 0-based page number.
    pub page: Option<usize>,
    #[serde(rename = "box")]
    pub bbox: Option<NormalizedBox>,
}

impl Chunk {
    pub fn new(index: usize, text: &str, chunk_kind: &str) -> Self {
        Self {
            index,
            text: text.to_string(),
            chunk_kind: chunk_kind.to_string(),
            page: None,
            bbox: None,
        }
    }

    pub fn with_grounding(mut self, page: usize, bbox: NormalizedBox) -> Self {
        self.page = Some(page);
        self.bbox = Some(bbox);
        self
    }

    /// Page and box are both known, so an image crop can be produced.
    pub fn is_groundable(&self) -> bool {
        self.page.is_some() && self.bbox.is_some()
    }
}

/// Render chunks as `[index] (kind, page N) text` lines for prompts.
pub fn render_indexed(chunks: &[&Chunk], sanitize: impl Fn(&str) -> String) -> String {
    chunks
        .iter()
        .map(|c| {
            let page = c
                .page
                .map(|p| format!(", page {}", p + 1))
                .unwrap_or_default();
            format!("[{}] ({}{page}) {}", c.index, c.chunk_kind, sanitize(&c.text))
        })
        .collect::<Vec<_>>()
        .join("\n")
}
