//! Grounding image extraction.
//!
//! Turns a chunk's normalized box into a padded, page-clamped pixel region
//! and renders it as an upscaled PNG crop for vision-capable model calls.

pub mod region;
pub mod pdfium;
pub mod image_doc;
pub mod extractor;

pub use region::*;
pub use pdfium::*;
pub use image_doc::*;
pub use extractor::*;

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GroundingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PDF rendering failed for page {page}: {reason}")]
    PdfRendering { page: usize, reason: String },

    #[error("PDF is password-protected")]
    PdfEncrypted,

    #[error("Page {page} out of range (document has {page_count} pages)")]
    PageOutOfRange { page: usize, page_count: usize },

    #[error("Image processing error: {0}")]
    ImageProcessing(String),

    #[error("Unsupported document type: {0}")]
    UnsupportedDocument(String),
}

/// Page-level rasterization of a source document.
///
/// Coordinates are in page space: PDF points for PDFs, pixels for images.
pub trait PageRasterizer: Send + Sync {
    fn page_count(&self) -> usize;

    fn page_size(&self, page: usize) -> Result<PageSize, GroundingError>;

    /// Render `region` of `page` magnified by `scale`, PNG-encoded.
    fn render_region(
        &self,
        page: usize,
        region: &PixelRect,
        scale: f32,
    ) -> Result<Vec<u8>, GroundingError>;
}

/// Pick a rasterizer by file extension.
pub fn open_rasterizer(document: &Path) -> Result<Arc<dyn PageRasterizer>, GroundingError> {
    let ext = document
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "pdf" => Ok(Arc::new(PdfiumRasterizer::open(document)?)),
        "png" | "jpg" | "jpeg" | "tif" | "tiff" => Ok(Arc::new(ImageRasterizer::open(document)?)),
        other => Err(GroundingError::UnsupportedDocument(format!(
            "{} (extension '{other}')",
            document.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_extension_rejected() {
        let err = open_rasterizer(Path::new("form.docx")).err().unwrap();
        assert!(matches!(err, GroundingError::UnsupportedDocument(_)));
    }

    #[test]
    fn missing_image_is_io_error() {
        let err = open_rasterizer(Path::new("/nonexistent/form.png")).err().unwrap();
        assert!(matches!(err, GroundingError::Io(_)));
    }
}
