use std::sync::Arc;

use base64::Engine;

use super::region::padded_region;
use super::{GroundingError, PageRasterizer};
use crate::pipeline::chunks::Chunk;

/// Produces grounding crops for chunks of one document.
pub struct GroundingExtractor {
    rasterizer: Arc<dyn PageRasterizer>,
    padding_px: f32,
    scale: f32,
}

impl GroundingExtractor {
    pub fn new(rasterizer: Arc<dyn PageRasterizer>, padding_px: f32, scale: f32) -> Self {
        Self {
            rasterizer,
            padding_px,
            scale,
        }
    }

    /// PNG crop of the chunk's box, or `None` when the chunk has no page or
    /// box, or the padded region is empty.
    pub fn crop(&self, chunk: &Chunk) -> Result<Option<Vec<u8>>, GroundingError> {
        let (page, bbox) = match (chunk.page, chunk.bbox.as_ref()) {
            (Some(page), Some(bbox)) => (page, bbox),
            _ => return Ok(None),
        };

        let size = self.rasterizer.page_size(page)?;
        let Some(region) = padded_region(bbox, size, self.padding_px) else {
            tracing::debug!(chunk = chunk.index, page, "Grounding region empty, no crop");
            return Ok(None);
        };

        let png = self.rasterizer.render_region(page, &region, self.scale)?;
        tracing::debug!(chunk = chunk.index, page, png_size = png.len(), "Grounding crop rendered");
        Ok(Some(png))
    }

    /// Base64-encoded crop, as sent to vision-capable models.
    pub fn crop_base64(&self, chunk: &Chunk) -> Result<Option<String>, GroundingError> {
        Ok(self
            .crop(chunk)?
            .map(|png| base64::engine::general_purpose::STANDARD.encode(png)))
    }

    /// Crops for every groundable chunk. Failures are logged and skipped.
    pub fn crops_base64(&self, chunks: &[&Chunk]) -> Vec<String> {
        chunks
            .iter()
            .filter_map(|chunk| match self.crop_base64(chunk) {
                Ok(image) => image,
                Err(e) => {
                    tracing::warn!(chunk = chunk.index, error = %e, "Grounding crop failed");
                    None
                }
            })
            .collect()
    }
}
