//! PDF page rasterization via Google PDFium.
//!
//! `PdfiumRasterizer` keeps the PDF bytes and page sizes; the `Pdfium`
//! handle itself is loaded per operation because the upstream type is
//! `!Send`. The OS caches `dlopen`/`LoadLibrary`, so repeat loads are cheap.

use std::collections::VecDeque;
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex};

use image::{DynamicImage, GenericImageView, ImageOutputFormat};
use pdfium_render::prelude::*;
use tracing::{debug, warn};

use super::region::{PageSize, PixelRect};
use super::{GroundingError, PageRasterizer};

/// Maximum dimension (width or height) of a rendered page bitmap.
const MAX_DIMENSION_PX: u32 = 4096;

/// Rendered page bitmaps kept per rasterizer (a Letter page at 3x is ~17 MB).
const MAX_CACHED_PAGES: usize = 2;

type PageKey = (usize, u32);

/// Most recently rendered pages, oldest first, keyed by page and scale.
struct RenderedPages {
    entries: VecDeque<(PageKey, Arc<DynamicImage>)>,
    capacity: usize,
}

impl RenderedPages {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn get(&mut self, key: PageKey) -> Option<Arc<DynamicImage>> {
        let pos = self.entries.iter().position(|(k, _)| *k == key)?;
        let entry = self.entries.remove(pos)?;
        let image = Arc::clone(&entry.1);
        self.entries.push_back(entry);
        Some(image)
    }

    fn insert(&mut self, key: PageKey, image: Arc<DynamicImage>) {
        self.entries.retain(|(k, _)| *k != key);
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((key, image));
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct PdfiumRasterizer {
    pdf_bytes: Vec<u8>,
    page_sizes: Vec<PageSize>,
    rendered: Mutex<RenderedPages>,
}

impl PdfiumRasterizer {
    pub fn open(path: &Path) -> Result<Self, GroundingError> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(bytes)
    }

    /// Load the document once to validate it and record page sizes (points).
    pub fn from_bytes(pdf_bytes: Vec<u8>) -> Result<Self, GroundingError> {
        let page_sizes = {
            let pdfium = load_pdfium()?;
            let document = pdfium
                .load_pdf_from_byte_slice(&pdf_bytes, None)
                .map_err(map_load_error)?;
            let sizes: Vec<PageSize> = document
                .pages()
                .iter()
                .map(|page| PageSize {
                    width: page.width().value,
                    height: page.height().value,
                })
                .collect();
            sizes
        };

        debug!(pages = page_sizes.len(), "PDF loaded for grounding");
        Ok(Self {
            pdf_bytes,
            page_sizes,
            rendered: Mutex::new(RenderedPages::new(MAX_CACHED_PAGES)),
        })
    }

    fn render_page(&self, page: usize, scale: f32) -> Result<Arc<DynamicImage>, GroundingError> {
        let cache_key = (page, scale.to_bits());
        if let Ok(mut cache) = self.rendered.lock() {
            if let Some(image) = cache.get(cache_key) {
                return Ok(image);
            }
        }

        let size = self.page_size(page)?;
        let (target_w, target_h) = compute_render_dimensions(size.width, size.height, scale);

        let pdfium = load_pdfium()?;
        let document = pdfium
            .load_pdf_from_byte_slice(&self.pdf_bytes, None)
            .map_err(map_load_error)?;
        let pages = document.pages();

        let page_index = u16::try_from(page).map_err(|_| GroundingError::PdfRendering {
            page,
            reason: format!("Page index {page} exceeds u16 maximum"),
        })?;
        let pdf_page = pages
            .get(page_index)
            .map_err(|e| GroundingError::PdfRendering {
                page,
                reason: format!("Page unavailable: {e}"),
            })?;

        let config = PdfRenderConfig::new()
            .set_target_width(target_w as i32)
            .set_maximum_height(target_h as i32);
        let bitmap = pdf_page
            .render_with_config(&config)
            .map_err(|e| GroundingError::PdfRendering {
                page,
                reason: format!("Rendering failed: {e}"),
            })?;

        let image = Arc::new(bitmap.as_image());
        debug!(page, width = target_w, height = target_h, "Rendered PDF page");

        if let Ok(mut cache) = self.rendered.lock() {
            cache.insert(cache_key, Arc::clone(&image));
        }
        Ok(image)
    }
}

impl PageRasterizer for PdfiumRasterizer {
    fn page_count(&self) -> usize {
        self.page_sizes.len()
    }

    fn page_size(&self, page: usize) -> Result<PageSize, GroundingError> {
        self.page_sizes
            .get(page)
            .copied()
            .ok_or(GroundingError::PageOutOfRange {
                page,
                page_count: self.page_sizes.len(),
            })
    }

    fn render_region(
        &self,
        page: usize,
        region: &PixelRect,
        scale: f32,
    ) -> Result<Vec<u8>, GroundingError> {
        let size = self.page_size(page)?;
        let bitmap = self.render_page(page, scale)?;

        // The bitmap may be smaller than `scale` asked for when capped.
        let (bw, bh) = bitmap.dimensions();
        let sx = bw as f32 / size.width;
        let sy = bh as f32 / size.height;
        let (x, y, w, h) = scaled_crop(region, sx, sy, bw, bh);

        let crop = bitmap.crop_imm(x, y, w, h);
        encode_png(&crop)
    }
}

/// Scale a page-space rectangle into bitmap pixels, clamped to the bitmap.
///
/// Returns `(x, y, width, height)` with width and height at least 1.
pub(crate) fn scaled_crop(region: &PixelRect, sx: f32, sy: f32, bw: u32, bh: u32) -> (u32, u32, u32, u32) {
    let max_x = bw.saturating_sub(1);
    let max_y = bh.saturating_sub(1);
    let x = ((region.x0 * sx).floor().max(0.0) as u32).min(max_x);
    let y = ((region.y0 * sy).floor().max(0.0) as u32).min(max_y);
    let x1 = ((region.x1 * sx).ceil().max(0.0) as u32).min(bw);
    let y1 = ((region.y1 * sy).ceil().max(0.0) as u32).min(bh);
    (x, y, x1.saturating_sub(x).max(1), y1.saturating_sub(y).max(1))
}

pub(crate) fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, GroundingError> {
    let mut cursor = Cursor::new(Vec::new());
    image
        .write_to(&mut cursor, ImageOutputFormat::Png)
        .map_err(|e| GroundingError::ImageProcessing(format!("PNG encoding failed: {e}")))?;
    Ok(cursor.into_inner())
}

/// Load the PDFium dynamic library.
///
/// Discovery order:
/// 1. `PDFIUM_DYNAMIC_LIB_PATH` env var (explicit path)
/// 2. Alongside the running executable, or its `pdfium/{bin,lib}` subdirectories
/// 3. System library search paths
fn load_pdfium() -> Result<Pdfium, GroundingError> {
    if let Ok(path) = std::env::var("PDFIUM_DYNAMIC_LIB_PATH") {
        debug!(path = %path, "Loading PDFium from env var");
        let bindings =
            Pdfium::bind_to_library(&path).map_err(|e| GroundingError::PdfRendering {
                page: 0,
                reason: format!("Failed to load PDFium from {path}: {e}"),
            })?;
        return Ok(Pdfium::new(bindings));
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(exe_dir) = exe.parent() {
            let candidates = [
                exe_dir.to_path_buf(),
                exe_dir.join("pdfium").join("bin"),
                exe_dir.join("pdfium").join("lib"),
            ];

            for dir in &candidates {
                let lib_path =
                    Pdfium::pdfium_platform_library_name_at_path(dir.to_string_lossy().as_ref());
                if let Ok(bindings) = Pdfium::bind_to_library(&lib_path) {
                    debug!(dir = %dir.display(), "Loaded PDFium from candidate directory");
                    return Ok(Pdfium::new(bindings));
                }
            }
        }
    }

    let bindings =
        Pdfium::bind_to_system_library().map_err(|e| GroundingError::PdfRendering {
            page: 0,
            reason: format!(
                "PDFium library not found. Set PDFIUM_DYNAMIC_LIB_PATH or install PDFium: {e}"
            ),
        })?;
    Ok(Pdfium::new(bindings))
}

fn map_load_error(e: PdfiumError) -> GroundingError {
    let msg = format!("{e}");
    let lower = msg.to_lowercase();
    if lower.contains("password") || lower.contains("encrypt") {
        GroundingError::PdfEncrypted
    } else {
        GroundingError::PdfRendering {
            page: 0,
            reason: format!("Failed to load PDF: {e}"),
        }
    }
}

/// Pixel dimensions for rendering a page at `scale`, capped at
/// `MAX_DIMENSION_PX` with aspect ratio preserved. Both at least 1.
fn compute_render_dimensions(width_points: f32, height_points: f32, scale: f32) -> (u32, u32) {
    let raw_w = (width_points * scale).max(1.0);
    let raw_h = (height_points * scale).max(1.0);

    let max_dim = raw_w.max(raw_h);
    if max_dim > MAX_DIMENSION_PX as f32 {
        let ratio = MAX_DIMENSION_PX as f32 / max_dim;
        let w = ((raw_w * ratio) as u32).clamp(1, MAX_DIMENSION_PX);
        let h = ((raw_h * ratio) as u32).clamp(1, MAX_DIMENSION_PX);
        warn!(
            raw_width = raw_w as u32,
            raw_height = raw_h as u32,
            capped_width = w,
            capped_height = h,
            "Page dimensions capped to {MAX_DIMENSION_PX}px",
        );
        (w, h)
    } else {
        (raw_w as u32, raw_h as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letter_at_3x() {
        let (w, h) = compute_render_dimensions(612.0, 792.0, 3.0);
        assert_eq!((w, h), (1836, 2376));
    }

    #[test]
    fn oversized_scale_is_capped() {
        let (w, h) = compute_render_dimensions(612.0, 792.0, 10.0);
        assert!(w <= MAX_DIMENSION_PX);
        assert!(h <= MAX_DIMENSION_PX && h >= MAX_DIMENSION_PX - 1);
    }

    #[test]
    fn cap_preserves_aspect_ratio() {
        let (w, h) = compute_render_dimensions(5000.0, 10000.0, 2.0);
        let ratio = h as f32 / w as f32;
        assert!((ratio - 2.0).abs() < 0.05, "got {ratio}");
    }

    #[test]
    fn zero_points_clamped_to_one() {
        let (w, h) = compute_render_dimensions(0.0, 0.0, 3.0);
        assert!(w >= 1 && h >= 1);
    }

    #[test]
    fn scaled_crop_stays_inside_bitmap() {
        let region = PixelRect { x0: 0.0, y0: 0.0, x1: 612.0, y1: 792.0 };
        let (x, y, w, h) = scaled_crop(&region, 3.0, 3.0, 1836, 2376);
        assert_eq!((x, y, w, h), (0, 0, 1836, 2376));
    }

    #[test]
    fn scaled_crop_interior_region() {
        let region = PixelRect { x0: 10.0, y0: 20.0, x1: 30.0, y1: 40.0 };
        assert_eq!(scaled_crop(&region, 2.0, 2.0, 1000, 1000), (20, 40, 40, 40));
    }

    #[test]
    fn scaled_crop_never_zero_sized() {
        let region = PixelRect { x0: 999.0, y0: 999.0, x1: 999.0, y1: 999.0 };
        let (x, y, w, h) = scaled_crop(&region, 1.0, 1.0, 100, 100);
        assert!(x < 100 && y < 100);
        assert!(w >= 1 && h >= 1);
    }

    fn page(width: u32) -> Arc<DynamicImage> {
        Arc::new(DynamicImage::new_rgb8(width, 1))
    }

    #[test]
    fn page_cache_stays_bounded() {
        let mut cache = RenderedPages::new(MAX_CACHED_PAGES);
        for p in 0..10 {
            cache.insert((p, 3.0f32.to_bits()), page(p as u32 + 1));
            assert!(cache.len() <= MAX_CACHED_PAGES);
        }
        assert_eq!(cache.len(), MAX_CACHED_PAGES);
        assert!(cache.get((0, 3.0f32.to_bits())).is_none());
        assert_eq!(cache.get((9, 3.0f32.to_bits())).unwrap().width(), 10);
    }

    #[test]
    fn page_cache_evicts_least_recently_used() {
        let mut cache = RenderedPages::new(2);
        let scale = 3.0f32.to_bits();
        cache.insert((0, scale), page(1));
        cache.insert((1, scale), page(2));
        assert!(cache.get((0, scale)).is_some());

        cache.insert((2, scale), page(3));
        assert!(cache.get((0, scale)).is_some());
        assert!(cache.get((1, scale)).is_none());
        assert!(cache.get((2, scale)).is_some());
    }

    #[test]
    fn page_cache_replaces_same_key() {
        let mut cache = RenderedPages::new(2);
        let key = (4, 2.0f32.to_bits());
        cache.insert(key, page(1));
        cache.insert(key, page(7));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(key).unwrap().width(), 7);
    }

    #[test]
    fn invalid_pdf_bytes_fail() {
        // Fails on library load or on parse; either way no panic.
        assert!(PdfiumRasterizer::from_bytes(b"not a pdf".to_vec()).is_err());
    }
}
