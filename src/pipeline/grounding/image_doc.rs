use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};

use super::pdfium::{encode_png, scaled_crop};
use super::region::{PageSize, PixelRect};
use super::{GroundingError, PageRasterizer};

/// Upper bound on either side of an upscaled crop.
const MAX_CROP_PX: u32 = 4096;

/// Single-page rasterizer over a scanned form image (PNG, JPEG, TIFF).
///
/// Page space is the image's own pixel grid.
pub struct ImageRasterizer {
    image: DynamicImage,
}

impl ImageRasterizer {
    pub fn open(path: &Path) -> Result<Self, GroundingError> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, GroundingError> {
        let image = image::load_from_memory(bytes)
            .map_err(|e| GroundingError::ImageProcessing(format!("Image decode failed: {e}")))?;
        Ok(Self { image })
    }

    pub fn from_image(image: DynamicImage) -> Self {
        Self { image }
    }
}

impl PageRasterizer for ImageRasterizer {
    fn page_count(&self) -> usize {
        1
    }

    fn page_size(&self, page: usize) -> Result<PageSize, GroundingError> {
        if page != 0 {
            return Err(GroundingError::PageOutOfRange {
                page,
                page_count: 1,
            });
        }
        let (width, height) = self.image.dimensions();
        Ok(PageSize {
            width: width as f32,
            height: height as f32,
        })
    }

    fn render_region(
        &self,
        page: usize,
        region: &PixelRect,
        scale: f32,
    ) -> Result<Vec<u8>, GroundingError> {
        self.page_size(page)?;
        let (iw, ih) = self.image.dimensions();
        let (x, y, w, h) = scaled_crop(region, 1.0, 1.0, iw, ih);
        let crop = self.image.crop_imm(x, y, w, h);

        let (target_w, target_h) = upscaled_dimensions(w, h, scale);
        let upscaled = if (target_w, target_h) == (w, h) {
            crop
        } else {
            crop.resize_exact(target_w, target_h, FilterType::Lanczos3)
        };

        encode_png(&upscaled)
    }
}

/// Crop size after scaling by `scale`, with one factor for both sides so
/// the larger side stays within `MAX_CROP_PX`.
fn upscaled_dimensions(w: u32, h: u32, scale: f32) -> (u32, u32) {
    let scale = if scale.is_finite() && scale > 0.0 { scale } else { 1.0 };
    let longest = w.max(h).max(1) as f32;
    let factor = scale.min(MAX_CROP_PX as f32 / longest);
    let target_w = ((w as f32 * factor).round() as u32).clamp(1, MAX_CROP_PX);
    let target_h = ((h as f32 * factor).round() as u32).clamp(1, MAX_CROP_PX);
    (target_w, target_h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn blank_page(width: u32, height: u32) -> ImageRasterizer {
        ImageRasterizer::from_image(DynamicImage::ImageRgb8(RgbImage::new(width, height)))
    }

    fn decoded_dimensions(png: &[u8]) -> (u32, u32) {
        image::load_from_memory(png).unwrap().dimensions()
    }

    #[test]
    fn single_page_only() {
        let raster = blank_page(200, 100);
        assert_eq!(raster.page_count(), 1);
        assert_eq!(
            raster.page_size(0).unwrap(),
            PageSize { width: 200.0, height: 100.0 }
        );
        assert!(matches!(
            raster.page_size(1).unwrap_err(),
            GroundingError::PageOutOfRange { page: 1, page_count: 1 }
        ));
    }

    #[test]
    fn crop_is_upscaled() {
        let raster = blank_page(200, 100);
        let region = PixelRect { x0: 10.0, y0: 10.0, x1: 60.0, y1: 30.0 };
        let png = raster.render_region(0, &region, 3.0).unwrap();
        assert_eq!(&png[..4], &[0x89, 0x50, 0x4E, 0x47]);
        assert_eq!(decoded_dimensions(&png), (150, 60));
    }

    #[test]
    fn unit_scale_keeps_crop_size() {
        let raster = blank_page(200, 100);
        let region = PixelRect { x0: 0.0, y0: 0.0, x1: 200.0, y1: 100.0 };
        let png = raster.render_region(0, &region, 1.0).unwrap();
        assert_eq!(decoded_dimensions(&png), (200, 100));
    }

    #[test]
    fn roundtrip_through_encoded_bytes() {
        let png = encode_png(&DynamicImage::ImageRgb8(RgbImage::new(40, 20))).unwrap();
        let raster = ImageRasterizer::from_bytes(&png).unwrap();
        assert_eq!(raster.page_size(0).unwrap().width, 40.0);
    }

    #[test]
    fn garbage_bytes_rejected() {
        let err = ImageRasterizer::from_bytes(b"not an image").err().unwrap();
        assert!(matches!(err, GroundingError::ImageProcessing(_)));
    }

    #[test]
    fn wide_crop_keeps_aspect_ratio_when_capped() {
        assert_eq!(upscaled_dimensions(2000, 500, 3.0), (4096, 1024));
        assert_eq!(upscaled_dimensions(500, 2000, 3.0), (1024, 4096));
    }

    #[test]
    fn small_crop_uses_requested_scale() {
        assert_eq!(upscaled_dimensions(50, 20, 3.0), (150, 60));
        assert_eq!(upscaled_dimensions(50, 20, f32::NAN), (50, 20));
    }
}
