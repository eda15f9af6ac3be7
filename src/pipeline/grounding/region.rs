use serde::{Deserialize, Serialize};

use crate::pipeline::chunks::NormalizedBox;

/// Page dimensions in page space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageSize {
    pub width: f32,
    pub height: f32,
}

/// Axis-aligned rectangle in page space. `x0 <= x1`, `y0 <= y1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl PixelRect {
    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0.0 || self.height() <= 0.0
    }

    pub fn within(&self, page: PageSize) -> bool {
        self.x0 >= 0.0 && self.y0 >= 0.0 && self.x1 <= page.width && self.y1 <= page.height
    }
}

/// Map a normalized box onto the page, pad it, and clamp it to the page.
///
/// Returns `None` for non-finite input or when nothing of the box survives
/// clamping.
pub fn padded_region(bbox: &NormalizedBox, page: PageSize, padding: f32) -> Option<PixelRect> {
    let coords = [bbox.left, bbox.top, bbox.right, bbox.bottom, page.width, page.height];
    if coords.iter().any(|v| !v.is_finite()) || page.width <= 0.0 || page.height <= 0.0 {
        return None;
    }
    let padding = if padding.is_finite() { padding.max(0.0) } else { 0.0 };

    let (left, right) = ordered(bbox.left, bbox.right);
    let (top, bottom) = ordered(bbox.top, bbox.bottom);

    let rect = PixelRect {
        x0: (left * page.width - padding).max(0.0),
        y0: (top * page.height - padding).max(0.0),
        x1: (right * page.width + padding).min(page.width),
        y1: (bottom * page.height + padding).min(page.height),
    };

    (!rect.is_empty()).then_some(rect)
}

fn ordered(a: f32, b: f32) -> (f32, f32) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
