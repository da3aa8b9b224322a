//! Bounding boxes and page/pixel coordinate transforms.
//!
//! All boxes are `(x1, y1, x2, y2)` in PDF points with the origin at the
//! top-left of the page and y growing downwards. Every function here is pure:
//! the same inputs always produce the same box.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    /// Build a box from two corners in any order.
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    /// The full page box `[0, width] x [0, height]`.
    pub fn page(width: f32, height: f32) -> Self {
        Self::new(0.0, 0.0, width.max(0.0), height.max(0.0))
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center_x(&self) -> f32 {
        (self.x1 + self.x2) / 2.0
    }

    pub fn center_y(&self) -> f32 {
        (self.y1 + self.y2) / 2.0
    }

    /// A box with no positive area (or with non-finite coordinates).
    pub fn is_empty(&self) -> bool {
        !(self.width() > 0.0 && self.height() > 0.0)
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
            x2: self.x2.max(other.x2),
            y2: self.y2.max(other.y2),
        }
    }

    /// Positive-area intersection, if any.
    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let candidate = BoundingBox {
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
            x2: self.x2.min(other.x2),
            y2: self.y2.min(other.y2),
        };
        if candidate.x2 > candidate.x1 && candidate.y2 > candidate.y1 {
            Some(candidate)
        } else {
            None
        }
    }

    /// True when `other` lies entirely inside `self`.
    pub fn contains(&self, other: &BoundingBox) -> bool {
        other.x1 >= self.x1 && other.y1 >= self.y1 && other.x2 <= self.x2 && other.y2 <= self.y2
    }

    /// True when `self` lies inside `bounds`, allowing `tolerance` points of slack.
    pub fn within(&self, bounds: &BoundingBox, tolerance: f32) -> bool {
        self.x1 >= bounds.x1 - tolerance
            && self.y1 >= bounds.y1 - tolerance
            && self.x2 <= bounds.x2 + tolerance
            && self.y2 <= bounds.y2 + tolerance
    }

    /// Clamp every edge into `bounds`. Non-finite coordinates collapse onto the bounds.
    pub fn clamp_to(&self, bounds: &BoundingBox) -> BoundingBox {
        let mut clamped = BoundingBox {
            x1: clamp_coord(self.x1, bounds.x1, bounds.x2),
            y1: clamp_coord(self.y1, bounds.y1, bounds.y2),
            x2: clamp_coord(self.x2, bounds.x1, bounds.x2),
            y2: clamp_coord(self.y2, bounds.y1, bounds.y2),
        };
        if clamped.x1 > clamped.x2 {
            let mid = (clamped.x1 + clamped.x2) / 2.0;
            clamped.x1 = mid;
            clamped.x2 = mid;
        }
        if clamped.y1 > clamped.y2 {
            let mid = (clamped.y1 + clamped.y2) / 2.0;
            clamped.y1 = mid;
            clamped.y2 = mid;
        }
        clamped
    }
}

// f32::max/min ignore NaN, so a NaN input ends up on the lower bound.
fn clamp_coord(value: f32, low: f32, high: f32) -> f32 {
    let high = high.max(low);
    value.max(low).min(high)
}

/// Grow `bbox` by `margin` on every side, clamped to `page_bounds`.
///
/// The result always satisfies `0 <= x1 <= x2 <= page_width` and
/// `0 <= y1 <= y2 <= page_height` when `page_bounds` is a page box.
pub fn expand(bbox: &BoundingBox, margin: f32, page_bounds: &BoundingBox) -> BoundingBox {
    BoundingBox {
        x1: bbox.x1 - margin,
        y1: bbox.y1 - margin,
        x2: bbox.x2 + margin,
        y2: bbox.y2 + margin,
    }
    .clamp_to(page_bounds)
}

/// Any positive-area intersection.
pub fn overlaps(a: &BoundingBox, b: &BoundingBox) -> bool {
    a.intersection(b).is_some()
}

/// Union of every box in the iterator, `None` when it is empty.
pub fn union_all<'a, I>(boxes: I) -> Option<BoundingBox>
where
    I: IntoIterator<Item = &'a BoundingBox>,
{
    boxes
        .into_iter()
        .fold(None, |acc: Option<BoundingBox>, b| match acc {
            Some(current) => Some(current.union(b)),
            None => Some(*b),
        })
}

/// Trim an image candidate so it no longer intrudes on text regions.
///
/// Only text boxes that partially overlap the candidate are considered; text
/// fully enclosed by the candidate is treated as a label inside the figure.
/// For each intruding box the candidate loses the side that keeps the most
/// area. A trim that would leave nothing is skipped.
pub fn shrink_away_from_text(
    candidate: &BoundingBox,
    text_boxes: &[BoundingBox],
    bounds: &BoundingBox,
) -> BoundingBox {
    let mut current = candidate.clamp_to(bounds);

    let mut intruders: Vec<&BoundingBox> = text_boxes
        .iter()
        .filter(|t| overlaps(&current, t) && !current.contains(t))
        .collect();
    intruders.sort_by(|a, b| {
        a.y1.total_cmp(&b.y1)
            .then_with(|| a.x1.total_cmp(&b.x1))
            .then_with(|| a.y2.total_cmp(&b.y2))
            .then_with(|| a.x2.total_cmp(&b.x2))
    });

    for text in intruders {
        if !overlaps(&current, text) || current.contains(text) {
            continue;
        }
        let trims = [
            BoundingBox { y1: text.y2, ..current },
            BoundingBox { y2: text.y1, ..current },
            BoundingBox { x1: text.x2, ..current },
            BoundingBox { x2: text.x1, ..current },
        ];
        let best = trims
            .iter()
            .filter(|t| !t.is_empty() && !overlaps(t, text))
            .max_by(|a, b| a.area().total_cmp(&b.area()));
        if let Some(best) = best {
            current = *best;
        }
    }

    current
}

/// Integer pixel rectangle inside a rendered raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Page-space to raster-space transform at a uniform scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleTransform {
    pub scale: f32,
}

impl ScaleTransform {
    pub fn new(scale: f32) -> Self {
        Self { scale }
    }

    /// Raster dimensions of a page of `width` x `height` points.
    pub fn raster_size(&self, width: f32, height: f32) -> (u32, u32) {
        (
            (width * self.scale).round().max(1.0) as u32,
            (height * self.scale).round().max(1.0) as u32,
        )
    }

    /// Map a page box to pixels, rounding outwards and clamping into the raster.
    pub fn page_to_pixel(&self, bbox: &BoundingBox, raster_width: u32, raster_height: u32) -> PixelRect {
        let max_x = raster_width as f32;
        let max_y = raster_height as f32;
        let x1 = clamp_coord((bbox.x1 * self.scale).floor(), 0.0, max_x);
        let y1 = clamp_coord((bbox.y1 * self.scale).floor(), 0.0, max_y);
        let x2 = clamp_coord((bbox.x2 * self.scale).ceil(), 0.0, max_x);
        let y2 = clamp_coord((bbox.y2 * self.scale).ceil(), 0.0, max_y);
        PixelRect {
            x: x1 as u32,
            y: y1 as u32,
            width: (x2 - x1).max(0.0) as u32,
            height: (y2 - y1).max(0.0) as u32,
        }
    }

    pub fn pixel_to_page(&self, rect: &PixelRect) -> BoundingBox {
        let scale = if self.scale > 0.0 { self.scale } else { 1.0 };
        BoundingBox::new(
            rect.x as f32 / scale,
            rect.y as f32 / scale,
            (rect.x + rect.width) as f32 / scale,
            (rect.y + rect.height) as f32 / scale,
        )
    }
}
