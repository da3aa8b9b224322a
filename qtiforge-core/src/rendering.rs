//! Page and region rendering with graceful degradation.
//!
//! Rendering never fails from the caller's point of view: a size/complexity
//! error is retried at the configured smaller scales, and anything left over
//! becomes a placeholder PNG. Every degradation is returned as data.

use crate::config::RenderingConfig;
use crate::error::RenderError;
use crate::geometry::{expand, BoundingBox, ScaleTransform};
use crate::preprocessors::Preprocessor;
use crate::types::Page;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Something that can rasterise pages of one document.
pub trait PageSource: Send + Sync {
    fn rasterize(&self, page: u32, scale: f32) -> Result<DynamicImage, RenderError>;
}

/// Rasterises pages of an in-memory PDF through a preprocessor's backend.
pub struct DocumentRasterizer<'a> {
    preprocessor: &'a dyn Preprocessor,
    pdf_bytes: &'a [u8],
}

impl<'a> DocumentRasterizer<'a> {
    pub fn new(preprocessor: &'a dyn Preprocessor, pdf_bytes: &'a [u8]) -> Self {
        Self {
            preprocessor,
            pdf_bytes,
        }
    }
}

impl PageSource for DocumentRasterizer<'_> {
    fn rasterize(&self, page: u32, scale: f32) -> Result<DynamicImage, RenderError> {
        self.preprocessor.rasterize_page(self.pdf_bytes, page, scale)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderDegradation {
    pub page: u32,
    pub requested_scale: f32,
    pub attempted_scales: Vec<f32>,
    /// Scale that finally produced a raster, `None` when a placeholder was used
    pub used_scale: Option<f32>,
    pub reason: String,
    pub placeholder: bool,
}

#[derive(Debug, Clone)]
pub struct RenderOutcome {
    pub png: Vec<u8>,
    pub degradation: Option<RenderDegradation>,
}

pub struct PageRenderer<'a> {
    source: &'a dyn PageSource,
    config: &'a RenderingConfig,
}

impl<'a> PageRenderer<'a> {
    pub fn new(source: &'a dyn PageSource, config: &'a RenderingConfig) -> Self {
        Self { source, config }
    }

    /// Render a whole page as PNG.
    pub fn render(&self, page: &Page, scale: f32) -> RenderOutcome {
        match self.rasterize_with_fallback(page, scale) {
            Ok((image, _, degradation)) => RenderOutcome {
                png: encode_png(&image),
                degradation,
            },
            Err(degradation) => RenderOutcome {
                png: placeholder_png(self.config.placeholder_width, self.config.placeholder_height),
                degradation: Some(degradation),
            },
        }
    }

    /// Render the region `bbox` of `page`, grown by the configured margin.
    pub fn render_region(&self, page: &Page, bbox: &BoundingBox, scale: f32) -> RenderOutcome {
        let mut outcomes = self.render_regions(page, std::slice::from_ref(bbox), scale);
        outcomes.pop().unwrap_or_else(|| RenderOutcome {
            png: placeholder_png(self.config.placeholder_width, self.config.placeholder_height),
            degradation: None,
        })
    }

    /// Render several regions of one page from a single raster.
    pub fn render_regions(&self, page: &Page, boxes: &[BoundingBox], scale: f32) -> Vec<RenderOutcome> {
        match self.rasterize_with_fallback(page, scale) {
            Ok((image, _, degradation)) => boxes
                .iter()
                .map(|bbox| {
                    let region = expand(bbox, self.config.region_margin, &page.bounds());
                    RenderOutcome {
                        png: encode_png(&crop(&image, &region, page.width)),
                        degradation: degradation.clone(),
                    }
                })
                .collect(),
            Err(degradation) => boxes
                .iter()
                .map(|_| RenderOutcome {
                    png: placeholder_png(self.config.placeholder_width, self.config.placeholder_height),
                    degradation: Some(degradation.clone()),
                })
                .collect(),
        }
    }

    /// Requested scale first, then every smaller fallback scale on size errors.
    fn rasterize_with_fallback(
        &self,
        page: &Page,
        scale: f32,
    ) -> Result<(DynamicImage, f32, Option<RenderDegradation>), RenderDegradation> {
        let mut scales = vec![scale];
        scales.extend(
            self.config
                .fallback_scales
                .iter()
                .copied()
                .filter(|s| *s > 0.0 && *s < scale),
        );

        let mut attempted = Vec::new();
        let mut last_reason = String::new();
        for candidate in scales {
            attempted.push(candidate);
            match self.rasterize_once(page, candidate) {
                Ok(image) => {
                    let degradation = (candidate != scale).then(|| RenderDegradation {
                        page: page.number,
                        requested_scale: scale,
                        attempted_scales: attempted.clone(),
                        used_scale: Some(candidate),
                        reason: last_reason.clone(),
                        placeholder: false,
                    });
                    if let Some(d) = &degradation {
                        log::warn!("⚠️  Page {} rendered at reduced scale {} ({})", d.page, candidate, d.reason);
                    }
                    return Ok((image, candidate, degradation));
                }
                Err(e) => {
                    last_reason = e.to_string();
                    if !e.is_size_related() {
                        break;
                    }
                }
            }
        }

        log::warn!(
            "⚠️  Page {} could not be rendered (tried {:?}): {}; using placeholder",
            page.number,
            attempted,
            last_reason
        );
        Err(RenderDegradation {
            page: page.number,
            requested_scale: scale,
            attempted_scales: attempted,
            used_scale: None,
            reason: last_reason,
            placeholder: true,
        })
    }

    fn rasterize_once(&self, page: &Page, scale: f32) -> Result<DynamicImage, RenderError> {
        let (width, height) = ScaleTransform::new(scale).raster_size(page.width, page.height);
        let pixels = width as u64 * height as u64;
        if pixels > self.config.max_pixels {
            return Err(RenderError::TooComplex {
                page: page.number,
                scale,
                reason: format!("{}x{} exceeds pixel budget {}", width, height, self.config.max_pixels),
            });
        }
        let image = self.source.rasterize(page.number, scale)?;
        if image.width() == 0 || image.height() == 0 {
            return Err(RenderError::Backend(format!("page {} produced an empty raster", page.number)));
        }
        Ok(image)
    }
}

fn crop(image: &DynamicImage, region: &BoundingBox, page_width: f32) -> DynamicImage {
    // Backends may round the raster size; map with the scale actually delivered.
    let transform = ScaleTransform::new(image.width() as f32 / page_width.max(1.0));
    let rect = transform.page_to_pixel(region, image.width(), image.height());
    if rect.width == 0 || rect.height == 0 {
        return image.crop_imm(0, 0, image.width().min(1), image.height().min(1));
    }
    image.crop_imm(rect.x, rect.y, rect.width, rect.height)
}

/// 1x1 transparent PNG, used only if encoding itself fails.
const FALLBACK_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F, 0x15, 0xC4,
    0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00, 0x01, 0x00, 0x00,
    0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE,
    0x42, 0x60, 0x82,
];

pub fn encode_png(image: &DynamicImage) -> Vec<u8> {
    let mut buffer = Vec::new();
    match image.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png) {
        Ok(()) => buffer,
        Err(e) => {
            log::error!("❌ PNG encoding failed: {}", e);
            FALLBACK_PNG.to_vec()
        }
    }
}

const CAPTION: &str = "RENDERING FAILED";

// 5x7 glyphs, one byte per row, low five bits used.
fn glyph(c: char) -> [u8; 7] {
    match c {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'N' => [0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001, 0b10001],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        _ => [0; 7],
    }
}

/// White canvas, gray border, "RENDERING FAILED" centred.
pub fn placeholder_image(width: u32, height: u32) -> RgbImage {
    let width = width.max(40);
    let height = height.max(20);
    let mut canvas = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
    let border = Rgb([160, 160, 160]);
    for x in 0..width {
        for t in 0..2 {
            canvas.put_pixel(x, t, border);
            canvas.put_pixel(x, height - 1 - t, border);
        }
    }
    for y in 0..height {
        for t in 0..2 {
            canvas.put_pixel(t, y, border);
            canvas.put_pixel(width - 1 - t, y, border);
        }
    }

    let columns = CAPTION.chars().count() as u32 * 6 - 1;
    let dot = ((width * 8 / 10) / columns).min((height * 4 / 10) / 7).max(1);
    let text_width = columns * dot;
    let text_height = 7 * dot;
    if text_width + 4 > width || text_height + 4 > height {
        return canvas;
    }
    let origin_x = (width - text_width) / 2;
    let origin_y = (height - text_height) / 2;
    let ink = Rgb([90, 90, 90]);

    for (index, c) in CAPTION.chars().enumerate() {
        let glyph_x = origin_x + index as u32 * 6 * dot;
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..5u32 {
                if bits & (1 << (4 - col)) == 0 {
                    continue;
                }
                for dy in 0..dot {
                    for dx in 0..dot {
                        canvas.put_pixel(glyph_x + col * dot + dx, origin_y + row as u32 * dot + dy, ink);
                    }
                }
            }
        }
    }
    canvas
}

pub fn placeholder_png(width: u32, height: u32) -> Vec<u8> {
    encode_png(&DynamicImage::ImageRgb8(placeholder_image(width, height)))
}
