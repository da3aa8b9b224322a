//! pdfium backend
//!
//! Text comes from pdfium's text segments, image regions from the page's
//! image objects, rasters from pdfium's renderer. pdfium reports positions
//! with a bottom-left origin; everything leaving this module is top-left.

use super::PdfBackend;
use crate::error::RenderError;
use crate::geometry::BoundingBox;
use crate::preprocessors::pdf::layout_parser::write_layout;
use crate::types::{FontInfo, ImageRegion, RawPage, RawSpan};
use anyhow::{anyhow, Context, Result};
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::Path;
use std::sync::Mutex;

pub struct PdfiumBackend {
    pdfium: Mutex<Pdfium>,
}

// pdfium is not thread-safe; every call goes through the mutex
unsafe impl Send for PdfiumBackend {}
unsafe impl Sync for PdfiumBackend {}

impl PdfiumBackend {
    /// Bind to a pdfium library in `library_dir`, falling back to the system library.
    pub fn new(library_dir: Option<&Path>) -> Result<Self> {
        let dir = library_dir
            .map(|d| d.to_string_lossy().into_owned())
            .unwrap_or_else(|| "./".to_string());
        let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(&dir))
            .or_else(|_| Pdfium::bind_to_system_library())
            .context("Failed to bind pdfium library")?;
        log::info!("🔧 pdfium bound (search dir: {})", dir);
        Ok(Self {
            pdfium: Mutex::new(Pdfium::new(bindings)),
        })
    }

    fn extract_pages(&self, pdf_bytes: &[u8]) -> Result<Vec<RawPage>> {
        let pdfium = self
            .pdfium
            .lock()
            .map_err(|_| anyhow!("pdfium mutex poisoned"))?;
        let document = pdfium
            .load_pdf_from_byte_slice(pdf_bytes, None)
            .context("Failed to load PDF")?;

        let mut pages = Vec::new();
        for (index, page) in document.pages().iter().enumerate() {
            let number = index as u32 + 1;
            let width = page.width().value;
            let height = page.height().value;

            let text = page
                .text()
                .map_err(|e| anyhow!("Failed to get text of page {}: {}", number, e))?;

            let mut spans = Vec::new();
            for segment in text.segments().iter() {
                let content = segment.text();
                let content = content.trim();
                if content.is_empty() {
                    continue;
                }
                let bounds = segment.bounds();
                spans.push(RawSpan {
                    text: content.to_string(),
                    font: FontInfo::fallback("f0"),
                    bbox: flip_rect(
                        bounds.left().value,
                        bounds.top().value,
                        bounds.right().value,
                        bounds.bottom().value,
                        height,
                    ),
                    block_hint: None,
                });
            }

            let mut images = Vec::new();
            for object in page.objects().iter() {
                let Some(image_object) = object.as_image_object() else {
                    continue;
                };
                let Ok(bounds) = object.bounds() else {
                    continue;
                };
                let rect = bounds.to_rect();
                images.push(ImageRegion {
                    bbox: flip_rect(
                        rect.left().value,
                        rect.top().value,
                        rect.right().value,
                        rect.bottom().value,
                        height,
                    ),
                    pixel_width: image_object.width().map(|w| w.max(0) as u32).unwrap_or(0),
                    pixel_height: image_object.height().map(|h| h.max(0) as u32).unwrap_or(0),
                });
            }

            pages.push(RawPage {
                number,
                width,
                height,
                spans,
                images,
            });
        }

        Ok(pages)
    }
}

fn flip_rect(left: f32, top: f32, right: f32, bottom: f32, page_height: f32) -> BoundingBox {
    BoundingBox::new(left, page_height - top, right, page_height - bottom)
}

impl PdfBackend for PdfiumBackend {
    fn extract_to_layout(&self, pdf_bytes: &[u8]) -> Result<String> {
        let pages = self.extract_pages(pdf_bytes)?;
        log::debug!("📄 pdfium extracted {} pages", pages.len());
        Ok(write_layout(&pages))
    }

    fn render_page(&self, pdf_bytes: &[u8], page: u32, scale: f32) -> Result<DynamicImage, RenderError> {
        let pdfium = self
            .pdfium
            .lock()
            .map_err(|_| RenderError::Backend("pdfium mutex poisoned".to_string()))?;
        let document = pdfium
            .load_pdf_from_byte_slice(pdf_bytes, None)
            .map_err(|e| RenderError::Backend(e.to_string()))?;
        let page_count = document.pages().len() as usize;
        if page == 0 || page as usize > page_count {
            return Err(RenderError::PageOutOfRange { page, page_count });
        }
        let pdf_page = document
            .pages()
            .get((page - 1) as u16)
            .map_err(|e| RenderError::Backend(e.to_string()))?;

        let width = (pdf_page.width().value * scale).round() as i32;
        let height = (pdf_page.height().value * scale).round() as i32;
        let bitmap = pdf_page
            .render_with_config(
                &PdfRenderConfig::new()
                    .set_target_width(width.max(1))
                    .set_target_height(height.max(1))
                    .render_form_data(true),
            )
            .map_err(|e| RenderError::TooComplex {
                page,
                scale,
                reason: e.to_string(),
            })?;

        Ok(bitmap.as_image())
    }

    fn name(&self) -> &str {
        "pdfium"
    }

    fn is_healthy(&self) -> bool {
        self.pdfium.lock().is_ok()
    }
}
