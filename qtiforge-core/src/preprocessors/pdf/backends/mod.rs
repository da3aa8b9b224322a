//! PDF Backend trait
//!
//! Defines the interface that all PDF backends must implement. Every backend
//! produces the same layout XHTML so the layout parser is shared, and every
//! backend can rasterise a page for the renderer.

use crate::error::RenderError;
use anyhow::Result;
use image::DynamicImage;

/// Backend trait for PDF extraction and rasterisation
///
/// The layout XHTML must contain:
/// - Page divs with `data-page`, `data-width`, `data-height`
/// - Spans with `data-bbox` in top-left-origin points
/// - CSS font classes in a `<style>` block
/// - `<img>` elements for embedded raster images
pub trait PdfBackend: Send + Sync {
    /// Extract PDF bytes to layout XHTML
    fn extract_to_layout(&self, pdf_bytes: &[u8]) -> Result<String>;

    /// Rasterise one page (1-indexed) at `scale` pixels per point.
    ///
    /// Size or complexity failures must be reported as
    /// [`RenderError::TooComplex`] so the caller can retry smaller.
    fn render_page(&self, pdf_bytes: &[u8], page: u32, scale: f32) -> Result<DynamicImage, RenderError>;

    /// Backend identifier for logging/debugging
    fn name(&self) -> &str;

    /// Check if backend is healthy/ready
    fn is_healthy(&self) -> bool;
}

#[cfg(feature = "pdfium-backend")]
pub mod pdfium;

#[cfg(feature = "pdfium-backend")]
pub use pdfium::PdfiumBackend;
