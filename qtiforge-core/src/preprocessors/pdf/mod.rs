//! PDF Preprocessor
//!
//! Main preprocessor for exam PDFs. Uses pluggable backends to extract PDF
//! content to layout XHTML, then parses and clusters it into Pages.

pub mod backends;
pub mod layout_parser;

use crate::config::SpatialClusteringConfig;
use crate::error::RenderError;
use crate::preprocessors::preprocessor::Preprocessor;
use crate::preprocessors::spatial_clustering::SpatialClusterer;
use crate::types::Page;
use anyhow::{Context, Result};
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use backends::PdfBackend;

#[cfg(feature = "pdfium-backend")]
pub use backends::PdfiumBackend;

/// Backend enum for runtime backend selection
pub enum PdfBackendImpl {
    #[cfg(feature = "pdfium-backend")]
    Pdfium(PdfiumBackend),
    /// Any other implementation, e.g. a remote extraction service or a test double
    Custom(Box<dyn PdfBackend>),
}

impl PdfBackend for PdfBackendImpl {
    fn extract_to_layout(&self, pdf_bytes: &[u8]) -> Result<String> {
        match self {
            #[cfg(feature = "pdfium-backend")]
            PdfBackendImpl::Pdfium(backend) => backend.extract_to_layout(pdf_bytes),
            PdfBackendImpl::Custom(backend) => backend.extract_to_layout(pdf_bytes),
        }
    }

    fn render_page(&self, pdf_bytes: &[u8], page: u32, scale: f32) -> Result<DynamicImage, RenderError> {
        match self {
            #[cfg(feature = "pdfium-backend")]
            PdfBackendImpl::Pdfium(backend) => backend.render_page(pdf_bytes, page, scale),
            PdfBackendImpl::Custom(backend) => backend.render_page(pdf_bytes, page, scale),
        }
    }

    fn name(&self) -> &str {
        match self {
            #[cfg(feature = "pdfium-backend")]
            PdfBackendImpl::Pdfium(backend) => backend.name(),
            PdfBackendImpl::Custom(backend) => backend.name(),
        }
    }

    fn is_healthy(&self) -> bool {
        match self {
            #[cfg(feature = "pdfium-backend")]
            PdfBackendImpl::Pdfium(backend) => backend.is_healthy(),
            PdfBackendImpl::Custom(backend) => backend.is_healthy(),
        }
    }
}

/// PDF Preprocessor with pluggable backend
///
/// Processes PDF documents through two stages:
/// 1. Backend extraction: PDF bytes → layout XHTML
/// 2. Layout parsing + spatial clustering: layout XHTML → Pages
///
/// A layout file can replace stage 1 for scanned exams whose PDF has no usable
/// text layer. Rasterisation always goes to the backend.
pub struct PdfPreprocessor {
    backend: Arc<PdfBackendImpl>,
    clustering: SpatialClusteringConfig,
    reference_scale: f32,
    layout_override: Option<PathBuf>,
}

impl PdfPreprocessor {
    pub fn new(backend: PdfBackendImpl, clustering: SpatialClusteringConfig, reference_scale: f32) -> Self {
        Self {
            backend: Arc::new(backend),
            clustering,
            reference_scale,
            layout_override: None,
        }
    }

    /// Create PdfPreprocessor with the pdfium backend
    #[cfg(feature = "pdfium-backend")]
    pub fn new_with_pdfium(
        library_dir: Option<&Path>,
        clustering: SpatialClusteringConfig,
        reference_scale: f32,
    ) -> Result<Self> {
        Ok(Self::new(
            PdfBackendImpl::Pdfium(PdfiumBackend::new(library_dir)?),
            clustering,
            reference_scale,
        ))
    }

    /// Read text and layout from `path` instead of the PDF text layer
    pub fn with_layout_override(mut self, path: PathBuf) -> Self {
        self.layout_override = Some(path);
        self
    }

    /// Get the backend name for logging
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Check if the backend is healthy
    pub fn is_healthy(&self) -> bool {
        self.backend.is_healthy()
    }
}

impl Preprocessor for PdfPreprocessor {
    /// Step 1: Extract PDF to layout XHTML via backend (or the override file)
    fn parse_pdf_to_markup_language(&self, pdf_bytes: &[u8]) -> Result<String> {
        match &self.layout_override {
            Some(path) => {
                log::info!("📐 Using layout file {}", path.display());
                std::fs::read_to_string(path)
                    .with_context(|| format!("reading layout file {}", path.display()))
            }
            None => self.backend.extract_to_layout(pdf_bytes),
        }
    }

    /// Step 2: Parse layout XHTML and cluster spans into blocks
    fn parse_markup_to_pages(&self, markup: &str) -> Result<Vec<Page>> {
        let raw_pages = layout_parser::parse_layout(markup)?;
        let clusterer = SpatialClusterer::new(&self.clustering);
        Ok(raw_pages
            .into_iter()
            .map(|raw| clusterer.build_page(raw, self.reference_scale))
            .collect())
    }

    fn rasterize_page(&self, pdf_bytes: &[u8], page: u32, scale: f32) -> Result<DynamicImage, RenderError> {
        self.backend.render_page(pdf_bytes, page, scale)
    }

    fn name(&self) -> &str {
        "PdfPreprocessor"
    }

    fn supports_file_type(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|extension| extension.to_str())
            .is_some_and(|extension| extension.eq_ignore_ascii_case("pdf"))
    }
}
