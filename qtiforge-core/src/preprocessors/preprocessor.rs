// Preprocessor abstraction for exam documents
//
// This module defines the boundary between document preprocessing (PDF -> Pages)
// and exam semantics (Pages -> QuestionChunks). Everything after this point works
// with Pages and is format-agnostic.

use crate::error::RenderError;
use crate::types::Page;
use anyhow::Result;
use image::DynamicImage;
use std::path::Path;

/// Preprocessor trait - converts documents to Pages
///
/// The preprocessing happens in two clear steps:
/// 1. Document -> layout markup (PDF -> layout XHTML)
/// 2. Layout markup -> Pages (spans clustered into lines and blocks)
pub trait Preprocessor: Send + Sync {
    /// Step 1: Convert document to layout markup
    fn parse_pdf_to_markup_language(&self, pdf_bytes: &[u8]) -> Result<String>;

    /// Step 2: Convert layout markup to pages
    fn parse_markup_to_pages(&self, markup: &str) -> Result<Vec<Page>>;

    /// Full document processing (combines both steps)
    fn process(&self, pdf_bytes: &[u8]) -> Result<Vec<Page>> {
        let markup = self.parse_pdf_to_markup_language(pdf_bytes)?;
        self.parse_markup_to_pages(&markup)
    }

    /// Rasterise one page of the document
    fn rasterize_page(&self, pdf_bytes: &[u8], page: u32, scale: f32) -> Result<DynamicImage, RenderError>;

    /// Get preprocessor name for debugging/logging
    fn name(&self) -> &str;

    /// Checked before the input file is read
    fn supports_file_type(&self, path: &Path) -> bool;
}
