//! Document Preprocessors
//!
//! This module provides the preprocessing layer that turns exam documents into
//! positioned text blocks and image regions.
//!
//! ## Architecture
//!
//! ```text
//! PDF bytes
//!     ↓
//! [PdfBackend]          (pdfium, or a custom backend)
//!     ↓
//! layout XHTML          (or a layout file from an OCR tool)
//!     ↓
//! [layout parser + spatial clustering]
//!     ↓
//! Vec<Page>
//! ```

pub mod pdf;
pub mod preprocessor;
pub mod spatial_clustering;

// Re-export main types
pub use pdf::{PdfBackend, PdfBackendImpl, PdfPreprocessor};
pub use preprocessor::Preprocessor;
pub use spatial_clustering::{flatten_text, SpatialClusterer};

#[cfg(feature = "pdfium-backend")]
pub use pdf::PdfiumBackend;
