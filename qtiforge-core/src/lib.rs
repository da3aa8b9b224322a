// QTIForge Core Library
//
// Exam PDF segmentation, visual classification and QTI 3.0 item generation.
// Main interface for converting exam documents to per-question items.

pub mod types;
pub mod geometry;
pub mod error;
pub mod preprocessors;
pub mod rendering;
pub mod segmentation;
pub mod validation;
pub mod classifier;
pub mod qti;
pub mod processor;
pub mod report;
pub mod cache;
pub mod config;
pub mod storage;
pub mod collaborators;
pub mod retry;
pub mod output;

// Re-export main types and functions for easy use
pub use types::*;
pub use preprocessors::{PdfBackend, PdfBackendImpl, PdfPreprocessor, Preprocessor};
pub use processor::{ExamProcessor, RunOptions};
pub use config::PipelineConfig;
pub use report::RunSummary;

// Re-export backends for direct use
#[cfg(feature = "pdfium-backend")]
pub use preprocessors::PdfiumBackend;
