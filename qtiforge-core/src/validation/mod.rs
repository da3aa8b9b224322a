//! Self-containment gate between segmentation and generation.
//!
//! Checks run in the order the config lists them, like a rule pipeline.
//! A chunk with any error is quarantined; warnings are reported only.

pub mod checks;

use crate::config::{SegmentationConfig, ValidationConfig};
use crate::geometry::BoundingBox;
use crate::segmentation::{ContentParser, QuestionDetector};
use crate::types::{Page, QuestionChunk, Segmentation};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkReport {
    pub question_id: String,
    pub question_number: u32,
    pub is_self_contained: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ChunkReport {
    fn new(chunk: &QuestionChunk) -> Self {
        Self {
            question_id: chunk.id.clone(),
            question_number: chunk.question_number,
            is_self_contained: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// `validation_report.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub generated_at: DateTime<Utc>,
    pub total: usize,
    pub validated: usize,
    pub rejected: usize,
    pub chunks: Vec<ChunkReport>,
}

impl ValidationReport {
    pub fn new(chunks: Vec<ChunkReport>) -> Self {
        let validated = chunks.iter().filter(|c| c.is_self_contained).count();
        Self {
            generated_at: Utc::now(),
            total: chunks.len(),
            validated,
            rejected: chunks.len() - validated,
            chunks,
        }
    }
}

/// What a check sees besides the chunk itself.
pub struct CheckContext<'a> {
    pub segmentation: &'a Segmentation,
    /// Index of the chunk in `segmentation.chunks`
    pub index: usize,
    pub page_bounds: &'a BTreeMap<u32, BoundingBox>,
    pub parser: &'a ContentParser,
    pub detector: &'a QuestionDetector,
    pub config: &'a ValidationConfig,
}

impl CheckContext<'_> {
    pub fn neighbour(&self, offset: isize) -> Option<&QuestionChunk> {
        let index = self.index.checked_add_signed(offset)?;
        self.segmentation.chunks.get(index)
    }
}

pub trait ChunkCheck: Send + Sync {
    fn check(&self, chunk: &QuestionChunk, context: &CheckContext, report: &mut ChunkReport);
    fn name(&self) -> &str;
}

pub struct SegmentationValidator {
    config: ValidationConfig,
    parser: ContentParser,
    detector: QuestionDetector,
}

impl SegmentationValidator {
    pub fn new(config: &ValidationConfig, segmentation: &SegmentationConfig) -> Result<Self> {
        Ok(Self {
            config: config.clone(),
            parser: ContentParser::new(segmentation)?,
            detector: QuestionDetector::new(segmentation)?,
        })
    }

    fn check_by_name(name: &str) -> Option<Box<dyn ChunkCheck>> {
        use checks::*;
        let check: Box<dyn ChunkCheck> = match name {
            "BoundingBoxes" => Box::new(BoundingBoxesCheck),
            "StemPresent" => Box::new(StemPresentCheck),
            "ChoicesComplete" => Box::new(ChoicesCompleteCheck),
            "NoContamination" => Box::new(NoContaminationCheck),
            "NoInternalSplit" => Box::new(NoInternalSplitCheck),
            "NumberingContinuous" => Box::new(NumberingContinuousCheck),
            "SharedContextResolved" => Box::new(SharedContextResolvedCheck),
            "MultiPartComplete" => Box::new(MultiPartCompleteCheck),
            _ => return None,
        };
        Some(check)
    }

    /// One report per chunk, in chunk order.
    pub fn validate(&self, segmentation: &Segmentation, pages: &[Page]) -> Vec<ChunkReport> {
        let page_bounds: BTreeMap<u32, BoundingBox> = pages.iter().map(|p| (p.number, p.bounds())).collect();

        let mut active: Vec<Box<dyn ChunkCheck>> = Vec::new();
        for check_config in &self.config.checks {
            if !check_config.enabled {
                log::debug!("   ⏭️  Skipping disabled check: {}", check_config.name);
                continue;
            }
            match Self::check_by_name(&check_config.name) {
                Some(check) => active.push(check),
                None => log::warn!("⚠️  Unknown validation check: {}. Skipping...", check_config.name),
            }
        }

        log::info!(
            "🔍 Validating {} chunks with {} checks",
            segmentation.chunks.len(),
            active.len()
        );

        let reports: Vec<ChunkReport> = segmentation
            .chunks
            .iter()
            .enumerate()
            .map(|(index, chunk)| {
                let context = CheckContext {
                    segmentation,
                    index,
                    page_bounds: &page_bounds,
                    parser: &self.parser,
                    detector: &self.detector,
                    config: &self.config,
                };
                let mut report = ChunkReport::new(chunk);
                for check in &active {
                    check.check(chunk, &context, &mut report);
                }
                report.is_self_contained = report.errors.is_empty();
                if !report.is_self_contained {
                    log::warn!("🚫 {} quarantined: {}", chunk.id, report.errors.join("; "));
                }
                report
            })
            .collect();

        let rejected = reports.iter().filter(|r| !r.is_self_contained).count();
        log::info!("   ✅ {} validated, {} quarantined", reports.len() - rejected, rejected);
        reports
    }
}
