use crate::cache::{
    calculate_config_hash, calculate_pdf_hash, NoOpCache, SegmentationCache, SegmentationCacheKey,
    SegmentationCacheValue,
};
use crate::classifier::VisualContentClassifier;
use crate::collaborators::{FeedbackSource, ModelClient, VisualAnalysisSource};
use crate::config::{GenerationConfig, PipelineConfig};
use crate::error::{ModelError, QuestionError};
use crate::output;
use crate::preprocessors::Preprocessor;
use crate::qti::{AnswerKey, AssemblyRequest, ItemAssembler, QtiGenerator};
use crate::rendering::{DocumentRasterizer, PageRenderer};
use crate::report::{QuestionOutcome, RunSummary, StepTiming};
use crate::segmentation::{SegmentationHints, Segmenter};
use crate::storage::AssetStorage;
use crate::types::*;
use crate::validation::{ChunkReport, SegmentationValidator, ValidationReport};
use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const VALIDATION_REPORT_FILE: &str = "validation_report.json";
pub const SEGMENTATION_FILE: &str = "segmentation.json";
pub const SUMMARY_FILE: &str = "summary.json";
pub const UNVALIDATED_DIR: &str = "unvalidated";

/// Simple profiler that collects timings for pipeline steps
pub struct StepProfiler {
    enabled: bool,
    timings: Vec<(String, Duration)>,
}

impl StepProfiler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            timings: Vec::new(),
        }
    }

    pub fn time_step<F, R>(&mut self, step_name: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        if !self.enabled {
            return f();
        }

        let start = Instant::now();
        let result = f();
        let elapsed = start.elapsed();

        self.timings.push((step_name.to_string(), elapsed));
        println!("⏱️  {}: {:.0}ms", step_name, elapsed.as_millis());

        result
    }

    pub fn timings(&self) -> Vec<StepTiming> {
        self.timings
            .iter()
            .map(|(step, duration)| StepTiming {
                step: step.clone(),
                millis: duration.as_millis() as u64,
            })
            .collect()
    }

    pub fn print_summary(&self) {
        if !self.enabled || self.timings.is_empty() {
            return;
        }

        println!("\n📊 Performance Summary:");
        let total: Duration = self.timings.iter().map(|(_, d)| *d).sum();

        for (step, duration) in &self.timings {
            let percentage = (duration.as_secs_f64() / total.as_secs_f64().max(f64::EPSILON)) * 100.0;
            println!("   {:.<35} {:.0}ms ({:.1}%)", step, duration.as_millis(), percentage);
        }
        println!("   {:.<35} {:.0}ms", "Total", total.as_millis());
    }
}

/// Per-run inputs besides the PDF itself.
#[derive(Default)]
pub struct RunOptions {
    pub output_dir: PathBuf,
    pub hints: Option<SegmentationHints>,
    /// Corrected `segmentation.json` from an earlier run; skips segmentation
    pub reentry: Option<PathBuf>,
    /// Without a key items are written with no correct response
    pub answer_key: Option<AnswerKey>,
    pub skip_cache: bool,
    pub profile: bool,
}

/// `unvalidated/<Qn>.json`
#[derive(Debug, Serialize, Deserialize)]
pub struct UnvalidatedChunk {
    pub chunk: QuestionChunk,
    pub report: ChunkReport,
}

/// Shared, read-only state of the generation phase.
struct GenerationContext<'a> {
    segmentation: &'a Segmentation,
    pages: &'a [Page],
    renderer: &'a PageRenderer<'a>,
    assembler: &'a ItemAssembler<'a>,
    answer_key: Option<&'a AnswerKey>,
    output_dir: &'a Path,
    halt: &'a AtomicBool,
    halt_reason: &'a Mutex<Option<String>>,
}

impl GenerationContext<'_> {
    fn halted(&self) -> bool {
        self.halt.load(Ordering::SeqCst)
    }

    /// First caller wins; later questions see `halted()` and are skipped.
    fn trip(&self, reason: String) {
        if !self.halt.swap(true, Ordering::SeqCst) {
            log::error!("🛑 Halting batch: {}", reason);
            if let Ok(mut slot) = self.halt_reason.lock() {
                *slot = Some(reason);
            }
        }
    }
}

pub struct ExamProcessor {
    preprocessor: Box<dyn Preprocessor>,
    cache: Box<dyn SegmentationCache>,
    storage: Arc<dyn AssetStorage>,
    model: Option<Arc<dyn ModelClient>>,
    visual_analysis: Option<Box<dyn VisualAnalysisSource>>,
    feedback: Option<Box<dyn FeedbackSource>>,
    segmenter: Segmenter,
    validator: SegmentationValidator,
    classifier: VisualContentClassifier,
    config: PipelineConfig,
}

impl ExamProcessor {
    /// Create ExamProcessor with full dependency injection
    pub fn new_with_dependencies(
        preprocessor: Box<dyn Preprocessor>,
        storage: Arc<dyn AssetStorage>,
        config: PipelineConfig,
    ) -> Result<Self> {
        Ok(Self {
            preprocessor,
            cache: Box::new(NoOpCache),
            storage,
            model: None,
            visual_analysis: None,
            feedback: None,
            segmenter: Segmenter::new(&config.segmentation)?,
            validator: SegmentationValidator::new(&config.validation, &config.segmentation)?,
            classifier: VisualContentClassifier::new(&config.classifier)?,
            config,
        })
    }

    /// Convenience constructor for CLI usage with the pdfium backend
    #[cfg(feature = "pdfium-backend")]
    pub fn new_with_pdfium(
        library_dir: Option<&Path>,
        storage: Arc<dyn AssetStorage>,
        config: PipelineConfig,
    ) -> Result<Self> {
        let preprocessor = crate::preprocessors::PdfPreprocessor::new_with_pdfium(
            library_dir,
            config.spatial_clustering.clone(),
            config.rendering.scale,
        )?;
        Self::new_with_dependencies(Box::new(preprocessor), storage, config)
    }

    pub fn with_cache(mut self, cache: Box<dyn SegmentationCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Model used for window segmentation of long exams
    pub fn with_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_visual_analysis(mut self, source: Box<dyn VisualAnalysisSource>) -> Self {
        self.visual_analysis = Some(source);
        self
    }

    pub fn with_feedback(mut self, source: Box<dyn FeedbackSource>) -> Self {
        self.feedback = Some(source);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// PDF → `<out>/<Qn>/question.xml` for every self-contained question.
    ///
    /// Per-question failures are recorded in the summary and never abort the
    /// run. `Err` means the run itself could not proceed (unreadable input,
    /// extraction or segmentation failure, unwritable output).
    pub fn process(&self, input: &Path, options: &RunOptions) -> Result<RunSummary> {
        let start_time = Instant::now();
        let mut profiler = StepProfiler::new(options.profile);

        anyhow::ensure!(
            self.preprocessor.supports_file_type(input),
            "{} cannot read {}",
            self.preprocessor.name(),
            input.display()
        );
        let pdf_bytes = std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
        let pdf_hash = calculate_pdf_hash(&pdf_bytes);
        let mut summary = RunSummary::start(&input.display().to_string(), &pdf_hash);
        log::info!("📄 Processing exam: {}", input.display());

        let pages = profiler.time_step("1. Extraction", || self.preprocessor.process(&pdf_bytes))?;
        summary.page_count = pages.len();
        log::info!("   📑 {} pages via {}", pages.len(), self.preprocessor.name());

        let segmentation = profiler.time_step("2. Segmentation", || self.segmentation_for(&pages, &pdf_hash, options))?;
        summary.strategy = Some(segmentation.strategy);
        output::write_json_atomic(&options.output_dir.join(SEGMENTATION_FILE), &segmentation)?;

        let reports = profiler.time_step("3. Validation", || self.validator.validate(&segmentation, &pages));
        self.write_validation_outputs(&segmentation, &reports, &options.output_dir)?;

        let mut pending = Vec::new();
        for (index, (chunk, report)) in segmentation.chunks.iter().zip(&reports).enumerate() {
            let mut outcome = QuestionOutcome::segmented(chunk);
            if report.is_self_contained {
                outcome.advance(QuestionState::Validated)?;
                pending.push((index, outcome));
            } else {
                outcome.finish(QuestionState::Rejected, report.errors.join("; "))?;
                summary.questions.push(outcome);
            }
        }
        for &number in &segmentation.missing_questions {
            let position = segmentation
                .chunks
                .iter()
                .find(|c| c.question_number > number)
                .map_or(segmentation.chunks.len(), |c| c.position);
            summary.questions.push(QuestionOutcome::missing(number, position));
        }

        let (generated, halt_reason) =
            profiler.time_step("4. Generation", || self.generate_all(&segmentation, &pages, &pdf_bytes, pending, options))?;
        summary.questions.extend(generated);
        summary.halted = halt_reason;

        summary.timings = profiler.timings();
        summary.finish();
        output::write_json_atomic(&options.output_dir.join(SUMMARY_FILE), &summary)?;
        summary.log_summary();
        profiler.print_summary();
        log::info!("⏱️  Total processing time: {:.3}s", start_time.elapsed().as_secs_f64());
        Ok(summary)
    }

    /// Re-entry file, then cache, then the segmenter.
    fn segmentation_for(&self, pages: &[Page], pdf_hash: &str, options: &RunOptions) -> Result<Segmentation> {
        if let Some(path) = &options.reentry {
            log::info!("↩️  Re-entering with chunks from {}", path.display());
            let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            let mut segmentation: Segmentation =
                serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
            if segmentation.page_count != pages.len() {
                log::warn!(
                    "⚠️  Re-entry chunks were cut from {} pages, document has {}",
                    segmentation.page_count,
                    pages.len()
                );
            }
            segmentation.strategy = SegmentationStrategy::Reentry;
            segmentation.page_count = pages.len();
            return Ok(segmentation);
        }

        let config_hash = calculate_config_hash(&(
            &self.config.segmentation,
            &self.config.spatial_clustering,
            &options.hints,
        ))?;
        let cache_key = SegmentationCacheKey::new(pdf_hash.to_string(), config_hash);

        if options.skip_cache {
            log::info!("🚫 Skipping cache lookup (--skip-cache enabled)");
        } else if let Some(cached) = self.cache.get(&cache_key)? {
            log::info!("🎯 Cache hit: segmentation for PDF + config combination");
            return Ok(cached.segmentation);
        }

        let start = Instant::now();
        let segmentation = self
            .segmenter
            .segment(pages, options.hints.as_ref(), self.model.as_deref())?;

        if !options.skip_cache {
            let value = SegmentationCacheValue::new(segmentation.clone(), start.elapsed().as_millis() as u64);
            self.cache.store(&cache_key, &value)?;
        }
        Ok(segmentation)
    }

    fn write_validation_outputs(
        &self,
        segmentation: &Segmentation,
        reports: &[ChunkReport],
        output_dir: &Path,
    ) -> Result<()> {
        let unvalidated = output_dir.join(UNVALIDATED_DIR);
        for (chunk, report) in segmentation.chunks.iter().zip(reports) {
            let path = unvalidated.join(format!("{}.json", chunk.id));
            if report.is_self_contained {
                // a re-entered chunk that now passes leaves the bucket
                if path.exists() {
                    std::fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
                }
            } else {
                output::write_json_atomic(
                    &path,
                    &UnvalidatedChunk {
                        chunk: chunk.clone(),
                        report: report.clone(),
                    },
                )?;
                remove_stale_item(output_dir, &chunk.id)?;
            }
        }
        for &number in &segmentation.missing_questions {
            remove_stale_item(output_dir, &QuestionChunk::id_for(number))?;
        }
        output::write_json_atomic(
            &output_dir.join(VALIDATION_REPORT_FILE),
            &ValidationReport::new(reports.to_vec()),
        )
    }

    fn generate_all(
        &self,
        segmentation: &Segmentation,
        pages: &[Page],
        pdf_bytes: &[u8],
        pending: Vec<(usize, QuestionOutcome)>,
        options: &RunOptions,
    ) -> Result<(Vec<QuestionOutcome>, Option<String>)> {
        if pending.is_empty() {
            return Ok((Vec::new(), None));
        }

        let generation = GenerationConfig {
            allow_missing_answer: self.config.generation.allow_missing_answer || options.answer_key.is_none(),
            ..self.config.generation.clone()
        };
        if options.answer_key.is_none() {
            log::warn!("⚠️  No answer key: items are written without a correct response");
        }

        let generator = QtiGenerator::new(&generation);
        let rasterizer = DocumentRasterizer::new(self.preprocessor.as_ref(), pdf_bytes);
        let renderer = PageRenderer::new(&rasterizer, &self.config.rendering);
        let assembler = ItemAssembler::new(
            pages,
            &renderer,
            self.storage.as_ref(),
            &generator,
            self.config.rendering.scale,
        );
        let halt = AtomicBool::new(false);
        let halt_reason = Mutex::new(None);
        let context = GenerationContext {
            segmentation,
            pages,
            renderer: &renderer,
            assembler: &assembler,
            answer_key: options.answer_key.as_ref(),
            output_dir: &options.output_dir,
            halt: &halt,
            halt_reason: &halt_reason,
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers.max(1))
            .build()
            .context("building generation thread pool")?;
        log::info!(
            "🏗️  Generating {} questions on {} workers",
            pending.len(),
            self.config.workers.max(1)
        );

        let outcomes: Vec<QuestionOutcome> = pool.install(|| {
            pending
                .into_par_iter()
                .map(|(index, mut outcome)| {
                    let chunk = &segmentation.chunks[index];
                    if let Err(e) = self.generate_question(&context, chunk, &mut outcome) {
                        log::error!("❌ {}: {:#}", chunk.id, e);
                        outcome.reasons.push(format!("{:#}", e));
                    }
                    outcome
                })
                .collect()
        });

        let reason = halt_reason.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok((outcomes, reason))
    }

    /// classify → render → store → assemble → write, for one validated chunk.
    fn generate_question(
        &self,
        context: &GenerationContext,
        chunk: &QuestionChunk,
        outcome: &mut QuestionOutcome,
    ) -> Result<()> {
        if context.halted() {
            return outcome.finish(QuestionState::Skipped, "batch halted before this question");
        }
        if chunk.content.choices.is_empty() {
            return outcome.finish(QuestionState::Skipped, "no choice interaction (parts only)");
        }

        let analysis = match self.analyze(context, chunk, outcome) {
            Ok(analysis) => analysis,
            Err(e) => return self.fail(context, outcome, QuestionError::Model(e)),
        };
        let classification = self.classifier.classify(chunk, analysis.as_ref());
        log::debug!(
            "   🔎 {} choice-diagram={} prompt-visuals={}",
            chunk.id,
            classification.is_choice_diagram_question,
            classification.has_prompt_visuals
        );
        outcome.classification = Some(classification.clone());
        outcome.advance(QuestionState::Classified)?;

        let feedback = match (&self.feedback, self.config.generation.include_feedback) {
            (Some(source), true) => match source.feedback(chunk) {
                Ok(feedback) => feedback,
                Err(e @ ModelError::Unreachable { .. }) => return self.fail(context, outcome, QuestionError::Model(e)),
                Err(e) => {
                    log::warn!("⚠️  {}: feedback unavailable: {}", chunk.id, e);
                    outcome.reasons.push(format!("feedback unavailable: {}", e));
                    None
                }
            },
            _ => None,
        };

        let shared_context = chunk
            .shared_context_id
            .as_deref()
            .and_then(|id| context.segmentation.shared_context(id));
        let request = AssemblyRequest {
            chunk,
            shared_context,
            classification: &classification,
            correct: context.answer_key.and_then(|key| key.get(chunk.question_number)),
            feedback: feedback.as_ref(),
        };

        let assembled = match context.assembler.assemble(&request) {
            Ok(assembled) => assembled,
            Err(failure) => {
                if !failure.orphaned.is_empty() {
                    outcome.reasons.push(format!("left in storage: {}", failure.orphaned.join(", ")));
                }
                return self.fail(context, outcome, failure.error);
            }
        };
        outcome.degradations.extend(assembled.degradations);
        outcome.image_urls = assembled.item.image_urls.clone();
        outcome.advance(QuestionState::Assembled)?;

        if context.halted() {
            // another question lost a shared collaborator after this one uploaded
            return outcome.finish(QuestionState::Skipped, "batch halted before write");
        }
        let path = output::question_file(context.output_dir, &chunk.id);
        if let Err(e) = output::write_atomic(&path, assembled.item.xml.as_bytes()) {
            return outcome.finish(QuestionState::Failed, format!("writing {}: {:#}", path.display(), e));
        }
        outcome.advance(QuestionState::Written)?;
        log::info!("   ✅ {} written", chunk.id);
        Ok(())
    }

    fn analyze(
        &self,
        context: &GenerationContext,
        chunk: &QuestionChunk,
        outcome: &mut QuestionOutcome,
    ) -> Result<Option<VisualAnalysis>, ModelError> {
        let Some(source) = &self.visual_analysis else {
            return Ok(None);
        };
        let mut images = Vec::new();
        if source.wants_images() {
            for region in &chunk.regions {
                let Some(page) = context.pages.iter().find(|p| p.number == region.page) else {
                    continue;
                };
                let rendered = context
                    .renderer
                    .render_region(page, &region.bbox, self.config.rendering.scale);
                outcome.degradations.extend(rendered.degradation);
                images.push(rendered.png);
            }
        }
        match source.analyze(chunk, &images) {
            Ok(analysis) => Ok(analysis),
            Err(e @ ModelError::Unreachable { .. }) => Err(e),
            Err(e) => {
                // The AI pass only ever strengthens the text signals.
                log::warn!("⚠️  {}: visual analysis ignored: {}", chunk.id, e);
                outcome.reasons.push(format!("visual analysis ignored: {}", e));
                Ok(None)
            }
        }
    }

    fn fail(&self, context: &GenerationContext, outcome: &mut QuestionOutcome, error: QuestionError) -> Result<()> {
        if error.halts_batch() {
            context.trip(format!("{}: {}", outcome.question_id, error));
        }
        log::warn!("❌ {} failed: {}", outcome.question_id, error);
        if outcome.state == QuestionState::Validated {
            outcome.advance(QuestionState::Classified)?;
        }
        outcome.finish(QuestionState::Failed, error.to_string())
    }
}

/// A question rejected on this run keeps no item from an earlier one.
fn remove_stale_item(output_dir: &Path, question_id: &str) -> Result<()> {
    let path = output::question_file(output_dir, question_id);
    if path.exists() {
        log::warn!("🗑️  {} is rejected, removing its earlier {}", question_id, path.display());
        std::fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_profiler_records_nothing() {
        let mut profiler = StepProfiler::new(false);
        let value = profiler.time_step("step", || 7);
        assert_eq!(value, 7);
        assert!(profiler.timings().is_empty());
    }

    #[test]
    fn enabled_profiler_records_steps_in_order() {
        let mut profiler = StepProfiler::new(true);
        profiler.time_step("a", || ());
        profiler.time_step("b", || ());
        let steps: Vec<String> = profiler.timings().into_iter().map(|t| t.step).collect();
        assert_eq!(steps, vec!["a", "b"]);
    }
}
