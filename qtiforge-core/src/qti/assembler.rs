//! Visual upload and item assembly for one question.
//!
//! Order per question is fixed: render every region, store every PNG, then
//! substitute the returned URLs into the item. Nothing is written to the
//! output tree here.

use super::generator::{ItemContent, QtiGenerator};
use crate::collaborators::ChoiceFeedback;
use crate::error::QuestionError;
use crate::geometry::{overlaps, BoundingBox};
use crate::rendering::{PageRenderer, RenderDegradation};
use crate::storage::AssetStorage;
use crate::types::{ChoiceLetter, Page, QtiItem, QuestionChunk, SharedContext, VisualClassification};
use std::collections::BTreeMap;

pub struct AssemblyRequest<'a> {
    pub chunk: &'a QuestionChunk,
    pub shared_context: Option<&'a SharedContext>,
    pub classification: &'a VisualClassification,
    pub correct: Option<ChoiceLetter>,
    pub feedback: Option<&'a ChoiceFeedback>,
}

#[derive(Debug, Clone)]
pub struct AssembledItem {
    pub item: QtiItem,
    pub degradations: Vec<RenderDegradation>,
}

/// A failed assembly and the objects it had already stored.
#[derive(Debug)]
pub struct AssemblyFailure {
    pub error: QuestionError,
    pub orphaned: Vec<String>,
}

/// A region to render and the object name it is stored under.
struct VisualJob {
    page: u32,
    bbox: BoundingBox,
    name: String,
}

pub struct ItemAssembler<'a> {
    pages: &'a [Page],
    renderer: &'a PageRenderer<'a>,
    storage: &'a dyn AssetStorage,
    generator: &'a QtiGenerator,
    scale: f32,
}

impl<'a> ItemAssembler<'a> {
    pub fn new(
        pages: &'a [Page],
        renderer: &'a PageRenderer<'a>,
        storage: &'a dyn AssetStorage,
        generator: &'a QtiGenerator,
        scale: f32,
    ) -> Self {
        Self {
            pages,
            renderer,
            storage,
            generator,
            scale,
        }
    }

    pub fn assemble(&self, request: &AssemblyRequest) -> Result<AssembledItem, AssemblyFailure> {
        let mut stored = Vec::new();
        self.build(request, &mut stored).map_err(|error| {
            if !stored.is_empty() {
                log::warn!(
                    "⚠️  {} failed after storing {}; these objects are orphaned",
                    request.chunk.id,
                    stored.join(", ")
                );
            }
            AssemblyFailure { error, orphaned: stored }
        })
    }

    fn build(&self, request: &AssemblyRequest, stored: &mut Vec<String>) -> Result<AssembledItem, QuestionError> {
        let chunk = request.chunk;
        let classification = request.classification;
        let qid = &chunk.id;

        let mut choice_jobs = Vec::new();
        if classification.is_choice_diagram_question {
            let mut regions: Vec<_> = classification.choice_regions.iter().collect();
            regions.sort_by_key(|r| r.letter);
            for region in regions {
                choice_jobs.push((
                    region.letter,
                    VisualJob {
                        page: region.page,
                        bbox: region.bbox,
                        name: format!("{}_alt{}.png", qid, region.letter),
                    },
                ));
            }
        }

        // Context visuals come first in the body, so they take the first numbers.
        let mut image_number = 0;
        let mut next_name = || {
            image_number += 1;
            format!("{}_img{}.png", qid, image_number)
        };

        let context_jobs: Vec<VisualJob> = request
            .shared_context
            .map(|shared| {
                shared
                    .images
                    .iter()
                    .map(|image| VisualJob {
                        page: image.page,
                        bbox: image.bbox,
                        name: next_name(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let prompt_jobs: Vec<VisualJob> = if classification.has_prompt_visuals {
            chunk
                .images
                .iter()
                .filter(|image| {
                    !classification
                        .choice_regions
                        .iter()
                        .any(|r| r.page == image.page && overlaps(&r.bbox, &image.bbox))
                })
                .map(|image| VisualJob {
                    page: image.page,
                    bbox: image.bbox,
                    name: next_name(),
                })
                .collect()
        } else {
            if !chunk.images.is_empty() && !classification.is_choice_diagram_question {
                log::debug!("   {} has {} images not classified as prompt visuals", qid, chunk.images.len());
            }
            Vec::new()
        };

        let mut degradations = Vec::new();
        let context_images = self.upload(&context_jobs, &mut degradations, stored)?;
        let prompt_images = self.upload(&prompt_jobs, &mut degradations, stored)?;
        let (letters, jobs): (Vec<ChoiceLetter>, Vec<VisualJob>) = choice_jobs.into_iter().unzip();
        let choice_urls = self.upload(&jobs, &mut degradations, stored)?;
        let choice_images: BTreeMap<ChoiceLetter, String> = letters.into_iter().zip(choice_urls).collect();

        let item = self.generator.build_item(&ItemContent {
            chunk,
            shared_context: request.shared_context,
            correct: request.correct,
            feedback: request.feedback,
            context_images: &context_images,
            prompt_images: &prompt_images,
            choice_images: &choice_images,
        })?;

        Ok(AssembledItem { item, degradations })
    }

    /// Render then store every job, returning URLs in job order. Stored names
    /// are appended to `stored` as they succeed.
    fn upload(
        &self,
        jobs: &[VisualJob],
        degradations: &mut Vec<RenderDegradation>,
        stored: &mut Vec<String>,
    ) -> Result<Vec<String>, QuestionError> {
        let pngs = self.render_all(jobs)?;
        let mut urls = Vec::with_capacity(jobs.len());
        for (job, (png, degradation)) in jobs.iter().zip(pngs) {
            if let Some(degradation) = degradation {
                log::warn!("⚠️  {} rendered degraded: {}", job.name, degradation.reason);
                degradations.push(degradation);
            }
            let url = self.storage.store(&job.name, &png, "image/png")?;
            stored.push(job.name.clone());
            log::debug!("   📤 {} → {}", job.name, url);
            urls.push(url);
        }
        Ok(urls)
    }

    /// One raster per page, cropped for every job on it.
    fn render_all(&self, jobs: &[VisualJob]) -> Result<Vec<(Vec<u8>, Option<RenderDegradation>)>, QuestionError> {
        let mut by_page: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (index, job) in jobs.iter().enumerate() {
            by_page.entry(job.page).or_default().push(index);
        }

        let mut rendered: Vec<Option<(Vec<u8>, Option<RenderDegradation>)>> = vec![None; jobs.len()];
        for (page_number, indices) in by_page {
            let page = self
                .pages
                .iter()
                .find(|p| p.number == page_number)
                .ok_or_else(|| anyhow::anyhow!("visual on page {} which the document does not have", page_number))?;
            let boxes: Vec<BoundingBox> = indices.iter().map(|&i| jobs[i].bbox).collect();
            let outcomes = self.renderer.render_regions(page, &boxes, self.scale);
            for (&index, outcome) in indices.iter().zip(outcomes) {
                rendered[index] = Some((outcome.png, outcome.degradation));
            }
        }
        Ok(rendered.into_iter().flatten().collect())
    }
}
