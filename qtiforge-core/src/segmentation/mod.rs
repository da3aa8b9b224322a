//! Exam segmentation: pages in, one `QuestionChunk` per question out.
//!
//! Three strategies share the same assembly step:
//! - caller hints (pages or regions per question) win when supplied
//! - long documents are windowed through the model, which returns hints
//! - everything else is segmented directly from question start lines
//!
//! Assembly turns line ownership into per-page regions, assigns embedded
//! images to the question (or shared context) that sits around them, and
//! parses stem, choices and parts.

pub mod content;
pub mod hints;
pub mod lines;
pub mod question_detection;

pub use content::{declared_choice_count, declared_part_count, ContentParser, LineKind};
pub use hints::{QuestionHint, SegmentationHints, SharedContextHint};
pub use lines::{collect_lines, DocLine};
pub use question_detection::{ContextHeader, QuestionDetector, QuestionStart};

use crate::collaborators::ModelClient;
use crate::config::SegmentationConfig;
use crate::geometry::{shrink_away_from_text, union_all, BoundingBox};
use crate::types::*;
use anyhow::Result;
use std::collections::{BTreeMap, HashSet};

/// Lines owned by one question before assembly.
struct QuestionPlan {
    number: u32,
    lines: Vec<usize>,
    /// Byte offset past the printed number on the first line, if it has one
    first_line_offset: Option<usize>,
    shared_context_id: Option<String>,
}

struct ContextPlan {
    id: String,
    lines: Vec<usize>,
    question_numbers: Vec<u32>,
    text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Question(usize),
    Context(usize),
}

pub struct Segmenter {
    config: SegmentationConfig,
    detector: QuestionDetector,
    parser: ContentParser,
}

impl Segmenter {
    pub fn new(config: &SegmentationConfig) -> Result<Self> {
        Ok(Self {
            config: config.clone(),
            detector: QuestionDetector::new(config)?,
            parser: ContentParser::new(config)?,
        })
    }

    pub fn parser(&self) -> &ContentParser {
        &self.parser
    }

    /// Segment a document.
    ///
    /// A model failure is returned as an error rather than degraded into
    /// direct segmentation: long exams segmented directly tend to lose
    /// questions silently.
    pub fn segment(
        &self,
        pages: &[Page],
        hints: Option<&SegmentationHints>,
        model: Option<&dyn ModelClient>,
    ) -> Result<Segmentation> {
        if let Some(hints) = hints {
            log::info!("🧩 Segmenting from {} supplied question hints", hints.questions.len());
            let mut hints = hints.clone();
            hints.restrict_to(pages.len());
            return Ok(self.segment_from_hints(pages, &hints, SegmentationStrategy::Hints));
        }

        if pages.len() > self.config.llm_split_page_threshold {
            match model {
                Some(model) => {
                    let hints = hints::request_hints(pages, &self.config, model)?;
                    return Ok(self.segment_from_hints(pages, &hints, SegmentationStrategy::LlmAssisted));
                }
                None => log::warn!(
                    "⚠️  {} pages exceeds the model-assisted threshold of {} but no model is configured, segmenting directly",
                    pages.len(),
                    self.config.llm_split_page_threshold
                ),
            }
        }

        Ok(self.segment_direct(pages))
    }

    pub fn segment_direct(&self, pages: &[Page]) -> Segmentation {
        let lines = collect_lines(pages, &self.config);
        let starts = self.detector.detect_starts(&lines);
        if starts.is_empty() {
            log::warn!("⚠️  No question starts found in {} lines", lines.len());
            return Segmentation {
                chunks: Vec::new(),
                shared_contexts: Vec::new(),
                strategy: SegmentationStrategy::Direct,
                page_count: pages.len(),
                missing_questions: Vec::new(),
            };
        }
        let headers = self.detector.context_headers(&lines);

        // For each start, the shared-context header announcing it, found
        // between the previous start and this one.
        let mut context_cuts: Vec<Option<ContextHeader>> = Vec::with_capacity(starts.len());
        for (k, start) in starts.iter().enumerate() {
            let floor = if k == 0 { None } else { Some(starts[k - 1].line) };
            let header = headers
                .iter()
                .filter(|h| h.first == start.number && h.line < start.line && floor.map_or(true, |f| h.line > f))
                .last()
                .copied();
            context_cuts.push(header);
        }

        let mut contexts = Vec::new();
        for (k, cut) in context_cuts.iter().enumerate() {
            if let Some(header) = cut {
                contexts.push(ContextPlan {
                    id: SharedContext::id_for(header.first, header.last),
                    lines: (header.line..starts[k].line).collect(),
                    question_numbers: (header.first..=header.last).collect(),
                    text: None,
                });
            }
        }

        let mut questions = Vec::with_capacity(starts.len());
        for (k, start) in starts.iter().enumerate() {
            let end = match (starts.get(k + 1), context_cuts.get(k + 1).copied().flatten()) {
                (_, Some(header)) => header.line,
                (Some(next), None) => next.line,
                (None, None) => lines.len(),
            };
            let shared_context_id = contexts
                .iter()
                .find(|c| c.question_numbers.contains(&start.number))
                .map(|c| c.id.clone());
            questions.push(QuestionPlan {
                number: start.number,
                lines: (start.line..end).collect(),
                first_line_offset: Some(start.text_offset),
                shared_context_id,
            });
        }

        let preamble_end = context_cuts[0].map_or(starts[0].line, |h| h.line);
        let preamble: Vec<&str> = lines[..preamble_end].iter().map(|l| l.text.as_str()).collect();
        let document_choice_count = declared_choice_count(&preamble.join("\n"));

        // Answer choices before the first start mean the first questions lost their numbers.
        let first = starts[0].number;
        let mut orphaned = Vec::new();
        if first > 1
            && first - 1 <= self.config.max_missing_starts
            && preamble
                .iter()
                .any(|line| matches!(self.parser.classify_line(line), LineKind::Choice(..) | LineKind::InlineChoices(_)))
        {
            log::warn!("⚠️  Answer choices found before question {}; its predecessors have no readable start", first);
            orphaned.extend(1..first);
        }

        log::info!(
            "🧩 Direct segmentation: {} questions, {} shared contexts",
            questions.len(),
            contexts.len()
        );
        self.assemble(
            pages,
            &lines,
            questions,
            contexts,
            document_choice_count,
            orphaned,
            SegmentationStrategy::Direct,
        )
    }

    pub fn segment_from_hints(
        &self,
        pages: &[Page],
        hints: &SegmentationHints,
        strategy: SegmentationStrategy,
    ) -> Segmentation {
        let lines = collect_lines(pages, &self.config);
        let hinted: HashSet<u32> = hints.questions.iter().map(|q| q.question_number).collect();
        let mut claimed = vec![false; lines.len()];

        let mut questions = Vec::with_capacity(hints.questions.len());
        for hint in &hints.questions {
            let selected = if hint.regions.is_empty() {
                self.locate_on_pages(&lines, hint, &hinted)
            } else {
                lines_in_regions(&lines, &hint.regions)
            };
            if selected.is_empty() {
                log::warn!("⚠️  Hinted question {} has no text on its pages", hint.question_number);
            }
            for &i in &selected {
                claimed[i] = true;
            }

            let first_line_offset = selected.first().and_then(|&i| {
                self.detector
                    .match_start(&lines[i].text)
                    .filter(|(n, _)| *n == hint.question_number)
                    .map(|(_, offset)| offset)
            });
            let shared_context_id = hint.shared_context_id.clone().or_else(|| {
                hints
                    .shared_contexts
                    .iter()
                    .find(|c| c.question_numbers.contains(&hint.question_number))
                    .map(|c| c.id.clone())
            });
            questions.push(QuestionPlan {
                number: hint.question_number,
                lines: selected,
                first_line_offset,
                shared_context_id,
            });
        }

        let contexts = hints
            .shared_contexts
            .iter()
            .map(|hint| {
                let selected = if hint.regions.is_empty() {
                    (0..lines.len())
                        .filter(|&i| !claimed[i] && hint.pages.contains(&lines[i].page))
                        .collect()
                } else {
                    lines_in_regions(&lines, &hint.regions)
                };
                ContextPlan {
                    id: hint.id.clone(),
                    lines: selected,
                    question_numbers: hint.question_numbers.clone(),
                    text: hint.text.clone(),
                }
            })
            .collect();

        let unclaimed: Vec<&str> = (0..lines.len())
            .filter(|&i| !claimed[i])
            .map(|i| lines[i].text.as_str())
            .collect();
        let document_choice_count = declared_choice_count(&unclaimed.join("\n"));

        self.assemble(pages, &lines, questions, contexts, document_choice_count, Vec::new(), strategy)
    }

    /// Lines of a page-only hint: from the question's own start line (or the
    /// top of its first page) up to the next hinted question's start.
    fn locate_on_pages(&self, lines: &[DocLine], hint: &QuestionHint, hinted: &HashSet<u32>) -> Vec<usize> {
        let on_pages: Vec<usize> = (0..lines.len()).filter(|&i| hint.pages.contains(&lines[i].page)).collect();
        let start_number = |i: usize| self.detector.match_start(&lines[i].text).map(|(n, _)| n);

        let from = on_pages
            .iter()
            .position(|&i| start_number(i) == Some(hint.question_number))
            .unwrap_or(0);
        let to = on_pages
            .iter()
            .enumerate()
            .skip(from + 1)
            .find(|&(_, &i)| start_number(i).is_some_and(|n| n != hint.question_number && hinted.contains(&n)))
            .map_or(on_pages.len(), |(pos, _)| pos);

        on_pages.get(from..to).map(|s| s.to_vec()).unwrap_or_default()
    }

    fn assemble(
        &self,
        pages: &[Page],
        lines: &[DocLine],
        questions: Vec<QuestionPlan>,
        contexts: Vec<ContextPlan>,
        document_choice_count: Option<usize>,
        orphaned: Vec<u32>,
        strategy: SegmentationStrategy,
    ) -> Segmentation {
        let mut line_owner: Vec<Option<Owner>> = vec![None; lines.len()];
        for (q, plan) in questions.iter().enumerate() {
            for &i in &plan.lines {
                line_owner[i].get_or_insert(Owner::Question(q));
            }
        }
        for (c, plan) in contexts.iter().enumerate() {
            for &i in &plan.lines {
                line_owner[i].get_or_insert(Owner::Context(c));
            }
        }
        let images = assign_images(pages, lines, &line_owner);

        let chunks = questions
            .iter()
            .enumerate()
            .map(|(position, plan)| {
                let owner = Owner::Question(position);
                let raw_lines: Vec<String> = plan.lines.iter().map(|&i| lines[i].text.clone()).collect();
                let mut body = raw_lines.clone();
                if let Some(offset) = plan.first_line_offset {
                    if let Some(first) = body.first_mut() {
                        *first = first.get(offset..).unwrap_or("").trim().to_string();
                    }
                    if body.first().is_some_and(|f| f.is_empty()) {
                        body.remove(0);
                    }
                }
                let joined = raw_lines.join("\n");
                let owned_images = images_of(&images, owner);

                QuestionChunk {
                    id: QuestionChunk::id_for(plan.number),
                    question_number: plan.number,
                    position,
                    regions: regions_for(pages, lines, &plan.lines, &owned_images),
                    content: self.parser.parse(&body),
                    images: owned_images,
                    raw_lines,
                    shared_context_id: plan.shared_context_id.clone(),
                    declared_choice_count: declared_choice_count(&joined).or(document_choice_count),
                    declared_part_count: declared_part_count(&joined),
                }
            })
            .collect();

        let shared_contexts = contexts
            .iter()
            .enumerate()
            .map(|(c, plan)| {
                let owned_images = images_of(&images, Owner::Context(c));
                let text = plan.text.clone().unwrap_or_else(|| {
                    plan.lines
                        .iter()
                        .map(|&i| lines[i].text.as_str())
                        .collect::<Vec<_>>()
                        .join("\n")
                });
                SharedContext {
                    id: plan.id.clone(),
                    text,
                    regions: regions_for(pages, lines, &plan.lines, &owned_images),
                    images: owned_images,
                    question_numbers: plan.question_numbers.clone(),
                }
            })
            .collect();

        let mut numbers: Vec<u32> = questions.iter().map(|q| q.number).collect();
        numbers.sort_unstable();
        numbers.dedup();
        let mut missing_questions = orphaned;
        missing_questions.extend(numbers.windows(2).flat_map(|pair| (pair[0] + 1)..pair[1]));
        missing_questions.sort_unstable();
        missing_questions.dedup();
        if !missing_questions.is_empty() {
            log::warn!("⚠️  No start found for questions {:?}", missing_questions);
        }

        Segmentation {
            chunks,
            shared_contexts,
            strategy,
            page_count: pages.len(),
            missing_questions,
        }
    }
}

fn lines_in_regions(lines: &[DocLine], regions: &[PageRegion]) -> Vec<usize> {
    (0..lines.len())
        .filter(|&i| {
            let line = &lines[i];
            let center = BoundingBox::new(line.bbox.center_x(), line.bbox.center_y(), line.bbox.center_x(), line.bbox.center_y());
            regions.iter().any(|r| r.page == line.page && r.bbox.contains(&center))
        })
        .collect()
}

/// Give every embedded image an owner: the band of lines around its center,
/// else the nearest band above it, else the nearest below. Images on pages
/// without owned text go to whoever owns the last line before that page.
fn assign_images(pages: &[Page], lines: &[DocLine], line_owner: &[Option<Owner>]) -> Vec<(Owner, ChunkImage)> {
    let mut assigned = Vec::new();

    for page in pages {
        if page.images.is_empty() {
            continue;
        }
        let mut bands: BTreeMap<(u8, usize), (Owner, f32, f32)> = BTreeMap::new();
        for (i, line) in lines.iter().enumerate().filter(|(_, l)| l.page == page.number) {
            let Some(owner) = line_owner[i] else { continue };
            let key = match owner {
                Owner::Question(q) => (0, q),
                Owner::Context(c) => (1, c),
            };
            let band = bands.entry(key).or_insert((owner, line.bbox.y1, line.bbox.y2));
            band.1 = band.1.min(line.bbox.y1);
            band.2 = band.2.max(line.bbox.y2);
        }
        let text_boxes: Vec<BoundingBox> = lines.iter().filter(|l| l.page == page.number).map(|l| l.bbox).collect();

        for image in &page.images {
            let center = image.bbox.center_y();
            let owner = bands
                .values()
                .filter(|(_, top, bottom)| *top <= center && center <= *bottom)
                .min_by(|a, b| (a.2 - a.1).total_cmp(&(b.2 - b.1)))
                .or_else(|| {
                    bands
                        .values()
                        .filter(|(_, _, bottom)| *bottom <= center)
                        .max_by(|a, b| a.2.total_cmp(&b.2))
                })
                .or_else(|| bands.values().min_by(|a, b| a.1.total_cmp(&b.1)))
                .map(|(owner, _, _)| *owner)
                .or_else(|| {
                    lines
                        .iter()
                        .enumerate()
                        .rev()
                        .filter(|(_, l)| l.page < page.number)
                        .find_map(|(i, _)| line_owner[i])
                });

            match owner {
                Some(owner) => {
                    let bbox = shrink_away_from_text(&image.bbox, &text_boxes, &page.bounds());
                    assigned.push((owner, ChunkImage { page: page.number, bbox }));
                }
                None => log::debug!("🖼️  Image on page {} precedes every question, dropped", page.number),
            }
        }
    }

    assigned
}

fn images_of(images: &[(Owner, ChunkImage)], owner: Owner) -> Vec<ChunkImage> {
    images
        .iter()
        .filter(|(o, _)| *o == owner)
        .map(|(_, image)| image.clone())
        .collect()
}

/// One region per page: the union of the owned lines and images, clamped to the page.
fn regions_for(pages: &[Page], lines: &[DocLine], owned: &[usize], images: &[ChunkImage]) -> Vec<PageRegion> {
    let mut per_page: BTreeMap<u32, Vec<BoundingBox>> = BTreeMap::new();
    for &i in owned {
        per_page.entry(lines[i].page).or_default().push(lines[i].bbox);
    }
    for image in images {
        per_page.entry(image.page).or_default().push(image.bbox);
    }

    per_page
        .into_iter()
        .filter_map(|(number, boxes)| {
            let page = pages.iter().find(|p| p.number == number)?;
            let bbox = union_all(boxes.iter())?.clamp_to(&page.bounds());
            (!bbox.is_empty()).then_some(PageRegion { page: number, bbox })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ModelRequest;
    use crate::error::ModelError;
    use crate::types::{FontInfo, ImageRegion, TextBlock, TextLine, TextSpan};

    fn page(number: u32, texts: &[(&str, f32)], images: Vec<ImageRegion>) -> Page {
        Page {
            number,
            width: 600.0,
            height: 800.0,
            reference_scale: 2.0,
            blocks: texts
                .iter()
                .map(|(t, y)| {
                    let bbox = BoundingBox::new(60.0, *y, 520.0, y + 11.0);
                    TextBlock {
                        bbox,
                        lines: vec![TextLine {
                            bbox,
                            spans: vec![TextSpan {
                                text: t.to_string(),
                                font: FontInfo::fallback("f0"),
                                bbox,
                            }],
                        }],
                    }
                })
                .collect(),
            images,
        }
    }

    fn segmenter() -> Segmenter {
        Segmenter::new(&SegmentationConfig::default()).unwrap()
    }

    #[test]
    fn question_spanning_two_pages_gets_a_region_per_page() {
        let pages = vec![
            page(
                1,
                &[
                    ("Cada pregunta tiene cuatro alternativas.", 80.0),
                    ("1. ¿Cuánto es 2 + 2?", 120.0),
                    ("A) 3", 140.0),
                    ("B) 4", 160.0),
                    ("C) 5", 180.0),
                    ("D) 6", 200.0),
                    ("2. ¿Cuál es la capital de Chile? Considere", 600.0),
                ],
                vec![],
            ),
            page(
                2,
                &[("la región central.", 100.0), ("A) Lima", 120.0), ("B) Santiago", 140.0), ("C) Quito", 160.0), ("D) Bogotá", 180.0)],
                vec![],
            ),
        ];
        let seg = segmenter().segment(&pages, None, None).unwrap();
        assert_eq!(seg.strategy, SegmentationStrategy::Direct);
        assert_eq!(seg.chunks.len(), 2);

        let q2 = &seg.chunks[1];
        assert_eq!(q2.id, "Q2");
        assert_eq!(q2.position, 1);
        assert_eq!(q2.pages(), vec![1, 2]);
        assert_eq!(q2.content.stem, "¿Cuál es la capital de Chile? Considere\nla región central.");
        assert_eq!(q2.content.choice(ChoiceLetter::B).map(|c| c.text.as_str()), Some("Santiago"));
        assert_eq!(q2.declared_choice_count, Some(4));
        for region in &q2.regions {
            assert!(region.bbox.within(&BoundingBox::page(600.0, 800.0), 0.0));
        }
    }

    #[test]
    fn shared_context_is_cut_out_of_the_previous_question() {
        let pages = vec![page(
            1,
            &[
                ("4. Pregunta cuatro", 60.0),
                ("A) uno", 80.0),
                ("B) dos", 100.0),
                ("Lee el texto y responde las preguntas 5 a 6.", 140.0),
                ("El agua hierve a cien grados.", 160.0),
                ("5. ¿A qué temperatura hierve?", 200.0),
                ("A) 50", 220.0),
                ("B) 100", 240.0),
                ("6. ¿Qué sustancia se menciona?", 300.0),
                ("A) agua", 320.0),
                ("B) aceite", 340.0),
            ],
            vec![],
        )];
        let seg = segmenter().segment(&pages, None, None).unwrap();
        assert_eq!(seg.chunks.len(), 3);
        assert_eq!(seg.chunks[0].raw_lines.len(), 3);
        assert_eq!(seg.chunks[0].shared_context_id, None);

        let context = seg.shared_context("C5-6").unwrap();
        assert!(context.text.contains("cien grados"));
        assert_eq!(context.question_numbers, vec![5, 6]);
        assert_eq!(seg.chunks[1].shared_context_id.as_deref(), Some("C5-6"));
        assert_eq!(seg.chunks[2].shared_context_id.as_deref(), Some("C5-6"));
    }

    #[test]
    fn images_go_to_the_question_around_them() {
        let figure = ImageRegion {
            bbox: BoundingBox::new(100.0, 150.0, 400.0, 300.0),
            pixel_width: 600,
            pixel_height: 300,
        };
        let pages = vec![page(
            1,
            &[
                ("1. Observa la figura.", 100.0),
                ("A) uno", 320.0),
                ("B) dos", 340.0),
                ("2. Sin figura", 500.0),
                ("A) tres", 520.0),
                ("B) cuatro", 540.0),
            ],
            vec![figure],
        )];
        let seg = segmenter().segment(&pages, None, None).unwrap();
        assert_eq!(seg.chunks[0].images.len(), 1);
        assert!(seg.chunks[1].images.is_empty());
        assert!(seg.chunks[0].regions[0].bbox.contains(&seg.chunks[0].images[0].bbox));
    }

    #[test]
    fn hints_take_precedence_and_keep_exam_numbers() {
        let pages = vec![
            page(1, &[("7. Primera del bloque", 100.0), ("A) sí", 120.0), ("B) no", 140.0)], vec![]),
            page(2, &[("8. Segunda del bloque", 100.0), ("A) sí", 120.0), ("B) no", 140.0)], vec![]),
        ];
        let hints = SegmentationHints {
            questions: vec![
                QuestionHint { question_number: 7, pages: vec![1], regions: vec![], shared_context_id: None },
                QuestionHint { question_number: 8, pages: vec![2], regions: vec![], shared_context_id: None },
            ],
            shared_contexts: vec![],
        };
        let seg = segmenter().segment(&pages, Some(&hints), None).unwrap();
        assert_eq!(seg.strategy, SegmentationStrategy::Hints);
        assert_eq!(seg.chunks[1].id, "Q8");
        assert_eq!(seg.chunks[1].position, 1);
        assert_eq!(seg.chunks[1].content.stem, "Segunda del bloque");
    }

    fn numbered_exam(count: u32, unreadable: u32) -> Vec<(String, f32)> {
        let mut texts = Vec::new();
        let mut y = 60.0;
        for n in 1..=count {
            let start = if n == unreadable {
                format!("S. Pregunta número {}", n)
            } else {
                format!("{}. Pregunta número {}", n, n)
            };
            for text in [start, format!("A) sí {}", n), format!("B) no {}", n)] {
                texts.push((text, y));
                y += 22.0;
            }
        }
        texts
    }

    fn segment_texts(texts: &[(String, f32)]) -> Segmentation {
        let borrowed: Vec<(&str, f32)> = texts.iter().map(|(t, y)| (t.as_str(), *y)).collect();
        segmenter().segment(&[page(1, &borrowed, vec![])], None, None).unwrap()
    }

    #[test]
    fn unreadable_start_keeps_the_questions_around_it() {
        let seg = segment_texts(&numbered_exam(10, 5));
        let ids: Vec<&str> = seg.chunks.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["Q1", "Q2", "Q3", "Q4", "Q6", "Q7", "Q8", "Q9", "Q10"]);
        assert_eq!(seg.missing_questions, vec![5]);
        // the unreadable question's lines stay with the one before it
        assert!(seg.chunks[3].raw_lines.iter().any(|l| l.starts_with("S. Pregunta")));
    }

    #[test]
    fn choices_before_the_first_start_are_reported() {
        let seg = segment_texts(&numbered_exam(4, 1));
        assert_eq!(seg.chunks.first().map(|c| c.question_number), Some(2));
        assert_eq!(seg.missing_questions, vec![1]);

        let clean = segment_texts(&numbered_exam(4, 0));
        assert_eq!(clean.chunks.len(), 4);
        assert!(clean.missing_questions.is_empty());
    }

    #[test]
    fn long_document_without_model_falls_back_to_direct() {
        let config = SegmentationConfig {
            llm_split_page_threshold: 1,
            ..SegmentationConfig::default()
        };
        let pages = vec![
            page(1, &[("1. Uno", 100.0), ("A) a", 120.0), ("B) b", 140.0)], vec![]),
            page(2, &[("2. Dos", 100.0), ("A) a", 120.0), ("B) b", 140.0)], vec![]),
        ];
        let seg = Segmenter::new(&config).unwrap().segment(&pages, None, None).unwrap();
        assert_eq!(seg.strategy, SegmentationStrategy::Direct);
        assert_eq!(seg.chunks.len(), 2);
    }

    type Reply = fn(&ModelRequest) -> std::result::Result<serde_json::Value, ModelError>;

    struct ScriptedModel {
        reply: Reply,
        requests: std::sync::Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        fn new(reply: Reply) -> Self {
            Self {
                reply,
                requests: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    impl ModelClient for ScriptedModel {
        fn ask_json(&self, request: &ModelRequest) -> std::result::Result<serde_json::Value, ModelError> {
            self.requests.lock().unwrap().push(request.text.clone());
            (self.reply)(request)
        }
    }

    fn two_page_exam() -> Vec<Page> {
        vec![
            page(1, &[("1. Uno", 100.0), ("A) a", 120.0), ("B) b", 140.0)], vec![]),
            page(2, &[("2. Dos", 100.0), ("A) a", 120.0), ("B) b", 140.0)], vec![]),
        ]
    }

    fn model_segmenter() -> Segmenter {
        Segmenter::new(&SegmentationConfig {
            llm_split_page_threshold: 1,
            ..SegmentationConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn long_document_is_split_by_the_model() {
        let model = ScriptedModel::new(|_| {
            Ok(serde_json::json!({"questions": [
                {"question_number": 1, "pages": [1]},
                {"question_number": 2, "pages": [2]}
            ]}))
        });
        let seg = model_segmenter().segment(&two_page_exam(), None, Some(&model)).unwrap();
        assert_eq!(seg.strategy, SegmentationStrategy::LlmAssisted);
        let stems: Vec<&str> = seg.chunks.iter().map(|c| c.content.stem.as_str()).collect();
        assert_eq!(stems, vec!["Uno", "Dos"]);
        assert_eq!(seg.chunks[1].regions[0].page, 2);

        let requests = model.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0], "=== page 1 ===\n1. Uno\nA) a\nB) b\n=== page 2 ===\n2. Dos\nA) a\nB) b\n");
    }

    #[test]
    fn malformed_model_reply_fails_segmentation() {
        let model = ScriptedModel::new(|_| Ok(serde_json::json!({"questions": "1, 2"})));
        let err = model_segmenter().segment(&two_page_exam(), None, Some(&model)).unwrap_err();
        assert!(matches!(err.downcast_ref::<ModelError>(), Some(ModelError::InvalidResponse(_))), "{:#}", err);
        assert!(format!("{:#}", err).contains("pages 1-2"), "{:#}", err);
    }

    #[test]
    fn unreachable_model_fails_instead_of_segmenting_directly() {
        let model = ScriptedModel::new(|_| {
            Err(ModelError::Unreachable {
                attempts: 3,
                last: "connection refused".to_string(),
            })
        });
        let err = model_segmenter().segment(&two_page_exam(), None, Some(&model)).unwrap_err();
        assert!(matches!(err.downcast_ref::<ModelError>(), Some(ModelError::Unreachable { attempts: 3, .. })));
    }
}
