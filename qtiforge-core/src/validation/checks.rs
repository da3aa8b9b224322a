use super::{CheckContext, ChunkCheck, ChunkReport};
use crate::qti::encoding::detect_suspect_sequences;
use crate::types::{ChoiceLetter, QuestionChunk};
use std::collections::BTreeSet;

fn normalized(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

pub struct BoundingBoxesCheck;

impl ChunkCheck for BoundingBoxesCheck {
    fn check(&self, chunk: &QuestionChunk, context: &CheckContext, report: &mut ChunkReport) {
        if chunk.regions.is_empty() {
            report.error("no page regions");
            return;
        }
        let mut seen_pages = BTreeSet::new();
        for region in &chunk.regions {
            if !seen_pages.insert(region.page) {
                report.error(format!("more than one region on page {}", region.page));
            }
            let Some(bounds) = context.page_bounds.get(&region.page) else {
                report.error(format!("region on page {} which the document does not have", region.page));
                continue;
            };
            if region.bbox.is_empty() {
                report.error(format!("empty region on page {}", region.page));
            } else if !region.bbox.within(bounds, 0.5) {
                report.error(format!("region on page {} extends outside the page", region.page));
            }
        }
    }

    fn name(&self) -> &str {
        "BoundingBoxes"
    }
}

pub struct StemPresentCheck;

impl ChunkCheck for StemPresentCheck {
    fn check(&self, chunk: &QuestionChunk, context: &CheckContext, report: &mut ChunkReport) {
        let stem = chunk.content.stem.trim();
        let has_part_text = chunk.content.parts.iter().any(|p| !p.text.trim().is_empty());
        if stem.chars().count() < context.config.min_stem_chars && !has_part_text {
            report.error("missing stem");
            return;
        }
        let stem_key = normalized(stem);
        if let Some(choice) = chunk
            .content
            .choices
            .iter()
            .find(|c| !c.text.trim().is_empty() && normalized(&c.text) == stem_key)
        {
            report.error(format!("stem is identical to choice {}", choice.letter));
        }
        if !detect_suspect_sequences(stem).is_empty() {
            report.warn("stem contains possible encoding noise");
        }
    }

    fn name(&self) -> &str {
        "StemPresent"
    }
}

pub struct ChoicesCompleteCheck;

impl ChoicesCompleteCheck {
    fn declared_suffix(declared: Option<usize>) -> String {
        declared.map_or(String::new(), |n| format!(" (text declares {} alternatives)", n))
    }
}

impl ChunkCheck for ChoicesCompleteCheck {
    fn check(&self, chunk: &QuestionChunk, context: &CheckContext, report: &mut ChunkReport) {
        let choices = &chunk.content.choices;
        let declared = chunk.declared_choice_count;

        if choices.is_empty() {
            if !chunk.content.parts.is_empty() {
                return;
            }
            report.error(format!("no labelled answer choices{}", Self::declared_suffix(declared)));
            return;
        }

        let mut present: BTreeSet<ChoiceLetter> = BTreeSet::new();
        for choice in choices {
            if !present.insert(choice.letter) {
                report.error(format!("choice {} appears more than once", choice.letter));
            }
        }

        let highest = present.iter().next_back().map_or(0, |l| l.index() + 1);
        let expected = declared.map_or(highest, |n| n.max(highest));
        for letter in ChoiceLetter::first(expected) {
            if !present.contains(letter) {
                report.error(format!("missing choice {}{}", letter, Self::declared_suffix(declared)));
            }
        }
        if let Some(n) = declared {
            if highest > n {
                report.error(format!("found choice {} but text declares {} alternatives", ChoiceLetter::ALL[highest - 1], n));
            }
        }
        if present.len() < context.config.min_choices {
            report.error(format!(
                "only {} choice(s), at least {} required",
                present.len(),
                context.config.min_choices
            ));
        }

        let has_images = !chunk.images.is_empty();
        let mut texts: Vec<(ChoiceLetter, String)> = Vec::new();
        for choice in choices {
            let text = choice.text.trim();
            if text.is_empty() {
                if !has_images {
                    report.error(format!("choice {} is empty", choice.letter));
                }
                continue;
            }
            let key = normalized(text);
            if let Some((other, _)) = texts.iter().find(|(_, t)| *t == key) {
                report.error(format!("choices {} and {} have the same text", other, choice.letter));
            }
            texts.push((choice.letter, key));
            if !detect_suspect_sequences(text).is_empty() {
                report.warn(format!("choice {} contains possible encoding noise", choice.letter));
            }
        }
    }

    fn name(&self) -> &str {
        "ChoicesComplete"
    }
}

pub struct NoContaminationCheck;

impl ChunkCheck for NoContaminationCheck {
    fn check(&self, chunk: &QuestionChunk, context: &CheckContext, report: &mut ChunkReport) {
        let neighbours = [chunk.question_number.checked_sub(1), chunk.question_number.checked_add(1)];
        for line in chunk.raw_lines.iter().skip(1) {
            if let Some((number, _)) = context.detector.match_start(line) {
                if neighbours.contains(&Some(number)) {
                    report.error(format!("contains the start of question {}", number));
                }
            }
        }

        let letters = context.parser.marker_sequence(&chunk.raw_lines);
        let restarts = letters.iter().filter(|l| **l == ChoiceLetter::A).count();
        if restarts > 1 {
            report.error(format!("{} choice sequences starting at A", restarts));
        }

        for offset in [-1isize, 1] {
            let Some(other) = context.neighbour(offset) else { continue };
            for region in &chunk.regions {
                for theirs in other.regions.iter().filter(|r| r.page == region.page) {
                    let Some(shared) = region.bbox.intersection(&theirs.bbox) else { continue };
                    let smaller = region.bbox.area().min(theirs.bbox.area());
                    if smaller > 0.0 && shared.area() / smaller > 0.05 {
                        report.error(format!("region on page {} overlaps {}", region.page, other.id));
                    }
                }
            }
        }
    }

    fn name(&self) -> &str {
        "NoContamination"
    }
}

pub struct NoInternalSplitCheck;

impl ChunkCheck for NoInternalSplitCheck {
    fn check(&self, chunk: &QuestionChunk, context: &CheckContext, report: &mut ChunkReport) {
        let duplicates = context
            .segmentation
            .chunks
            .iter()
            .filter(|c| c.question_number == chunk.question_number)
            .count();
        if duplicates > 1 {
            report.error(format!("question number {} appears in {} chunks", chunk.question_number, duplicates));
        }

        let stemless = chunk.content.stem.trim().is_empty() && chunk.content.parts.is_empty();
        let choiceless = chunk.content.choices.is_empty() && chunk.content.parts.is_empty();
        if stemless && !chunk.content.choices.is_empty() {
            if let Some(previous) = context.neighbour(-1).filter(|p| p.content.choices.is_empty()) {
                report.error(format!("choices without a stem, likely split from {}", previous.id));
            }
        }
        if choiceless && !chunk.content.stem.trim().is_empty() {
            if let Some(next) = context
                .neighbour(1)
                .filter(|n| n.content.stem.trim().is_empty() && !n.content.choices.is_empty())
            {
                report.error(format!("stem without choices, likely split into {}", next.id));
            }
        }
    }

    fn name(&self) -> &str {
        "NoInternalSplit"
    }
}

/// A numbering gap after a question means the next start line was unreadable
/// and its text most likely ended up in this chunk.
pub struct NumberingContinuousCheck;

impl ChunkCheck for NumberingContinuousCheck {
    fn check(&self, chunk: &QuestionChunk, context: &CheckContext, report: &mut ChunkReport) {
        let Some(next) = context.neighbour(1) else { return };
        let number = chunk.question_number;
        if next.question_number <= number + 1 {
            return;
        }
        let missing: Vec<String> = ((number + 1)..next.question_number).map(|n| n.to_string()).collect();
        report.error(format!(
            "no start found for question {} between {} and {}; its text may be inside this chunk",
            missing.join(", "),
            chunk.id,
            next.id
        ));
    }

    fn name(&self) -> &str {
        "NumberingContinuous"
    }
}

pub struct SharedContextResolvedCheck;

impl ChunkCheck for SharedContextResolvedCheck {
    fn check(&self, chunk: &QuestionChunk, context: &CheckContext, report: &mut ChunkReport) {
        let Some(id) = &chunk.shared_context_id else { return };
        match context.segmentation.shared_context(id) {
            None => report.error(format!("shared context {} does not exist", id)),
            Some(shared) if shared.is_empty() => report.error(format!("shared context {} is empty", id)),
            Some(shared) if !shared.question_numbers.contains(&chunk.question_number) => {
                report.warn(format!("shared context {} does not list question {}", id, chunk.question_number))
            }
            Some(_) => {}
        }
    }

    fn name(&self) -> &str {
        "SharedContextResolved"
    }
}

pub struct MultiPartCompleteCheck;

impl ChunkCheck for MultiPartCompleteCheck {
    fn check(&self, chunk: &QuestionChunk, _context: &CheckContext, report: &mut ChunkReport) {
        let parts = &chunk.content.parts;
        if let Some(declared) = chunk.declared_part_count {
            if parts.len() != declared {
                report.error(format!("text declares {} parts but {} found", declared, parts.len()));
            }
        }
        if parts.is_empty() {
            return;
        }

        let numeric = parts[0].label.chars().all(|c| c.is_ascii_digit());
        let expected: Vec<String> = (0..parts.len())
            .map(|i| {
                if numeric {
                    (i + 1).to_string()
                } else {
                    ((b'A' + i as u8) as char).to_string()
                }
            })
            .collect();
        let labels: Vec<&str> = parts.iter().map(|p| p.label.as_str()).collect();
        if labels != expected.iter().map(String::as_str).collect::<Vec<_>>() {
            report.error(format!("part labels are not contiguous: {}", labels.join(", ")));
        }
        for part in parts.iter().filter(|p| p.text.trim().is_empty()) {
            report.warn(format!("part {} has no text of its own", part.label));
        }
    }

    fn name(&self) -> &str {
        "MultiPartComplete"
    }
}

#[cfg(test)]
mod tests {
    use super::super::SegmentationValidator;
    use crate::config::{SegmentationConfig, ValidationConfig};
    use crate::geometry::BoundingBox;
    use crate::types::*;

    fn page(number: u32) -> Page {
        Page {
            number,
            width: 600.0,
            height: 800.0,
            reference_scale: 2.0,
            blocks: vec![],
            images: vec![],
        }
    }

    fn chunk(number: u32, position: usize, y: f32, stem: &str, choices: &[(&str, &str)]) -> QuestionChunk {
        let content = ChunkContent {
            stem: stem.to_string(),
            choices: choices
                .iter()
                .map(|(l, t)| ChoiceText {
                    letter: ChoiceLetter::parse(l).unwrap(),
                    text: t.to_string(),
                })
                .collect(),
            parts: vec![],
        };
        let mut raw_lines = vec![format!("{}. {}", number, stem)];
        raw_lines.extend(choices.iter().map(|(l, t)| format!("{}) {}", l, t)));
        QuestionChunk {
            id: QuestionChunk::id_for(number),
            question_number: number,
            position,
            regions: vec![PageRegion {
                page: 1,
                bbox: BoundingBox::new(50.0, y, 550.0, y + 100.0),
            }],
            content,
            images: vec![],
            raw_lines,
            shared_context_id: None,
            declared_choice_count: None,
            declared_part_count: None,
        }
    }

    fn validate(chunks: Vec<QuestionChunk>, contexts: Vec<SharedContext>) -> Vec<super::ChunkReport> {
        let segmentation = Segmentation {
            chunks,
            shared_contexts: contexts,
            strategy: SegmentationStrategy::Direct,
            page_count: 1,
            missing_questions: vec![],
        };
        SegmentationValidator::new(&ValidationConfig::default(), &SegmentationConfig::default())
            .unwrap()
            .validate(&segmentation, &[page(1)])
    }

    const FOUR: [(&str, &str); 4] = [("A", "uno"), ("B", "dos"), ("C", "tres"), ("D", "cuatro")];

    #[test]
    fn complete_question_is_self_contained() {
        let reports = validate(vec![chunk(1, 0, 100.0, "¿Cuántos lados tiene un cuadrado?", &FOUR)], vec![]);
        assert!(reports[0].is_self_contained, "{:?}", reports[0].errors);
        assert!(reports[0].warnings.is_empty());
    }

    #[test]
    fn missing_declared_choice_is_cited() {
        let mut q = chunk(1, 0, 100.0, "¿Cuál es el resultado?", &FOUR[..3]);
        q.declared_choice_count = Some(4);
        let reports = validate(vec![q], vec![]);
        assert!(!reports[0].is_self_contained);
        assert!(reports[0]
            .errors
            .iter()
            .any(|e| e.contains("missing choice D") && e.contains("4 alternatives")));
    }

    #[test]
    fn gap_in_letters_is_an_error() {
        let q = chunk(2, 0, 100.0, "Elige una opción", &[("A", "x"), ("B", "y"), ("D", "z")]);
        let reports = validate(vec![q], vec![]);
        assert!(reports[0].errors.iter().any(|e| e.contains("missing choice C")));
    }

    #[test]
    fn empty_choices_are_fine_when_images_carry_them() {
        let mut q = chunk(3, 0, 100.0, "¿Qué figura es simétrica?", &[("A", ""), ("B", ""), ("C", ""), ("D", "")]);
        assert!(!validate(vec![q.clone()], vec![])[0].is_self_contained);
        q.images.push(ChunkImage {
            page: 1,
            bbox: BoundingBox::new(60.0, 120.0, 500.0, 180.0),
        });
        assert!(validate(vec![q], vec![])[0].is_self_contained);
    }

    #[test]
    fn neighbour_start_line_is_contamination() {
        let mut q = chunk(4, 0, 100.0, "Primera pregunta", &FOUR);
        q.raw_lines.push("5. La siguiente pregunta".to_string());
        let reports = validate(vec![q], vec![]);
        assert!(reports[0].errors.iter().any(|e| e.contains("start of question 5")));
    }

    #[test]
    fn overlapping_neighbours_are_contaminated() {
        let a = chunk(1, 0, 100.0, "Pregunta uno", &FOUR);
        let b = chunk(2, 1, 150.0, "Pregunta dos", &FOUR);
        let reports = validate(vec![a, b], vec![]);
        assert!(reports[0].errors.iter().any(|e| e.contains("overlaps Q2")));
        assert!(reports[1].errors.iter().any(|e| e.contains("overlaps Q1")));
    }

    #[test]
    fn split_question_is_detected() {
        let a = chunk(6, 0, 100.0, "Un enunciado sin alternativas", &[]);
        let b = chunk(7, 1, 300.0, "", &FOUR);
        let reports = validate(vec![a, b], vec![]);
        assert!(reports[0].errors.iter().any(|e| e.contains("split into Q7")));
        assert!(reports[1].errors.iter().any(|e| e.contains("split from Q6")));
    }

    #[test]
    fn shared_context_must_exist_and_have_content() {
        let mut q = chunk(5, 0, 100.0, "¿Qué dice el texto?", &FOUR);
        q.shared_context_id = Some("C5-6".to_string());
        let missing = validate(vec![q.clone()], vec![]);
        assert!(missing[0].errors.iter().any(|e| e.contains("does not exist")));

        let empty = SharedContext {
            id: "C5-6".to_string(),
            text: "  ".to_string(),
            regions: vec![],
            images: vec![],
            question_numbers: vec![5, 6],
        };
        let reports = validate(vec![q.clone()], vec![empty.clone()]);
        assert!(reports[0].errors.iter().any(|e| e.contains("is empty")));

        let filled = SharedContext {
            text: "El texto trata sobre el agua.".to_string(),
            ..empty
        };
        assert!(validate(vec![q], vec![filled])[0].is_self_contained);
    }

    #[test]
    fn declared_parts_must_all_be_present() {
        let mut q = chunk(8, 0, 100.0, "Observa el experimento.", &[]);
        q.content.parts = vec![QuestionPart {
            label: "A".to_string(),
            text: "Describe el resultado.".to_string(),
        }];
        q.declared_part_count = Some(2);
        let reports = validate(vec![q.clone()], vec![]);
        assert!(reports[0].errors.iter().any(|e| e.contains("declares 2 parts but 1 found")));

        q.content.parts.push(QuestionPart {
            label: "B".to_string(),
            text: "Explica la causa.".to_string(),
        });
        assert!(validate(vec![q], vec![])[0].is_self_contained);
    }

    #[test]
    fn numbering_gap_quarantines_the_question_before_it() {
        let q4 = chunk(4, 0, 100.0, "Cuarta pregunta", &FOUR);
        let q6 = chunk(6, 1, 300.0, "Sexta pregunta", &FOUR);
        let reports = validate(vec![q4, q6], vec![]);
        assert!(reports[0]
            .errors
            .iter()
            .any(|e| e.contains("no start found for question 5 between Q4 and Q6")));
        assert!(reports[1].is_self_contained, "{:?}", reports[1].errors);
    }

    #[test]
    fn encoding_noise_is_only_a_warning() {
        let q = chunk(9, 0, 100.0, "¿Cuál es la razón\u{FFFD}?", &FOUR);
        let reports = validate(vec![q], vec![]);
        assert!(reports[0].is_self_contained);
        assert_eq!(reports[0].warnings.len(), 1);
    }
}
