//! Visual content classification.
//!
//! Decides whether a question's visuals are its answer choices ("which
//! diagram shows...") or belong to the prompt. The decision is a conjunction
//! of text signals and is deliberately conservative: when in doubt the images
//! stay with the prompt and the choices stay textual.

use crate::config::ClassifierConfig;
use crate::geometry::overlaps;
use crate::types::*;
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

pub struct VisualContentClassifier {
    multi_part: Vec<Regex>,
    prompt_visual: Vec<Regex>,
    choice_question: Vec<Regex>,
    option_structure: Vec<Regex>,
    min_option_matches: usize,
    overrides: BTreeMap<String, bool>,
}

fn compile_all(patterns: &[String], group: &str) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("invalid {} pattern: {}", group, p)))
        .collect()
}

impl VisualContentClassifier {
    pub fn new(config: &ClassifierConfig) -> Result<Self> {
        Ok(Self {
            multi_part: compile_all(&config.multi_part_patterns, "multi-part")?,
            prompt_visual: compile_all(&config.prompt_visual_patterns, "prompt-visual")?,
            choice_question: compile_all(&config.choice_question_patterns, "choice-question")?,
            option_structure: compile_all(&config.option_patterns, "option")?,
            min_option_matches: config.min_option_matches,
            overrides: config.overrides.clone(),
        })
    }

    pub fn classify(&self, chunk: &QuestionChunk, analysis: Option<&VisualAnalysis>) -> VisualClassification {
        let text = if chunk.raw_lines.is_empty() {
            chunk.full_text()
        } else {
            chunk.raw_lines.join("\n")
        };
        let mut trace = DecisionTrace::default();
        let has_images = !chunk.images.is_empty();
        let ai_prompt_visuals = analysis.map_or(0, |a| a.count(BlockCategory::PromptVisual));

        if let Some(&forced) = self.overrides.get(&chunk.id) {
            trace.flag("manual_override", forced);
            let decision = forced && self.regions_complete(chunk, analysis, &mut trace);
            return self.finish(decision, false, has_images || ai_prompt_visuals > 0, chunk, analysis, trace);
        }

        // Stage 1: multi-part questions are never choice-diagram questions
        let multi_part = self.multi_part.iter().any(|r| r.is_match(&text));
        trace.flag("multi_part_veto", multi_part);
        if multi_part {
            return self.finish(false, false, has_images || ai_prompt_visuals > 0, chunk, analysis, trace);
        }

        // Stage 2: text pointing at a figure in the prompt
        let prompt_signal = self.prompt_visual.iter().any(|r| r.is_match(&text));
        trace.flag("prompt_visual_signal", prompt_signal);

        // Stage 3: the question asks which picture is right
        let explicit_choice_language = self.choice_question.iter().any(|r| r.is_match(&text));
        trace.flag("explicit_choice_language", explicit_choice_language);

        // Stage 4: lettered option structure, counted by distinct line
        let option_matches = self.count_option_matches(&text);
        trace.record("option_structure_matches", SignalValue::Count(option_matches));
        let has_option_structure = option_matches >= self.min_option_matches;
        trace.flag("has_option_structure", has_option_structure);

        // Stage 5: AI categories are recorded, never decisive
        if let Some(analysis) = analysis {
            trace.record(
                "ai_choice_visual_blocks",
                SignalValue::Count(analysis.count(BlockCategory::ChoiceVisual)),
            );
            trace.record("ai_prompt_visual_blocks", SignalValue::Count(ai_prompt_visuals));
            trace.record(
                "ai_unknown_blocks",
                SignalValue::Count(analysis.count(BlockCategory::Unknown)),
            );
        }

        // Stage 6: conjunction
        let mut decision = explicit_choice_language && has_option_structure && !prompt_signal;
        trace.flag("conjunction", decision);
        if decision {
            decision = self.regions_complete(chunk, analysis, &mut trace);
        }

        self.finish(
            decision,
            prompt_signal,
            has_images || ai_prompt_visuals > 0,
            chunk,
            analysis,
            trace,
        )
    }

    fn count_option_matches(&self, text: &str) -> usize {
        let mut lines: BTreeSet<usize> = BTreeSet::new();
        for regex in &self.option_structure {
            for m in regex.find_iter(text) {
                let line_start = text[..m.start()].rfind('\n').map_or(0, |i| i + 1);
                lines.insert(line_start);
            }
        }
        lines.len()
    }

    /// Letters this question needs a region for.
    fn expected_letters(chunk: &QuestionChunk) -> Vec<ChoiceLetter> {
        if !chunk.content.choices.is_empty() {
            return chunk.content.choices.iter().map(|c| c.letter).collect();
        }
        ChoiceLetter::first(chunk.declared_choice_count.unwrap_or(4)).to_vec()
    }

    fn regions_complete(
        &self,
        chunk: &QuestionChunk,
        analysis: Option<&VisualAnalysis>,
        trace: &mut DecisionTrace,
    ) -> bool {
        let missing: Vec<String> = Self::expected_letters(chunk)
            .into_iter()
            .filter(|letter| analysis.and_then(|a| a.region_for(*letter)).is_none())
            .map(|letter| letter.to_string())
            .collect();
        let complete = missing.is_empty();
        trace.flag("choice_regions_complete", complete);
        if !complete {
            trace.record("missing_choice_regions", SignalValue::Label(missing.join(",")));
            log::debug!("🔽 {}: choice-diagram downgraded, no region for {}", chunk.id, missing.join(","));
        }
        complete
    }

    fn finish(
        &self,
        is_choice_diagram: bool,
        prompt_signal: bool,
        has_visual_material: bool,
        chunk: &QuestionChunk,
        analysis: Option<&VisualAnalysis>,
        mut trace: DecisionTrace,
    ) -> VisualClassification {
        let choice_regions: Vec<ChoiceRegion> = if is_choice_diagram {
            Self::expected_letters(chunk)
                .into_iter()
                .filter_map(|letter| analysis.and_then(|a| a.region_for(letter)).cloned())
                .collect()
        } else {
            Vec::new()
        };
        // A stem figure can sit above pictured choices.
        let has_prompt_visuals = prompt_signal
            || if is_choice_diagram {
                chunk.images.iter().any(|image| {
                    !choice_regions
                        .iter()
                        .any(|r| r.page == image.page && overlaps(&r.bbox, &image.bbox))
                })
            } else {
                has_visual_material
            };
        trace.flag("is_choice_diagram_question", is_choice_diagram);
        trace.flag("has_prompt_visuals", has_prompt_visuals);
        log::debug!(
            "🧭 {} classified: choice_diagram={} prompt_visuals={}",
            chunk.id,
            is_choice_diagram,
            has_prompt_visuals
        );
        VisualClassification {
            is_choice_diagram_question: is_choice_diagram,
            has_prompt_visuals,
            choice_regions,
            trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BoundingBox;

    fn chunk(lines: &[&str]) -> QuestionChunk {
        QuestionChunk {
            id: "Q7".to_string(),
            question_number: 7,
            position: 0,
            regions: vec![PageRegion {
                page: 1,
                bbox: BoundingBox::new(40.0, 100.0, 560.0, 500.0),
            }],
            content: ChunkContent {
                stem: lines[0].to_string(),
                choices: ChoiceLetter::first(4)
                    .iter()
                    .map(|l| ChoiceText {
                        letter: *l,
                        text: String::new(),
                    })
                    .collect(),
                parts: Vec::new(),
            },
            images: vec![ChunkImage {
                page: 1,
                bbox: BoundingBox::new(60.0, 200.0, 300.0, 400.0),
            }],
            raw_lines: lines.iter().map(|s| s.to_string()).collect(),
            shared_context_id: None,
            declared_choice_count: None,
            declared_part_count: None,
        }
    }

    fn full_analysis() -> VisualAnalysis {
        VisualAnalysis {
            blocks: vec![
                BlockLabel {
                    block: 0,
                    category: BlockCategory::QuestionText,
                },
                BlockLabel {
                    block: 1,
                    category: BlockCategory::ChoiceVisual,
                },
            ],
            choice_regions: ChoiceLetter::first(4)
                .iter()
                .enumerate()
                .map(|(i, l)| ChoiceRegion {
                    letter: *l,
                    page: 1,
                    bbox: BoundingBox::new(60.0 + i as f32 * 120.0, 200.0, 170.0 + i as f32 * 120.0, 320.0),
                })
                .collect(),
        }
    }

    const CHOICE_DIAGRAM: [&str; 5] = [
        "Which diagram best shows the water molecules after heating?",
        "A. Reactants Products",
        "B. Reactants Products",
        "C. Reactants Products",
        "D. Reactants Products",
    ];

    fn classifier() -> VisualContentClassifier {
        VisualContentClassifier::new(&ClassifierConfig::default()).unwrap()
    }

    #[test]
    fn choice_diagram_needs_all_three_signals() {
        let result = classifier().classify(&chunk(&CHOICE_DIAGRAM), Some(&full_analysis()));
        assert!(result.is_choice_diagram_question);
        assert!(!result.has_prompt_visuals);
        assert_eq!(result.choice_regions.len(), 4);
        assert_eq!(result.trace.get("option_structure_matches"), Some(&SignalValue::Count(4)));
    }

    #[test]
    fn stem_figure_above_pictured_choices_is_a_prompt_visual() {
        let mut chunk = chunk(&CHOICE_DIAGRAM);
        chunk.images.push(ChunkImage {
            page: 1,
            bbox: BoundingBox::new(60.0, 110.0, 300.0, 190.0),
        });
        let result = classifier().classify(&chunk, Some(&full_analysis()));
        assert!(result.is_choice_diagram_question);
        assert!(result.has_prompt_visuals);
    }

    #[test]
    fn multi_part_veto_wins_over_every_other_signal() {
        let mut lines = CHOICE_DIAGRAM.to_vec();
        lines.insert(1, "Part A: use the model to answer.");
        let result = classifier().classify(&chunk(&lines), Some(&full_analysis()));
        assert!(!result.is_choice_diagram_question);
        assert_eq!(result.trace.get("multi_part_veto"), Some(&SignalValue::Flag(true)));
        // later stages never ran
        assert!(result.trace.get("explicit_choice_language").is_none());
    }

    #[test]
    fn prompt_visual_signal_biases_against_choice_diagram() {
        let mut lines = CHOICE_DIAGRAM.to_vec();
        lines[0] = "Which diagram best shows the molecules in the beaker shown above?";
        let result = classifier().classify(&chunk(&lines), Some(&full_analysis()));
        assert!(!result.is_choice_diagram_question);
        assert!(result.has_prompt_visuals);
    }

    #[test]
    fn single_option_match_is_not_structure() {
        let lines = [
            "Which model best represents the atom?",
            "A. Bohr Model",
            "B",
            "C",
            "D",
        ];
        let result = classifier().classify(&chunk(&lines), Some(&full_analysis()));
        assert!(!result.is_choice_diagram_question);
        assert_eq!(result.trace.get("has_option_structure"), Some(&SignalValue::Flag(false)));
    }

    #[test]
    fn missing_choice_region_downgrades() {
        let mut analysis = full_analysis();
        analysis.choice_regions.retain(|r| r.letter != ChoiceLetter::C);
        let result = classifier().classify(&chunk(&CHOICE_DIAGRAM), Some(&analysis));
        assert!(!result.is_choice_diagram_question);
        assert!(result.choice_regions.is_empty());
        assert_eq!(
            result.trace.get("missing_choice_regions"),
            Some(&SignalValue::Label("C".to_string()))
        );
    }

    #[test]
    fn ai_labels_alone_never_decide() {
        let lines = ["¿Cuál es la capital de Chile?", "A) Santiago", "B) Lima", "C) Quito", "D) Bogotá"];
        let result = classifier().classify(&chunk(&lines), Some(&full_analysis()));
        assert!(!result.is_choice_diagram_question);
    }

    #[test]
    fn manual_override_decides_first() {
        let config = ClassifierConfig {
            overrides: [("Q7".to_string(), true)].into_iter().collect(),
            ..ClassifierConfig::default()
        };
        let classifier = VisualContentClassifier::new(&config).unwrap();
        let lines = ["Label each part of the cell.", "A", "B", "C", "D"];
        let result = classifier.classify(&chunk(&lines), Some(&full_analysis()));
        assert!(result.is_choice_diagram_question);
        assert_eq!(result.trace.get("manual_override"), Some(&SignalValue::Flag(true)));
    }

    #[test]
    fn classification_is_deterministic() {
        let c = classifier();
        let a = c.classify(&chunk(&CHOICE_DIAGRAM), Some(&full_analysis()));
        let b = c.classify(&chunk(&CHOICE_DIAGRAM), Some(&full_analysis()));
        assert_eq!(a, b);
    }
}
