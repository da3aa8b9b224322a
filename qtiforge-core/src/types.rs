use crate::geometry::BoundingBox;
use serde::{Deserialize, Serialize};
use std::fmt;

// ===== EXTRACTION TYPES =====
// Produced by the preprocessors. A Page is immutable once built.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FontInfo {
    pub class_name: String,
    pub family: String,
    pub size: f32,
    pub bold: bool,
    pub italic: bool,
}

impl FontInfo {
    pub fn fallback(class_name: &str) -> Self {
        Self {
            class_name: class_name.to_string(),
            family: "unknown".to_string(),
            size: 11.0,
            bold: false,
            italic: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSpan {
    pub text: String,
    pub font: FontInfo,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextLine {
    pub bbox: BoundingBox,
    pub spans: Vec<TextSpan>,
}

impl TextLine {
    /// Span text joined left-to-right with single spaces.
    pub fn text(&self) -> String {
        join_words(self.spans.iter().map(|s| s.text.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub bbox: BoundingBox,
    pub lines: Vec<TextLine>,
}

impl TextBlock {
    pub fn text(&self) -> String {
        self.lines
            .iter()
            .map(|l| l.text())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// An embedded raster image placed on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRegion {
    pub bbox: BoundingBox,
    pub pixel_width: u32,
    pub pixel_height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    /// 1-indexed
    pub number: u32,
    pub width: f32,
    pub height: f32,
    pub reference_scale: f32,
    pub blocks: Vec<TextBlock>,
    pub images: Vec<ImageRegion>,
}

impl Page {
    pub fn bounds(&self) -> BoundingBox {
        BoundingBox::page(self.width, self.height)
    }

    /// Raster dimensions at the reference scale.
    pub fn raster_size(&self) -> (u32, u32) {
        crate::geometry::ScaleTransform::new(self.reference_scale).raster_size(self.width, self.height)
    }

    pub fn lines(&self) -> impl Iterator<Item = &TextLine> {
        self.blocks.iter().flat_map(|b| b.lines.iter())
    }
}

/// A span as it comes out of the layout markup, before clustering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSpan {
    pub text: String,
    pub font: FontInfo,
    pub bbox: BoundingBox,
    /// Paragraph index within the page when the producer grouped spans.
    pub block_hint: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPage {
    pub number: u32,
    pub width: f32,
    pub height: f32,
    pub spans: Vec<RawSpan>,
    pub images: Vec<ImageRegion>,
}

pub(crate) fn join_words<'a, I: Iterator<Item = &'a str>>(parts: I) -> String {
    let mut out = String::new();
    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(part);
    }
    out
}

// ===== SEGMENTATION TYPES =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChoiceLetter {
    A,
    B,
    C,
    D,
    E,
}

impl ChoiceLetter {
    pub const ALL: [ChoiceLetter; 5] = [
        ChoiceLetter::A,
        ChoiceLetter::B,
        ChoiceLetter::C,
        ChoiceLetter::D,
        ChoiceLetter::E,
    ];

    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'A' => Some(ChoiceLetter::A),
            'B' => Some(ChoiceLetter::B),
            'C' => Some(ChoiceLetter::C),
            'D' => Some(ChoiceLetter::D),
            'E' => Some(ChoiceLetter::E),
            _ => None,
        }
    }

    /// Parses `"B"`, `"b"` and `"ChoiceB"`.
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        let letter = trimmed.strip_prefix("Choice").unwrap_or(trimmed);
        let mut chars = letter.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Self::from_char(c),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_char(self) -> char {
        (b'A' + self as u8) as char
    }

    /// QTI identifier, e.g. `ChoiceA`.
    pub fn identifier(self) -> String {
        format!("Choice{}", self.as_char())
    }

    /// The first `n` letters, capped at E.
    pub fn first(n: usize) -> &'static [ChoiceLetter] {
        &Self::ALL[..n.min(Self::ALL.len())]
    }
}

impl fmt::Display for ChoiceLetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceText {
    pub letter: ChoiceLetter,
    pub text: String,
}

/// A labelled sub-part of a multi-part question ("Part A", "Parte B").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionPart {
    pub label: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkContent {
    pub stem: String,
    pub choices: Vec<ChoiceText>,
    #[serde(default)]
    pub parts: Vec<QuestionPart>,
}

impl ChunkContent {
    pub fn choice(&self, letter: ChoiceLetter) -> Option<&ChoiceText> {
        self.choices.iter().find(|c| c.letter == letter)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRegion {
    pub page: u32,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkImage {
    pub page: u32,
    pub bbox: BoundingBox,
}

/// One question as cut out of the exam.
///
/// `question_number` is the number printed in the exam; `position` is the
/// 0-based order in which chunks were produced. They differ whenever the exam
/// skips numbers or segmentation starts mid-document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionChunk {
    pub id: String,
    pub question_number: u32,
    pub position: usize,
    pub regions: Vec<PageRegion>,
    pub content: ChunkContent,
    #[serde(default)]
    pub images: Vec<ChunkImage>,
    /// Every text line of the chunk in reading order, used for contamination checks.
    #[serde(default)]
    pub raw_lines: Vec<String>,
    #[serde(default)]
    pub shared_context_id: Option<String>,
    #[serde(default)]
    pub declared_choice_count: Option<usize>,
    #[serde(default)]
    pub declared_part_count: Option<usize>,
}

impl QuestionChunk {
    pub fn id_for(question_number: u32) -> String {
        format!("Q{}", question_number)
    }

    pub fn pages(&self) -> Vec<u32> {
        self.regions.iter().map(|r| r.page).collect()
    }

    pub fn full_text(&self) -> String {
        let mut text = self.content.stem.clone();
        for part in &self.content.parts {
            text.push('\n');
            text.push_str(&part.label);
            text.push(' ');
            text.push_str(&part.text);
        }
        for choice in &self.content.choices {
            text.push('\n');
            text.push_str(&format!("{}) {}", choice.letter, choice.text));
        }
        text
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedContext {
    pub id: String,
    pub text: String,
    pub regions: Vec<PageRegion>,
    #[serde(default)]
    pub images: Vec<ChunkImage>,
    pub question_numbers: Vec<u32>,
}

impl SharedContext {
    pub fn id_for(first: u32, last: u32) -> String {
        format!("C{}-{}", first, last)
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.images.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentationStrategy {
    Direct,
    LlmAssisted,
    Hints,
    Reentry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segmentation {
    pub chunks: Vec<QuestionChunk>,
    pub shared_contexts: Vec<SharedContext>,
    pub strategy: SegmentationStrategy,
    pub page_count: usize,
    /// Question numbers the numbering implies but no chunk carries
    #[serde(default)]
    pub missing_questions: Vec<u32>,
}

impl Segmentation {
    pub fn shared_context(&self, id: &str) -> Option<&SharedContext> {
        self.shared_contexts.iter().find(|c| c.id == id)
    }
}

// ===== VISUAL ANALYSIS / CLASSIFICATION =====

/// Category an AI layout pass assigns to a block of a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockCategory {
    QuestionText,
    PromptVisual,
    ChoiceVisual,
    ChoiceText,
    SharedPassage,
    Decorative,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockLabel {
    pub block: usize,
    pub category: BlockCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceRegion {
    pub letter: ChoiceLetter,
    pub page: u32,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisualAnalysis {
    #[serde(default)]
    pub blocks: Vec<BlockLabel>,
    #[serde(default)]
    pub choice_regions: Vec<ChoiceRegion>,
}

impl VisualAnalysis {
    pub fn count(&self, category: BlockCategory) -> usize {
        self.blocks.iter().filter(|b| b.category == category).count()
    }

    pub fn region_for(&self, letter: ChoiceLetter) -> Option<&ChoiceRegion> {
        self.choice_regions.iter().find(|r| r.letter == letter)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Flag(bool),
    Count(usize),
    Label(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceStep {
    pub signal: String,
    pub value: SignalValue,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionTrace {
    pub steps: Vec<TraceStep>,
}

impl DecisionTrace {
    pub fn record(&mut self, signal: &str, value: SignalValue) {
        self.steps.push(TraceStep {
            signal: signal.to_string(),
            value,
        });
    }

    pub fn flag(&mut self, signal: &str, value: bool) {
        self.record(signal, SignalValue::Flag(value));
    }

    pub fn get(&self, signal: &str) -> Option<&SignalValue> {
        self.steps.iter().find(|s| s.signal == signal).map(|s| &s.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualClassification {
    pub is_choice_diagram_question: bool,
    pub has_prompt_visuals: bool,
    /// One region per letter, only when `is_choice_diagram_question`.
    pub choice_regions: Vec<ChoiceRegion>,
    pub trace: DecisionTrace,
}

// ===== OUTPUT TYPES =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QtiItem {
    pub identifier: String,
    pub title: String,
    pub xml: String,
    pub image_urls: Vec<String>,
    pub correct: Option<ChoiceLetter>,
}

/// Lifecycle of a single question through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionState {
    Extracted,
    Segmented,
    Validated,
    Rejected,
    Classified,
    Assembled,
    Written,
    Failed,
    Skipped,
}

impl QuestionState {
    pub fn can_transition_to(self, next: QuestionState) -> bool {
        use QuestionState::*;
        matches!(
            (self, next),
            (Extracted, Segmented)
                | (Segmented, Validated)
                | (Segmented, Rejected)
                | (Rejected, Segmented)
                | (Validated, Classified)
                | (Validated, Skipped)
                | (Classified, Assembled)
                | (Classified, Failed)
                | (Classified, Skipped)
                | (Assembled, Written)
                | (Assembled, Failed)
                | (Assembled, Skipped)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QuestionState::Written | QuestionState::Rejected | QuestionState::Failed | QuestionState::Skipped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choice_letter_parses_both_formats() {
        assert_eq!(ChoiceLetter::parse("ChoiceB"), Some(ChoiceLetter::B));
        assert_eq!(ChoiceLetter::parse(" c "), Some(ChoiceLetter::C));
        assert_eq!(ChoiceLetter::parse("X"), None);
        assert_eq!(ChoiceLetter::parse("AB"), None);
        assert_eq!(ChoiceLetter::E.identifier(), "ChoiceE");
    }

    #[test]
    fn unknown_block_category_deserializes_to_unknown() {
        let label: BlockLabel =
            serde_json::from_str(r#"{"block": 3, "category": "watermark"}"#).unwrap();
        assert_eq!(label.category, BlockCategory::Unknown);
        let label: BlockLabel =
            serde_json::from_str(r#"{"block": 1, "category": "prompt_visual"}"#).unwrap();
        assert_eq!(label.category, BlockCategory::PromptVisual);
    }

    #[test]
    fn rejected_questions_can_reenter_segmented() {
        assert!(QuestionState::Segmented.can_transition_to(QuestionState::Rejected));
        assert!(QuestionState::Rejected.can_transition_to(QuestionState::Segmented));
        assert!(!QuestionState::Rejected.can_transition_to(QuestionState::Classified));
        assert!(!QuestionState::Written.can_transition_to(QuestionState::Assembled));
        assert!(QuestionState::Written.is_terminal());
    }
}
