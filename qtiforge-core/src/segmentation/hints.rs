//! Segmentation hints: question boundaries supplied from outside, either by
//! the caller (a JSON file) or by the model for long documents.

use crate::collaborators::{ModelClient, ModelRequest};
use crate::config::SegmentationConfig;
use crate::error::ModelError;
use crate::preprocessors::flatten_text;
use crate::types::{Page, PageRegion};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionHint {
    pub question_number: u32,
    #[serde(default)]
    pub pages: Vec<u32>,
    /// Exact regions; when empty the question is located by its start line on `pages`
    #[serde(default)]
    pub regions: Vec<PageRegion>,
    #[serde(default)]
    pub shared_context_id: Option<String>,
}

impl QuestionHint {
    pub fn all_pages(&self) -> Vec<u32> {
        let mut pages: Vec<u32> = self.pages.iter().copied().chain(self.regions.iter().map(|r| r.page)).collect();
        pages.sort_unstable();
        pages.dedup();
        pages
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedContextHint {
    pub id: String,
    pub question_numbers: Vec<u32>,
    #[serde(default)]
    pub pages: Vec<u32>,
    #[serde(default)]
    pub regions: Vec<PageRegion>,
    /// Passage text when the producer already extracted it
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentationHints {
    pub questions: Vec<QuestionHint>,
    #[serde(default)]
    pub shared_contexts: Vec<SharedContextHint>,
}

impl SegmentationHints {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading segmentation hints {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing segmentation hints {}", path.display()))
    }

    /// Merge window results: pages and regions of a repeated question are unioned,
    /// questions come out ordered by first page, then number.
    pub fn merge(parts: Vec<SegmentationHints>) -> SegmentationHints {
        let mut questions: BTreeMap<u32, QuestionHint> = BTreeMap::new();
        let mut contexts: BTreeMap<String, SharedContextHint> = BTreeMap::new();

        for part in parts {
            for hint in part.questions {
                match questions.get_mut(&hint.question_number) {
                    Some(existing) => {
                        existing.pages.extend(hint.pages);
                        existing.pages.sort_unstable();
                        existing.pages.dedup();
                        for region in hint.regions {
                            if !existing.regions.contains(&region) {
                                existing.regions.push(region);
                            }
                        }
                        if existing.shared_context_id.is_none() {
                            existing.shared_context_id = hint.shared_context_id;
                        }
                    }
                    None => {
                        questions.insert(hint.question_number, hint);
                    }
                }
            }
            for context in part.shared_contexts {
                match contexts.get_mut(&context.id) {
                    Some(existing) => {
                        existing.question_numbers.extend(context.question_numbers);
                        existing.question_numbers.sort_unstable();
                        existing.question_numbers.dedup();
                        existing.pages.extend(context.pages);
                        existing.pages.sort_unstable();
                        existing.pages.dedup();
                        existing.regions.extend(context.regions);
                        if existing.text.is_none() {
                            existing.text = context.text;
                        }
                    }
                    None => {
                        contexts.insert(context.id.clone(), context);
                    }
                }
            }
        }

        let mut questions: Vec<QuestionHint> = questions.into_values().collect();
        questions.sort_by_key(|q| (q.all_pages().first().copied().unwrap_or(u32::MAX), q.question_number));

        SegmentationHints {
            questions,
            shared_contexts: contexts.into_values().collect(),
        }
    }

    /// Drop references to pages the document does not have.
    pub fn restrict_to(&mut self, page_count: usize) {
        let valid = |p: &u32| *p >= 1 && (*p as usize) <= page_count;
        for q in &mut self.questions {
            let before = q.pages.len() + q.regions.len();
            q.pages.retain(valid);
            q.regions.retain(|r| valid(&r.page));
            if q.pages.len() + q.regions.len() != before {
                log::warn!("⚠️  Hint for question {} referenced pages outside the document", q.question_number);
            }
        }
        self.questions.retain(|q| !q.pages.is_empty() || !q.regions.is_empty());
        for c in &mut self.shared_contexts {
            c.pages.retain(valid);
            c.regions.retain(|r| valid(&r.page));
        }
    }
}

const SEGMENTATION_INSTRUCTION: &str = "You are given the text of consecutive pages of an exam, each page introduced by a line '=== page N ==='. \
Identify every question that starts or continues on these pages. Reply with JSON only: \
{\"questions\": [{\"question_number\": <int>, \"pages\": [<int>...], \"shared_context_id\": <string or null>}], \
\"shared_contexts\": [{\"id\": \"C<first>-<last>\", \"question_numbers\": [<int>...], \"pages\": [<int>...]}]}. \
Use the question numbers printed in the exam. A shared context is a passage, table or figure used by several questions.";

/// Page windows `[start, end)` of `window` pages, consecutive windows sharing `overlap` pages.
pub fn page_windows(page_count: usize, window: usize, overlap: usize) -> Vec<(usize, usize)> {
    let window = window.max(1);
    let overlap = overlap.min(window - 1);
    let mut windows = Vec::new();
    let mut start = 0;
    while start < page_count {
        let end = (start + window).min(page_count);
        windows.push((start, end));
        if end == page_count {
            break;
        }
        start = end - overlap;
    }
    windows
}

/// Ask the model for question boundaries window by window and merge the answers.
///
/// A failed or malformed window fails the whole request; half-segmented
/// output would silently drop questions.
pub fn request_hints(pages: &[Page], config: &SegmentationConfig, model: &dyn ModelClient) -> Result<SegmentationHints> {
    let windows = page_windows(pages.len(), config.llm_window_pages, config.llm_window_overlap);
    log::info!("🤖 Model-assisted segmentation over {} windows", windows.len());

    let mut parts = Vec::with_capacity(windows.len());
    for (start, end) in windows {
        let window = &pages[start..end];
        let mut text = String::new();
        for page in window {
            text.push_str(&format!("=== page {} ===\n", page.number));
            text.push_str(&flatten_text(&page.blocks));
            text.push('\n');
        }
        let (first, last) = (window[0].number, window[window.len() - 1].number);

        let request = ModelRequest {
            instruction: SEGMENTATION_INSTRUCTION.to_string(),
            text,
            images: Vec::new(),
        };
        let value = model
            .ask_json(&request)
            .with_context(|| format!("segmenting pages {}-{}", first, last))?;
        let hints: SegmentationHints = serde_json::from_value(value)
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))
            .with_context(|| format!("reading segmentation of pages {}-{}", first, last))?;
        parts.push(hints);
    }

    let mut merged = SegmentationHints::merge(parts);
    merged.restrict_to(pages.len());
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_overlap_and_cover_everything() {
        assert_eq!(page_windows(20, 8, 1), vec![(0, 8), (7, 15), (14, 20)]);
        assert_eq!(page_windows(5, 8, 1), vec![(0, 5)]);
        assert_eq!(page_windows(4, 2, 5), vec![(0, 2), (1, 3), (2, 4)]);
    }

    #[test]
    fn merge_unions_questions_seen_twice() {
        let a = SegmentationHints {
            questions: vec![
                QuestionHint { question_number: 3, pages: vec![7], regions: vec![], shared_context_id: None },
                QuestionHint { question_number: 4, pages: vec![8], regions: vec![], shared_context_id: None },
            ],
            shared_contexts: vec![],
        };
        let b = SegmentationHints {
            questions: vec![
                QuestionHint { question_number: 4, pages: vec![8, 9], regions: vec![], shared_context_id: Some("C4-5".into()) },
                QuestionHint { question_number: 5, pages: vec![9], regions: vec![], shared_context_id: None },
            ],
            shared_contexts: vec![],
        };
        let merged = SegmentationHints::merge(vec![a, b]);
        let numbers: Vec<u32> = merged.questions.iter().map(|q| q.question_number).collect();
        assert_eq!(numbers, vec![3, 4, 5]);
        assert_eq!(merged.questions[1].pages, vec![8, 9]);
        assert_eq!(merged.questions[1].shared_context_id.as_deref(), Some("C4-5"));
    }

    #[test]
    fn hints_parse_with_optional_fields() {
        let json = r#"{"questions": [{"question_number": 1, "pages": [1, 2]}]}"#;
        let hints: SegmentationHints = serde_json::from_str(json).unwrap();
        assert_eq!(hints.questions[0].all_pages(), vec![1, 2]);
        assert!(hints.shared_contexts.is_empty());
    }
}
