//! Question start detection.
//!
//! Every left-aligned line matching a start pattern is a candidate. The
//! accepted starts are the longest chain of candidates whose numbers go up,
//! by one or across a short run of unreadable numbers, which discards
//! numbered lists and stray numbers inside stems.

use super::lines::DocLine;
use crate::config::SegmentationConfig;
use anyhow::{Context, Result};
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuestionStart {
    pub line: usize,
    pub number: u32,
    /// Byte offset in the line where the question text begins
    pub text_offset: usize,
}

/// A header announcing a passage shared by a range of questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextHeader {
    pub line: usize,
    pub first: u32,
    pub last: u32,
}

pub struct QuestionDetector {
    start_patterns: Vec<Regex>,
    context_patterns: Vec<Regex>,
    left_margin_tolerance: f32,
    max_missing_starts: u32,
}

impl QuestionDetector {
    pub fn new(config: &SegmentationConfig) -> Result<Self> {
        let compile = |p: &String| Regex::new(p).with_context(|| format!("invalid segmentation pattern: {}", p));
        Ok(Self {
            start_patterns: config.question_start_patterns.iter().map(compile).collect::<Result<_>>()?,
            context_patterns: config.shared_context_patterns.iter().map(compile).collect::<Result<_>>()?,
            left_margin_tolerance: config.left_margin_tolerance,
            max_missing_starts: config.max_missing_starts,
        })
    }

    /// Question number and text offset if `text` opens a question.
    pub fn match_start(&self, text: &str) -> Option<(u32, usize)> {
        self.start_patterns.iter().find_map(|regex| {
            let caps = regex.captures(text)?;
            let number_match = caps.get(1)?;
            let number = number_match.as_str().parse::<u32>().ok()?;
            if number == 0 {
                return None;
            }
            let rest = &text[number_match.end()..];
            let skipped = rest.len()
                - rest
                    .trim_start_matches(|c: char| c.is_whitespace() || ".):-–".contains(c))
                    .len();
            Some((number, number_match.end() + skipped))
        })
    }

    pub fn candidates(&self, lines: &[DocLine]) -> Vec<QuestionStart> {
        lines
            .iter()
            .enumerate()
            .filter(|(_, line)| line.bbox.x1 <= line.page_left + self.left_margin_tolerance)
            .filter_map(|(index, line)| {
                self.match_start(&line.text).map(|(number, text_offset)| QuestionStart {
                    line: index,
                    number,
                    text_offset,
                })
            })
            .collect()
    }

    /// Longest run of candidates numbered n, n+1, n+2, ... in document order,
    /// tolerating a few unreadable numbers in between.
    pub fn detect_starts(&self, lines: &[DocLine]) -> Vec<QuestionStart> {
        let candidates = self.candidates(lines);
        select_chain(&candidates, self.max_missing_starts)
    }

    pub fn context_headers(&self, lines: &[DocLine]) -> Vec<ContextHeader> {
        lines
            .iter()
            .enumerate()
            .filter_map(|(index, line)| {
                self.context_patterns.iter().find_map(|regex| {
                    let caps = regex.captures(&line.text)?;
                    let first = caps.get(1)?.as_str().parse::<u32>().ok()?;
                    let last = caps.get(2)?.as_str().parse::<u32>().ok()?;
                    (first < last).then_some(ContextHeader { line: index, first, last })
                })
            })
            .collect()
    }
}

/// Longest chain of candidates with increasing numbers, in document order.
///
/// Consecutive links may skip up to `max_missing` numbers so one unreadable
/// start does not split the exam in two. Equal lengths prefer fewer skipped
/// numbers.
pub(crate) fn select_chain(candidates: &[QuestionStart], max_missing: u32) -> Vec<QuestionStart> {
    if candidates.is_empty() {
        return Vec::new();
    }

    // best chain ending at each candidate: (length, skipped numbers)
    let mut length: Vec<usize> = vec![1; candidates.len()];
    let mut skipped: Vec<u32> = vec![0; candidates.len()];
    let mut parent: Vec<Option<usize>> = vec![None; candidates.len()];

    for i in 0..candidates.len() {
        let number = candidates[i].number;
        for j in 0..i {
            let previous = candidates[j].number;
            if previous >= number || number - previous - 1 > max_missing {
                continue;
            }
            let len = length[j] + 1;
            let gap = skipped[j] + (number - previous - 1);
            // >= on equal scores: a later candidate is the closer predecessor
            if len > length[i] || (len == length[i] && gap <= skipped[i]) {
                length[i] = len;
                skipped[i] = gap;
                parent[i] = Some(j);
            }
        }
    }

    let mut end = 0;
    for i in 1..candidates.len() {
        if length[i] > length[end] || (length[i] == length[end] && skipped[i] < skipped[end]) {
            end = i;
        }
    }

    let mut chain = vec![candidates[end]];
    let mut cursor = parent[end];
    while let Some(index) = cursor {
        chain.push(candidates[index]);
        cursor = parent[index];
    }
    chain.reverse();
    chain
}
