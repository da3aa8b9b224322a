//! Document lines in reading order, with running headers and footers removed.

use crate::config::SegmentationConfig;
use crate::geometry::BoundingBox;
use crate::types::Page;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

static PAGE_NUMBER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*[-–]?\s*(?:página|pagina|pág\.?|page|p\.)?\s*\d{1,3}\s*(?:(?:de|of|/)\s*\d{1,3})?\s*[-–]?\s*$").unwrap()
});

static DIGITS_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

#[derive(Debug, Clone, PartialEq)]
pub struct DocLine {
    pub page: u32,
    pub bbox: BoundingBox,
    pub text: String,
    /// Leftmost text edge on this line's page, for alignment tests
    pub page_left: f32,
}

/// Every body line of the document, page by page, top-to-bottom.
pub fn collect_lines(pages: &[Page], config: &SegmentationConfig) -> Vec<DocLine> {
    let repeated = repeated_band_texts(pages, config);
    let mut lines = Vec::new();

    for page in pages {
        let mut page_lines: Vec<(BoundingBox, String)> = page
            .lines()
            .map(|l| (l.bbox, l.text()))
            .filter(|(_, t)| !t.trim().is_empty())
            .filter(|(bbox, text)| !is_running_furniture(page, bbox, text, config, &repeated))
            .collect();
        page_lines.sort_by(|a, b| a.0.y1.total_cmp(&b.0.y1).then_with(|| a.0.x1.total_cmp(&b.0.x1)));

        let page_left = page_lines
            .iter()
            .map(|(b, _)| b.x1)
            .fold(f32::INFINITY, f32::min);

        lines.extend(page_lines.into_iter().map(|(bbox, text)| DocLine {
            page: page.number,
            bbox,
            text,
            page_left,
        }));
    }

    lines
}

fn in_band(page: &Page, bbox: &BoundingBox, config: &SegmentationConfig) -> bool {
    bbox.y2 <= page.height * config.header_band || bbox.y1 >= page.height * (1.0 - config.footer_band)
}

fn normalize(text: &str) -> String {
    DIGITS_REGEX.replace_all(text.trim(), "#").to_lowercase()
}

/// Band texts (digits normalised) that appear on at least half the pages.
fn repeated_band_texts(pages: &[Page], config: &SegmentationConfig) -> HashSet<String> {
    if pages.len() < 2 {
        return HashSet::new();
    }
    let mut counts: HashMap<String, usize> = HashMap::new();
    for page in pages {
        let per_page: HashSet<String> = page
            .lines()
            .filter(|l| in_band(page, &l.bbox, config))
            .map(|l| normalize(&l.text()))
            .filter(|t| !t.is_empty())
            .collect();
        for text in per_page {
            *counts.entry(text).or_insert(0) += 1;
        }
    }
    let needed = pages.len().div_ceil(2).max(2);
    counts
        .into_iter()
        .filter(|(_, n)| *n >= needed)
        .map(|(t, _)| t)
        .collect()
}

fn is_running_furniture(
    page: &Page,
    bbox: &BoundingBox,
    text: &str,
    config: &SegmentationConfig,
    repeated: &HashSet<String>,
) -> bool {
    if !in_band(page, bbox, config) {
        return false;
    }
    PAGE_NUMBER_REGEX.is_match(text) || repeated.contains(&normalize(text))
}
