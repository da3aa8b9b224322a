//! Mojibake repair.
//!
//! The table is fixed per version: UTF-8 text that went through a Latin-1 /
//! Windows-1252 decode on its way out of the PDF. Patterns are applied
//! longest first so `â€œ` is never eaten by a shorter prefix, and passes
//! repeat while a repair uncovers another pattern.

use crate::output;
use anyhow::Result;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

pub const TABLE_VERSION: u32 = 1;

const TABLE: &[(&str, &str)] = &[
    ("Ã¡", "á"),
    ("Ã©", "é"),
    ("Ã\u{AD}", "í"),
    ("Ã³", "ó"),
    ("Ãº", "ú"),
    ("Ã±", "ñ"),
    ("Ã¼", "ü"),
    ("Ã\u{A0}", "à"),
    ("Ã¨", "è"),
    ("Ã§", "ç"),
    ("Ã\u{81}", "Á"),
    ("Ã‰", "É"),
    ("Ã\u{8D}", "Í"),
    ("Ã“", "Ó"),
    ("Ãš", "Ú"),
    ("Ã‘", "Ñ"),
    ("Ãœ", "Ü"),
    ("Ã—", "×"),
    ("Ã·", "÷"),
    ("Â¿", "¿"),
    ("Â¡", "¡"),
    ("Â°", "°"),
    ("Âº", "º"),
    ("Âª", "ª"),
    ("Â²", "²"),
    ("Â³", "³"),
    ("Â½", "½"),
    ("Â±", "±"),
    ("Â·", "·"),
    ("Â\u{A0}", "\u{A0}"),
    ("â€œ", "“"),
    ("â€\u{9D}", "”"),
    ("â€™", "’"),
    ("â€˜", "‘"),
    ("â€“", "–"),
    ("â€”", "—"),
    ("â€¦", "…"),
    ("â€¢", "•"),
    ("âˆš", "√"),
    ("â‰¤", "≤"),
    ("â‰¥", "≥"),
    ("â‰\u{A0}", "≠"),
    ("Ï€", "π"),
    ("Î±", "α"),
    ("Î²", "β"),
    ("Î”", "Δ"),
];

static ORDERED: LazyLock<Vec<(&'static str, &'static str)>> = LazyLock::new(|| {
    let mut ordered = TABLE.to_vec();
    ordered.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()).then_with(|| a.0.cmp(b.0)));
    ordered
});

static SUSPECT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Ã.|Â.|â€.?|\x{FFFD}|[\x{80}-\x{9F}]").unwrap());

#[derive(Debug, Clone, PartialEq)]
pub struct EncodingFix {
    pub text: String,
    pub replacements: usize,
}

/// Apply the table until nothing matches. Repaired text contains no table
/// pattern, so a second call is a no-op.
pub fn fix_encoding(text: &str) -> EncodingFix {
    let mut fixed = text.to_string();
    let mut replacements = 0;
    // Every replacement is shorter than its pattern, so this terminates.
    loop {
        let mut pass = 0;
        for &(pattern, replacement) in ORDERED.iter() {
            let count = fixed.matches(pattern).count();
            if count > 0 {
                fixed = fixed.replace(pattern, replacement);
                pass += count;
            }
        }
        if pass == 0 {
            break;
        }
        replacements += pass;
    }
    EncodingFix { text: fixed, replacements }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuspectSequence {
    pub offset: usize,
    pub sequence: String,
    pub context: String,
}

/// Leftover byte-soup the table does not know, with a little context.
pub fn detect_suspect_sequences(text: &str) -> Vec<SuspectSequence> {
    SUSPECT_REGEX
        .find_iter(text)
        .map(|m| {
            let start = floor_char_boundary(text, m.start().saturating_sub(12));
            let end = ceil_char_boundary(text, (m.end() + 12).min(text.len()));
            SuspectSequence {
                offset: m.start(),
                sequence: m.as_str().to_string(),
                context: text[start..end].to_string(),
            }
        })
        .collect()
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    while !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TreeFixSummary {
    pub files_scanned: usize,
    pub files_changed: usize,
    pub replacements: usize,
}

/// Repair every `question.xml` under `root` in place.
pub fn fix_tree(root: &Path) -> Result<TreeFixSummary> {
    let mut summary = TreeFixSummary::default();
    for path in output::question_files(root)? {
        summary.files_scanned += 1;
        let original = std::fs::read_to_string(&path)?;
        let fix = fix_encoding(&original);
        if fix.replacements > 0 {
            output::write_atomic(&path, fix.text.as_bytes())?;
            summary.files_changed += 1;
            summary.replacements += fix.replacements;
            log::info!("🔤 {}: {} replacements", path.display(), fix.replacements);
        }
    }
    Ok(summary)
}

/// Files under `root` that still contain suspect sequences.
pub fn scan_tree(root: &Path) -> Result<Vec<(PathBuf, Vec<SuspectSequence>)>> {
    let mut findings = Vec::new();
    for path in output::question_files(root)? {
        let content = std::fs::read_to_string(&path)?;
        let suspects = detect_suspect_sequences(&content);
        if !suspects.is_empty() {
            log::warn!("⚠️  {}: {} suspect sequences", path.display(), suspects.len());
            findings.push((path, suspects));
        }
    }
    Ok(findings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repairs_spanish_mojibake() {
        let fix = fix_encoding("Â¿CuÃ¡l es la funciÃ³n del pulmÃ³n? â€œAireâ€\u{9D}");
        assert_eq!(fix.text, "¿Cuál es la función del pulmón? “Aire”");
        assert_eq!(fix.replacements, 6);
    }

    #[test]
    fn second_pass_changes_nothing() {
        let once = fix_encoding("NiÃ±o y Ã‘andÃº");
        let twice = fix_encoding(&once.text);
        assert_eq!(once.text, "Niño y Ñandú");
        assert_eq!(twice.replacements, 0);
        assert_eq!(twice.text, once.text);
    }

    #[test]
    fn repair_that_uncovers_a_pattern_is_finished_in_one_call() {
        for text in ["ÃÂ\u{A0}", "x â‰Â\u{A0} y", "ÃÂ¡rbol"] {
            let once = fix_encoding(text);
            let twice = fix_encoding(&once.text);
            assert_eq!(twice.replacements, 0, "{:?} -> {:?}", text, once.text);
            assert_eq!(twice.text, once.text);
        }
        assert_eq!(fix_encoding("x â‰Â\u{A0} y").text, "x ≠ y");
        assert_eq!(fix_encoding("x â‰Â\u{A0} y").replacements, 2);
    }

    #[test]
    fn repairs_dashes_and_symbols() {
        assert_eq!(fix_encoding("1â€“2 y x â‰¥ 3").text, "1–2 y x ≥ 3");
    }

    #[test]
    fn detects_unknown_residue() {
        let suspects = detect_suspect_sequences("texto con \u{FFFD} raro");
        assert_eq!(suspects.len(), 1);
        assert_eq!(suspects[0].sequence, "\u{FFFD}");
        assert!(detect_suspect_sequences("¿Cuál es la razón?").is_empty());
    }
}
