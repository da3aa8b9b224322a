//! Splitting a question's lines into stem, lettered choices and parts.

use crate::config::SegmentationConfig;
use crate::types::{ChoiceLetter, ChoiceText, ChunkContent, QuestionPart};
use anyhow::{Context, Result};
use regex::Regex;
use std::sync::LazyLock;

// "A) uno B) dos C) tres" on one physical line
static INLINE_CHOICE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)\(?([A-E])\)\s+").unwrap());

static DECLARED_CHOICES_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d|dos|tres|cuatro|cinco|two|three|four|five)\s+(?:alternativas|opciones|respuestas\s+posibles|alternatives|options|answer\s+choices|choices)\b").unwrap()
});

static DECLARED_PARTS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d|dos|tres|cuatro|two|three|four)\s+(?:partes|parts)\b").unwrap()
});

fn count_word(word: &str) -> Option<usize> {
    match word.to_lowercase().as_str() {
        "dos" | "two" => Some(2),
        "tres" | "three" => Some(3),
        "cuatro" | "four" => Some(4),
        "cinco" | "five" => Some(5),
        other => other.parse().ok(),
    }
}

/// Number of alternatives a text says there are ("cuatro alternativas").
pub fn declared_choice_count(text: &str) -> Option<usize> {
    DECLARED_CHOICES_REGEX
        .captures(text)
        .and_then(|c| count_word(c.get(1)?.as_str()))
        .filter(|n| (2..=5).contains(n))
}

pub fn declared_part_count(text: &str) -> Option<usize> {
    DECLARED_PARTS_REGEX
        .captures(text)
        .and_then(|c| count_word(c.get(1)?.as_str()))
        .filter(|n| *n >= 2)
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineKind {
    Choice(ChoiceLetter, String),
    /// Several choices laid out on one line
    InlineChoices(Vec<(ChoiceLetter, String)>),
    Part(String, String),
    Text(String),
}

pub struct ContentParser {
    choice_marker: Regex,
    bare_choice: Regex,
    part: Regex,
}

impl ContentParser {
    pub fn new(config: &SegmentationConfig) -> Result<Self> {
        Ok(Self {
            choice_marker: Regex::new(&config.choice_marker_pattern)
                .with_context(|| format!("invalid choice pattern: {}", config.choice_marker_pattern))?,
            bare_choice: Regex::new(&config.bare_choice_pattern)
                .with_context(|| format!("invalid bare choice pattern: {}", config.bare_choice_pattern))?,
            part: Regex::new(&config.part_pattern)
                .with_context(|| format!("invalid part pattern: {}", config.part_pattern))?,
        })
    }

    pub fn classify_line(&self, line: &str) -> LineKind {
        if let Some(caps) = self.part.captures(line) {
            let label = caps.get(1).map_or("", |m| m.as_str()).to_string();
            let rest = caps.get(2).map_or("", |m| m.as_str()).trim().to_string();
            return LineKind::Part(label, rest);
        }
        if let Some(caps) = self.choice_marker.captures(line) {
            let letter = caps
                .get(1)
                .and_then(|m| m.as_str().chars().next())
                .and_then(ChoiceLetter::from_char);
            if let Some(letter) = letter {
                let inline = split_inline_choices(line);
                if inline.len() > 1 {
                    return LineKind::InlineChoices(inline);
                }
                let text = caps.get(2).map_or("", |m| m.as_str()).trim().to_string();
                return LineKind::Choice(letter, text);
            }
        }
        if let Some(caps) = self.bare_choice.captures(line) {
            if let Some(letter) = caps
                .get(1)
                .and_then(|m| m.as_str().chars().next())
                .and_then(ChoiceLetter::from_char)
            {
                return LineKind::Choice(letter, String::new());
            }
        }
        LineKind::Text(line.trim().to_string())
    }

    /// Letters of every choice marker in `lines`, in order, repeats included.
    pub fn marker_sequence(&self, lines: &[String]) -> Vec<ChoiceLetter> {
        let mut letters = Vec::new();
        for line in lines {
            match self.classify_line(line) {
                LineKind::Choice(letter, _) => letters.push(letter),
                LineKind::InlineChoices(choices) => letters.extend(choices.into_iter().map(|(l, _)| l)),
                _ => {}
            }
        }
        letters
    }

    /// Parse question lines (first line already stripped of its number).
    pub fn parse(&self, lines: &[String]) -> ChunkContent {
        let mut stem: Vec<String> = Vec::new();
        let mut choices: Vec<ChoiceText> = Vec::new();
        let mut parts: Vec<QuestionPart> = Vec::new();

        enum Target {
            Stem,
            Part,
            Choice,
        }
        let mut target = Target::Stem;

        for line in lines {
            match self.classify_line(line) {
                LineKind::Part(label, rest) if choices.is_empty() => {
                    parts.push(QuestionPart {
                        label: label.to_uppercase(),
                        text: rest,
                    });
                    target = Target::Part;
                }
                LineKind::Choice(letter, text) => {
                    choices.push(ChoiceText { letter, text });
                    target = Target::Choice;
                }
                LineKind::InlineChoices(inline) => {
                    choices.extend(inline.into_iter().map(|(letter, text)| ChoiceText { letter, text }));
                    target = Target::Choice;
                }
                LineKind::Part(label, rest) => append(choices.last_mut().map(|c| &mut c.text), &format!("Parte {} {}", label, rest)),
                LineKind::Text(text) => match target {
                    Target::Stem => stem.push(text),
                    Target::Part => append(parts.last_mut().map(|p| &mut p.text), &text),
                    Target::Choice => append(choices.last_mut().map(|c| &mut c.text), &text),
                },
            }
        }

        ChunkContent {
            stem: stem.join("\n").trim().to_string(),
            choices,
            parts,
        }
    }
}

fn append(target: Option<&mut String>, text: &str) {
    if let Some(existing) = target {
        if !existing.is_empty() {
            existing.push(' ');
        }
        existing.push_str(text.trim());
    }
}

/// Split `A) x B) y C) z` when the letters run consecutively from the first.
fn split_inline_choices(line: &str) -> Vec<(ChoiceLetter, String)> {
    let markers: Vec<(ChoiceLetter, usize, usize)> = INLINE_CHOICE_REGEX
        .captures_iter(line)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let letter = ChoiceLetter::from_char(caps.get(1)?.as_str().chars().next()?)?;
            Some((letter, whole.start(), whole.end()))
        })
        .collect();

    let mut accepted: Vec<(ChoiceLetter, usize, usize)> = Vec::new();
    for marker in markers {
        match accepted.last() {
            None => accepted.push(marker),
            Some(last) if marker.0.index() == last.0.index() + 1 => accepted.push(marker),
            _ => {}
        }
    }
    if accepted.len() < 2 {
        return Vec::new();
    }

    accepted
        .iter()
        .enumerate()
        .map(|(i, (letter, _, text_start))| {
            let end = accepted.get(i + 1).map_or(line.len(), |next| next.1);
            (*letter, line[*text_start..end].trim().to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> ContentParser {
        ContentParser::new(&SegmentationConfig::default()).unwrap()
    }

    fn owned(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn stem_then_choices_with_continuations() {
        let content = parser().parse(&owned(&[
            "¿Cuál es el valor de x en la ecuación",
            "2x + 3 = 7?",
            "A) 1",
            "B) 2",
            "C) 3 y también",
            "un poco más",
            "D) 4",
        ]));
        assert_eq!(content.stem, "¿Cuál es el valor de x en la ecuación\n2x + 3 = 7?");
        assert_eq!(content.choices.len(), 4);
        assert_eq!(content.choices[2].text, "3 y también un poco más");
        assert_eq!(content.choices[3].letter, ChoiceLetter::D);
    }

    #[test]
    fn inline_choices_are_split() {
        let content = parser().parse(&owned(&["Calcula 2 + 2", "A) 3 B) 4 C) 5 D) 6"]));
        let texts: Vec<&str> = content.choices.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["3", "4", "5", "6"]);
    }

    #[test]
    fn bare_letters_are_image_choices() {
        let content = parser().parse(&owned(&["¿Qué figura muestra la simetría?", "A", "B", "C", "D"]));
        assert_eq!(content.choices.len(), 4);
        assert!(content.choices.iter().all(|c| c.text.is_empty()));
    }

    #[test]
    fn parts_are_collected_before_choices() {
        let content = parser().parse(&owned(&[
            "Observa el experimento.",
            "Parte A: describe el resultado",
            "con tus palabras.",
            "Parte B: explica la causa.",
        ]));
        assert_eq!(content.parts.len(), 2);
        assert_eq!(content.parts[0].label, "A");
        assert_eq!(content.parts[0].text, "describe el resultado con tus palabras.");
        assert!(content.choices.is_empty());
    }

    #[test]
    fn declared_counts_in_both_languages() {
        assert_eq!(declared_choice_count("Cada pregunta tiene cuatro alternativas."), Some(4));
        assert_eq!(declared_choice_count("Choose from the five options below"), Some(5));
        assert_eq!(declared_choice_count("Hay 3 opciones"), Some(3));
        assert_eq!(declared_choice_count("Sin alternativas"), None);
        assert_eq!(declared_part_count("This question has two parts."), Some(2));
    }

    #[test]
    fn marker_sequence_reports_restarts() {
        let letters = parser().marker_sequence(&owned(&["A) x", "B) y", "A) z"]));
        assert_eq!(letters, vec![ChoiceLetter::A, ChoiceLetter::B, ChoiceLetter::A]);
    }
}
