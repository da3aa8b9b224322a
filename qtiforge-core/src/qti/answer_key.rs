//! Answer keys and in-place correct-response updates.
//!
//! Updates splice the new value into the original text at the byte offsets
//! the reader reports, so everything outside the `qti-value` stays as written.

use crate::output;
use crate::types::ChoiceLetter;
use anyhow::{anyhow, bail, Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Question number to correct letter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnswerKey {
    answers: BTreeMap<u32, ChoiceLetter>,
}

impl AnswerKey {
    /// `{"1": "B", "2": "ChoiceD"}`. Entries that are not a letter A-E
    /// (annulled questions are often keyed `"*"`) are skipped with a warning.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading answer key {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("parsing answer key {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let raw: BTreeMap<String, String> = serde_json::from_str(json)?;
        let mut answers = BTreeMap::new();
        for (question, letter) in raw {
            let number: u32 = question
                .trim()
                .trim_start_matches(['Q', 'q'])
                .parse()
                .map_err(|_| anyhow!("'{}' is not a question number", question))?;
            match ChoiceLetter::parse(&letter) {
                Some(letter) => {
                    answers.insert(number, letter);
                }
                None => log::warn!("⚠️  Answer key entry {} has unusable value '{}', skipping", number, letter),
            }
        }
        Ok(Self { answers })
    }

    pub fn from_answers(answers: impl IntoIterator<Item = (u32, ChoiceLetter)>) -> Self {
        Self {
            answers: answers.into_iter().collect(),
        }
    }

    pub fn get(&self, question_number: u32) -> Option<ChoiceLetter> {
        self.answers.get(&question_number).copied()
    }

    pub fn len(&self) -> usize {
        self.answers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }
}

/// Where the RESPONSE correct value sits in the document.
enum ValueSite {
    /// Byte range of the text inside `<qti-value>..</qti-value>`
    Text { start: usize, end: usize },
    /// An empty `<qti-value/>` or `<qti-value></qti-value>`
    Empty { start: usize, end: usize },
    /// No `qti-correct-response`: insert right after the declaration's start tag
    Missing { insert_at: usize },
}

struct Survey {
    site: Option<ValueSite>,
    choices: Vec<String>,
}

fn attribute(e: &quick_xml::events::BytesStart, name: &str) -> Result<Option<String>> {
    match e.try_get_attribute(name)? {
        Some(attr) => Ok(Some(attr.unescape_value()?.into_owned())),
        None => Ok(None),
    }
}

fn survey(xml: &str) -> Result<Survey> {
    let mut reader = Reader::from_str(xml);
    let mut in_response = false;
    let mut in_correct = false;
    // offset just past the `>` of an open `<qti-value>`
    let mut value_open: Option<usize> = None;
    let mut site = None;
    let mut choices = Vec::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| anyhow!("XML error at byte {}: {}", reader.buffer_position(), e))?;
        // Tag events end on `>`, so this is exact for them.
        let after = reader.buffer_position();
        let unset = matches!(site, Some(ValueSite::Missing { .. }));
        match event {
            Event::Start(e) => match e.name().as_ref() {
                b"qti-response-declaration" => {
                    in_response = attribute(&e, "identifier")?.as_deref() == Some("RESPONSE");
                    if in_response && site.is_none() {
                        site = Some(ValueSite::Missing { insert_at: after });
                    }
                }
                b"qti-correct-response" if in_response => in_correct = true,
                b"qti-value" if in_correct && value_open.is_none() => value_open = Some(after),
                b"qti-simple-choice" => choices.extend(attribute(&e, "identifier")?),
                _ => {}
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"qti-value" if in_correct && unset => {
                    site = Some(ValueSite::Empty {
                        start: tag_start(xml, after),
                        end: after,
                    });
                }
                b"qti-simple-choice" => choices.extend(attribute(&e, "identifier")?),
                _ => {}
            },
            Event::End(e) => match e.name().as_ref() {
                b"qti-value" => {
                    if let Some(open) = value_open.take() {
                        if unset {
                            let text_end = xml[open..].find('<').map_or(open, |i| open + i);
                            site = Some(if xml[open..text_end].trim().is_empty() {
                                ValueSite::Empty {
                                    start: tag_start(xml, open),
                                    end: after,
                                }
                            } else {
                                ValueSite::Text { start: open, end: text_end }
                            });
                        }
                    }
                }
                b"qti-correct-response" => in_correct = false,
                b"qti-response-declaration" => in_response = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(Survey { site, choices })
}

/// Offset of the `<` opening the tag that ends at `tag_end`.
fn tag_start(xml: &str, tag_end: usize) -> usize {
    xml[..tag_end].rfind('<').unwrap_or(0)
}

/// Set the RESPONSE correct value to `letter`.
///
/// Returns `None` when the item already carries that answer. A `ChoiceX`
/// value keeps the prefix; any other value becomes the bare letter. Empty or
/// missing values are written as identifiers.
pub fn update_correct_response(xml: &str, letter: ChoiceLetter) -> Result<Option<String>> {
    let survey = survey(xml)?;
    if !survey.choices.is_empty() && !survey.choices.iter().any(|c| ChoiceLetter::parse(c) == Some(letter)) {
        bail!("item has no choice {} (choices: {})", letter, survey.choices.join(", "));
    }
    let Some(site) = survey.site else {
        bail!("item has no RESPONSE declaration");
    };

    let (start, end, replacement) = match site {
        ValueSite::Text { start, end } => {
            let current = &xml[start..end];
            let value = current.trim();
            if ChoiceLetter::parse(value) == Some(letter) {
                return Ok(None);
            }
            let new_value = if value.starts_with("Choice") {
                letter.identifier()
            } else {
                letter.as_char().to_string()
            };
            // keep surrounding whitespace
            let leading = &current[..current.len() - current.trim_start().len()];
            let trailing = &current[current.trim_end().len()..];
            (start, end, format!("{}{}{}", leading, new_value, trailing))
        }
        ValueSite::Empty { start, end } => (start, end, format!("<qti-value>{}</qti-value>", letter.identifier())),
        ValueSite::Missing { insert_at } => (
            insert_at,
            insert_at,
            format!(
                "<qti-correct-response><qti-value>{}</qti-value></qti-correct-response>",
                letter.identifier()
            ),
        ),
    };

    let mut updated = String::with_capacity(xml.len() + replacement.len());
    updated.push_str(&xml[..start]);
    updated.push_str(&replacement);
    updated.push_str(&xml[end..]);
    Ok(Some(updated))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AnswerUpdateSummary {
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub not_in_key: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Apply `key` to every `question.xml` under `root`.
pub fn update_tree(root: &Path, key: &AnswerKey) -> Result<AnswerUpdateSummary> {
    let mut summary = AnswerUpdateSummary::default();
    for path in output::question_files(root)? {
        let Some(id) = output::question_id_of(&path).map(str::to_string) else {
            continue;
        };
        let Some(letter) = id.strip_prefix('Q').and_then(|n| n.parse().ok()).and_then(|n| key.get(n)) else {
            summary.not_in_key.push(id);
            continue;
        };
        let xml = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        match update_correct_response(&xml, letter) {
            Ok(Some(updated)) => {
                output::write_atomic(&path, updated.as_bytes())?;
                log::info!("✏️  {} → {}", id, letter);
                summary.updated.push(id);
            }
            Ok(None) => summary.unchanged.push(id),
            Err(e) => {
                log::warn!("⚠️  {}: {:#}", id, e);
                summary.failed.push((id, format!("{:#}", e)));
            }
        }
    }
    log::info!(
        "✅ Answers: {} updated, {} unchanged, {} not in key, {} failed",
        summary.updated.len(),
        summary.unchanged.len(),
        summary.not_in_key.len(),
        summary.failed.len()
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ITEM: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<qti-assessment-item identifier="Q3">
  <qti-response-declaration identifier="RESPONSE" cardinality="single" base-type="identifier">
    <qti-correct-response>
      <qti-value>ChoiceA</qti-value>
    </qti-correct-response>
  </qti-response-declaration>
  <qti-item-body>
    <qti-choice-interaction response-identifier="RESPONSE" max-choices="1">
      <qti-simple-choice identifier="ChoiceA">1</qti-simple-choice>
      <qti-simple-choice identifier="ChoiceB">2</qti-simple-choice>
      <qti-simple-choice identifier="ChoiceC">3</qti-simple-choice>
    </qti-choice-interaction>
  </qti-item-body>
</qti-assessment-item>
"#;

    #[test]
    fn only_the_value_changes() {
        let updated = update_correct_response(ITEM, ChoiceLetter::C).unwrap().unwrap();
        assert_eq!(updated, ITEM.replace("<qti-value>ChoiceA</qti-value>", "<qti-value>ChoiceC</qti-value>"));
        assert_eq!(update_correct_response(&updated, ChoiceLetter::C).unwrap(), None);
    }

    #[test]
    fn bare_letter_style_is_kept() {
        let bare = ITEM.replace("<qti-value>ChoiceA</qti-value>", "<qti-value> A </qti-value>");
        let updated = update_correct_response(&bare, ChoiceLetter::B).unwrap().unwrap();
        assert!(updated.contains("<qti-value> B </qti-value>"));
    }

    #[test]
    fn unknown_value_becomes_the_bare_letter() {
        let odd = ITEM.replace("ChoiceA</qti-value>", "X</qti-value>");
        let updated = update_correct_response(&odd, ChoiceLetter::B).unwrap().unwrap();
        assert!(updated.contains("<qti-value>B</qti-value>"));
        assert_eq!(updated, odd.replace("<qti-value>X</qti-value>", "<qti-value>B</qti-value>"));
    }

    #[test]
    fn missing_correct_response_is_inserted() {
        let start = ITEM.find("    <qti-correct-response>").unwrap();
        let end = ITEM.find("</qti-correct-response>\n").unwrap() + "</qti-correct-response>\n".len();
        let without = format!("{}{}", &ITEM[..start], &ITEM[end..]);
        let updated = update_correct_response(&without, ChoiceLetter::B).unwrap().unwrap();
        assert!(updated.contains("<qti-correct-response><qti-value>ChoiceB</qti-value></qti-correct-response>"));
        assert_eq!(update_correct_response(&updated, ChoiceLetter::B).unwrap(), None);
    }

    #[test]
    fn absent_choice_is_refused() {
        assert!(update_correct_response(ITEM, ChoiceLetter::E).is_err());
    }

    #[test]
    fn key_parsing_skips_unusable_entries() {
        let key = AnswerKey::from_json(r#"{"1": "b", "Q2": "ChoiceD", "3": "*"}"#).unwrap();
        assert_eq!(key.get(1), Some(ChoiceLetter::B));
        assert_eq!(key.get(2), Some(ChoiceLetter::D));
        assert_eq!(key.get(3), None);
        assert_eq!(key.len(), 2);
        assert!(AnswerKey::from_json(r#"{"uno": "A"}"#).is_err());
    }

    #[test]
    fn tree_update_reports_each_question() {
        let dir = tempfile::tempdir().unwrap();
        output::write_atomic(&output::question_file(dir.path(), "Q3"), ITEM.as_bytes()).unwrap();
        output::write_atomic(&output::question_file(dir.path(), "Q4"), ITEM.as_bytes()).unwrap();
        let key = AnswerKey::from_answers([(3, ChoiceLetter::B)]);

        let summary = update_tree(dir.path(), &key).unwrap();
        assert_eq!(summary.updated, vec!["Q3"]);
        assert_eq!(summary.not_in_key, vec!["Q4"]);
        let written = std::fs::read_to_string(output::question_file(dir.path(), "Q3")).unwrap();
        assert!(written.contains("<qti-value>ChoiceB</qti-value>"));

        let again = update_tree(dir.path(), &key).unwrap();
        assert_eq!(again.unchanged, vec!["Q3"]);
    }
}
