//! QTI 3.0 item serialization.
//!
//! Output depends only on the inputs: no timestamps, no random identifiers,
//! attributes in a fixed order. Two runs over the same chunk give the same
//! bytes apart from the image URLs the storage hands back.

use super::encoding::fix_encoding;
use crate::collaborators::ChoiceFeedback;
use crate::config::GenerationConfig;
use crate::error::QuestionError;
use crate::types::{ChoiceLetter, QtiItem, QuestionChunk, SharedContext};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::collections::BTreeMap;

pub const QTI_NAMESPACE: &str = "http://www.imsglobal.org/xsd/imsqtiasi_v3p0";
const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";
const SCHEMA_LOCATION: &str = "http://www.imsglobal.org/xsd/imsqtiasi_v3p0 https://purl.imsglobal.org/spec/qti/v3p0/schema/xsd/imsqti_asiv3p0_v1p0.xsd";
const MATCH_CORRECT: &str = "https://purl.imsglobal.org/spec/qti/v3p0/rptemplates/match_correct";

/// Everything an item is built from. Image fields hold URLs already stored.
pub struct ItemContent<'a> {
    pub chunk: &'a QuestionChunk,
    pub shared_context: Option<&'a SharedContext>,
    pub correct: Option<ChoiceLetter>,
    pub feedback: Option<&'a ChoiceFeedback>,
    pub context_images: &'a [String],
    pub prompt_images: &'a [String],
    pub choice_images: &'a BTreeMap<ChoiceLetter, String>,
}

pub struct QtiGenerator {
    config: GenerationConfig,
}

struct XmlOut {
    writer: Writer<Vec<u8>>,
}

impl XmlOut {
    fn new() -> Self {
        Self {
            writer: Writer::new_with_indent(Vec::new(), b' ', 2),
        }
    }

    fn start(&mut self, name: &str, attrs: &[(&str, &str)]) -> quick_xml::Result<()> {
        let mut element = BytesStart::new(name);
        for attr in attrs {
            element.push_attribute(*attr);
        }
        self.writer.write_event(Event::Start(element))
    }

    fn empty(&mut self, name: &str, attrs: &[(&str, &str)]) -> quick_xml::Result<()> {
        let mut element = BytesStart::new(name);
        for attr in attrs {
            element.push_attribute(*attr);
        }
        self.writer.write_event(Event::Empty(element))
    }

    fn end(&mut self, name: &str) -> quick_xml::Result<()> {
        self.writer.write_event(Event::End(BytesEnd::new(name)))
    }

    fn text(&mut self, text: &str) -> quick_xml::Result<()> {
        self.writer.write_event(Event::Text(BytesText::new(text)))
    }

    fn text_element(&mut self, name: &str, attrs: &[(&str, &str)], text: &str) -> quick_xml::Result<()> {
        self.start(name, attrs)?;
        self.text(text)?;
        self.end(name)
    }

    fn finish(self) -> Vec<u8> {
        self.writer.into_inner()
    }
}

impl QtiGenerator {
    pub fn new(config: &GenerationConfig) -> Self {
        Self { config: config.clone() }
    }

    pub fn build_item(&self, content: &ItemContent) -> Result<QtiItem, QuestionError> {
        let chunk = content.chunk;
        if chunk.content.choices.is_empty() {
            return Err(QuestionError::Other(anyhow::anyhow!(
                "{} has no answer choices to build a choice interaction from",
                chunk.id
            )));
        }
        if let Some(letter) = content.correct {
            if chunk.content.choice(letter).is_none() {
                return Err(QuestionError::AnswerOutOfRange {
                    question: chunk.question_number,
                    letter: letter.as_char(),
                });
            }
        } else if !self.config.allow_missing_answer {
            return Err(QuestionError::MissingAnswer(chunk.question_number));
        }

        let bytes = self
            .write_item(content)
            .map_err(|e| QuestionError::MalformedXml(format!("writing {}: {}", chunk.id, e)))?;
        let xml = String::from_utf8(bytes).map_err(|e| QuestionError::MalformedXml(e.to_string()))?;
        check_well_formed(&xml, chunk.content.choices.len())?;

        let mut image_urls: Vec<String> = content.context_images.to_vec();
        image_urls.extend(content.prompt_images.iter().cloned());
        image_urls.extend(content.choice_images.values().cloned());

        Ok(QtiItem {
            identifier: chunk.id.clone(),
            title: self.title(chunk),
            xml,
            image_urls,
            correct: content.correct,
        })
    }

    fn title(&self, chunk: &QuestionChunk) -> String {
        format!("{} {}", self.config.title_prefix, chunk.question_number)
    }

    fn feedback_enabled(&self, content: &ItemContent) -> bool {
        self.config.include_feedback && content.feedback.is_some_and(|f| !f.is_empty())
    }

    fn write_item(&self, content: &ItemContent) -> quick_xml::Result<Vec<u8>> {
        let chunk = content.chunk;
        let title = fix_encoding(&self.title(chunk)).text;
        let with_feedback = self.feedback_enabled(content);
        let mut out = XmlOut::new();

        out.writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        out.start(
            "qti-assessment-item",
            &[
                ("xmlns", QTI_NAMESPACE),
                ("xmlns:xsi", XSI_NAMESPACE),
                ("xsi:schemaLocation", SCHEMA_LOCATION),
                ("identifier", chunk.id.as_str()),
                ("title", title.as_str()),
                ("adaptive", "false"),
                ("time-dependent", "false"),
            ],
        )?;

        // Declarations
        out.start(
            "qti-response-declaration",
            &[("identifier", "RESPONSE"), ("cardinality", "single"), ("base-type", "identifier")],
        )?;
        if let Some(letter) = content.correct {
            out.start("qti-correct-response", &[])?;
            out.text_element("qti-value", &[], &letter.identifier())?;
            out.end("qti-correct-response")?;
        }
        out.end("qti-response-declaration")?;

        out.start(
            "qti-outcome-declaration",
            &[("identifier", "SCORE"), ("cardinality", "single"), ("base-type", "float")],
        )?;
        out.start("qti-default-value", &[])?;
        out.text_element("qti-value", &[], "0")?;
        out.end("qti-default-value")?;
        out.end("qti-outcome-declaration")?;
        if with_feedback {
            out.empty(
                "qti-outcome-declaration",
                &[("identifier", "FEEDBACK"), ("cardinality", "single"), ("base-type", "identifier")],
            )?;
        }

        // Body
        out.start("qti-item-body", &[])?;
        if let Some(shared) = content.shared_context {
            out.start("div", &[("class", "shared-context"), ("data-context-id", shared.id.as_str())])?;
            write_paragraphs(&mut out, &shared.text)?;
            write_images(&mut out, content.context_images, "Contexto")?;
            out.end("div")?;
        }
        write_paragraphs(&mut out, &chunk.content.stem)?;
        for part in &chunk.content.parts {
            let text = format!("Parte {}: {}", part.label, part.text);
            out.text_element("p", &[("class", "question-part")], &fix_encoding(&text).text)?;
        }
        write_images(&mut out, content.prompt_images, "Figura")?;

        let shuffle = if self.config.shuffle { "true" } else { "false" };
        out.start(
            "qti-choice-interaction",
            &[("response-identifier", "RESPONSE"), ("shuffle", shuffle), ("max-choices", "1")],
        )?;
        for choice in &chunk.content.choices {
            let identifier = choice.letter.identifier();
            out.start("qti-simple-choice", &[("identifier", identifier.as_str())])?;
            let text = fix_encoding(choice.text.trim()).text;
            if !text.is_empty() {
                out.text(&text)?;
            }
            if let Some(url) = content.choice_images.get(&choice.letter) {
                let alt = format!("Alternativa {}", choice.letter);
                out.empty("img", &[("src", url.as_str()), ("alt", alt.as_str())])?;
            }
            if with_feedback {
                if let Some(message) = content.feedback.and_then(|f| f.get(&choice.letter)) {
                    out.text_element(
                        "qti-feedback-inline",
                        &[("outcome-identifier", "FEEDBACK"), ("identifier", identifier.as_str()), ("show-hide", "show")],
                        &fix_encoding(message).text,
                    )?;
                }
            }
            out.end("qti-simple-choice")?;
        }
        out.end("qti-choice-interaction")?;
        out.end("qti-item-body")?;

        if with_feedback {
            write_feedback_processing(&mut out)?;
        } else {
            out.empty("qti-response-processing", &[("template", MATCH_CORRECT)])?;
        }

        out.end("qti-assessment-item")?;
        let mut bytes = out.finish();
        bytes.push(b'\n');
        Ok(bytes)
    }
}

fn write_paragraphs(out: &mut XmlOut, text: &str) -> quick_xml::Result<()> {
    let repaired = fix_encoding(text).text;
    for line in repaired.lines().map(str::trim).filter(|l| !l.is_empty()) {
        out.text_element("p", &[], line)?;
    }
    Ok(())
}

fn write_images(out: &mut XmlOut, urls: &[String], alt_prefix: &str) -> quick_xml::Result<()> {
    for (n, url) in urls.iter().enumerate() {
        let alt = format!("{} {}", alt_prefix, n + 1);
        out.start("p", &[])?;
        out.empty("img", &[("src", url.as_str()), ("alt", alt.as_str())])?;
        out.end("p")?;
    }
    Ok(())
}

/// match_correct plus copying the response into FEEDBACK for inline feedback.
fn write_feedback_processing(out: &mut XmlOut) -> quick_xml::Result<()> {
    let set_score = |out: &mut XmlOut, value: &str| -> quick_xml::Result<()> {
        out.start("qti-set-outcome-value", &[("identifier", "SCORE")])?;
        out.text_element("qti-base-value", &[("base-type", "float")], value)?;
        out.end("qti-set-outcome-value")
    };

    out.start("qti-response-processing", &[])?;
    out.start("qti-response-condition", &[])?;
    out.start("qti-response-if", &[])?;
    out.start("qti-match", &[])?;
    out.empty("qti-variable", &[("identifier", "RESPONSE")])?;
    out.empty("qti-correct", &[("identifier", "RESPONSE")])?;
    out.end("qti-match")?;
    set_score(out, "1")?;
    out.end("qti-response-if")?;
    out.start("qti-response-else", &[])?;
    set_score(out, "0")?;
    out.end("qti-response-else")?;
    out.end("qti-response-condition")?;
    out.start("qti-set-outcome-value", &[("identifier", "FEEDBACK")])?;
    out.empty("qti-variable", &[("identifier", "RESPONSE")])?;
    out.end("qti-set-outcome-value")?;
    out.end("qti-response-processing")
}

/// Parse the assembled item back and confirm its interaction is intact.
pub fn check_well_formed(xml: &str, expected_choices: usize) -> Result<(), QuestionError> {
    let mut reader = Reader::from_str(xml);
    let mut depth = 0usize;
    let mut simple_choices = 0;
    let mut root_namespace_ok = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if depth == 0 {
                    root_namespace_ok = e.name().as_ref() == b"qti-assessment-item"
                        && e.try_get_attribute("xmlns")
                            .ok()
                            .flatten()
                            .is_some_and(|a| a.value.as_ref() == QTI_NAMESPACE.as_bytes());
                }
                if e.name().as_ref() == b"qti-simple-choice" {
                    simple_choices += 1;
                }
                depth += 1;
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"qti-simple-choice" => simple_choices += 1,
            Ok(Event::End(_)) => depth = depth.saturating_sub(1),
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(QuestionError::MalformedXml(format!(
                    "at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
        }
    }
    if depth != 0 {
        return Err(QuestionError::MalformedXml("unclosed elements".to_string()));
    }
    if !root_namespace_ok {
        return Err(QuestionError::MalformedXml("root is not a QTI 3.0 assessment item".to_string()));
    }
    if simple_choices != expected_choices {
        return Err(QuestionError::MalformedXml(format!(
            "expected {} simple choices, found {}",
            expected_choices, simple_choices
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChoiceText, ChunkContent};

    fn chunk() -> QuestionChunk {
        QuestionChunk {
            id: "Q2".to_string(),
            question_number: 2,
            position: 1,
            regions: vec![],
            content: ChunkContent {
                stem: "¿Cuál es la capital de Chile?\nConsidere la región central & sus valles.".to_string(),
                choices: ["Lima", "Santiago", "Quito", "Bogotá"]
                    .iter()
                    .zip(ChoiceLetter::ALL)
                    .map(|(t, letter)| ChoiceText {
                        letter,
                        text: t.to_string(),
                    })
                    .collect(),
                parts: vec![],
            },
            images: vec![],
            raw_lines: vec![],
            shared_context_id: None,
            declared_choice_count: Some(4),
            declared_part_count: None,
        }
    }

    fn content<'a>(chunk: &'a QuestionChunk, none: &'a BTreeMap<ChoiceLetter, String>) -> ItemContent<'a> {
        ItemContent {
            chunk,
            shared_context: None,
            correct: Some(ChoiceLetter::B),
            feedback: None,
            context_images: &[],
            prompt_images: &[],
            choice_images: none,
        }
    }

    #[test]
    fn builds_a_choice_item() {
        let chunk = chunk();
        let none = BTreeMap::new();
        let item = QtiGenerator::new(&GenerationConfig::default())
            .build_item(&content(&chunk, &none))
            .unwrap();
        assert!(item.xml.contains(QTI_NAMESPACE));
        assert!(item.xml.contains("<qti-value>ChoiceB</qti-value>"));
        assert!(item.xml.contains("<qti-simple-choice identifier=\"ChoiceD\">Bogotá</qti-simple-choice>"));
        assert!(item.xml.contains("&amp; sus valles"));
        assert!(!item.xml.contains("<img"));
        assert!(item.xml.contains(MATCH_CORRECT));
        assert_eq!(item.title, "Pregunta 2");
    }

    #[test]
    fn same_input_gives_identical_bytes() {
        let chunk = chunk();
        let none = BTreeMap::new();
        let generator = QtiGenerator::new(&GenerationConfig::default());
        let a = generator.build_item(&content(&chunk, &none)).unwrap();
        let b = generator.build_item(&content(&chunk, &none)).unwrap();
        assert_eq!(a.xml, b.xml);
    }

    #[test]
    fn answer_must_be_a_present_choice() {
        let chunk = chunk();
        let none = BTreeMap::new();
        let mut input = content(&chunk, &none);
        input.correct = Some(ChoiceLetter::E);
        let err = QtiGenerator::new(&GenerationConfig::default()).build_item(&input).unwrap_err();
        assert!(matches!(err, QuestionError::AnswerOutOfRange { letter: 'E', .. }));

        input.correct = None;
        let err = QtiGenerator::new(&GenerationConfig::default()).build_item(&input).unwrap_err();
        assert!(matches!(err, QuestionError::MissingAnswer(2)));
    }

    #[test]
    fn images_and_feedback_are_embedded() {
        let chunk = chunk();
        let choice_images: BTreeMap<ChoiceLetter, String> =
            [(ChoiceLetter::A, "memory://Q2_altA.png".to_string())].into_iter().collect();
        let feedback: ChoiceFeedback = [(ChoiceLetter::B, "Correcto.".to_string())].into_iter().collect();
        let prompt = vec!["memory://Q2_img1.png".to_string()];
        let mut input = content(&chunk, &choice_images);
        input.feedback = Some(&feedback);
        input.prompt_images = &prompt;

        let item = QtiGenerator::new(&GenerationConfig::default()).build_item(&input).unwrap();
        assert!(item.xml.contains("src=\"memory://Q2_img1.png\""));
        assert!(item.xml.contains("src=\"memory://Q2_altA.png\""));
        assert!(item.xml.contains("identifier=\"FEEDBACK\""));
        assert!(item.xml.contains(">Correcto.</qti-feedback-inline>"));
        assert!(!item.xml.contains(MATCH_CORRECT));
        assert_eq!(item.image_urls.len(), 2);
    }

    #[test]
    fn malformed_markup_is_rejected() {
        let err = check_well_formed("<qti-assessment-item><p></qti-assessment-item>", 0).unwrap_err();
        assert!(matches!(err, QuestionError::MalformedXml(_)));
    }
}
