//! Layout XHTML parser
//!
//! Parses the layout XHTML intermediate format produced by PDF backends (and
//! by external OCR/layout tools for scanned exams) into raw pages. The
//! format is:
//!
//! ```text
//! <style> .f0 { font-family: Arial; font-size: 11px; font-style: normal; font-weight: bold; } </style>
//! <div class="page" data-page="1" data-width="595" data-height="842">
//!   <p data-bbox="x1,y1,x2,y2">
//!     <span class="f0" data-bbox="x1,y1,x2,y2">Pregunta 1</span>
//!   </p>
//!   <img data-bbox="x1,y1,x2,y2" data-width="640" data-height="480"/>
//! </div>
//! ```
//!
//! Coordinates are PDF points, origin top-left. `<p>` elements are optional;
//! when present their index becomes the span's block hint.

use crate::geometry::BoundingBox;
use crate::types::{FontInfo, ImageRegion, RawPage, RawSpan};
use anyhow::{anyhow, Result};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static PAGE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<div class="page"([^>]*)>(.*?)</div>"#).unwrap()
});

static PARAGRAPH_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<p\b[^>]*>(.*?)</p>").unwrap());

static SPAN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<span\b([^>]*)>([^<]*)</span>"#).unwrap()
});

static IMG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<img\b([^>]*?)/?>"#).unwrap());

static ATTR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([\w-]+)="([^"]*)""#).unwrap());

static STYLE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<style[^>]*>(.*?)</style>").unwrap());

static FONT_CLASS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.([\w-]+)\s*\{([^}]*)\}").unwrap()
});

/// Parse layout XHTML into raw pages, in document order.
pub fn parse_layout(xhtml: &str) -> Result<Vec<RawPage>> {
    let fonts = extract_font_classes(xhtml);
    let mut pages = Vec::new();

    for (page_index, page_cap) in PAGE_REGEX.captures_iter(xhtml).enumerate() {
        let attrs = parse_attributes(page_cap.get(1).map_or("", |m| m.as_str()));
        let body = page_cap.get(2).map_or("", |m| m.as_str());

        let number = attrs
            .get("data-page")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(page_index as u32 + 1);
        let width = parse_dimension(&attrs, "data-width")
            .ok_or_else(|| anyhow!("page {} has no data-width", number))?;
        let height = parse_dimension(&attrs, "data-height")
            .ok_or_else(|| anyhow!("page {} has no data-height", number))?;

        let mut spans = Vec::new();
        let mut paragraph_count = 0u32;
        for p_cap in PARAGRAPH_REGEX.captures_iter(body) {
            if let Some(p_content) = p_cap.get(1) {
                extract_spans(p_content.as_str(), Some(paragraph_count), &fonts, &mut spans);
                paragraph_count += 1;
            }
        }
        if paragraph_count == 0 {
            // Producers that emit bare spans leave grouping to spatial clustering
            extract_spans(body, None, &fonts, &mut spans);
        }

        let images = extract_images(body);

        pages.push(RawPage {
            number,
            width,
            height,
            spans,
            images,
        });
    }

    log::debug!(
        "✅ Layout parsing complete: {} pages, {} spans, {} font classes",
        pages.len(),
        pages.iter().map(|p| p.spans.len()).sum::<usize>(),
        fonts.len()
    );

    Ok(pages)
}

fn extract_spans(
    html: &str,
    block_hint: Option<u32>,
    fonts: &HashMap<String, FontInfo>,
    spans: &mut Vec<RawSpan>,
) {
    for cap in SPAN_REGEX.captures_iter(html) {
        let (Some(attr_text), Some(text)) = (cap.get(1), cap.get(2)) else {
            continue;
        };
        let attrs = parse_attributes(attr_text.as_str());
        let content = unescape_text(text.as_str());
        let content = content.trim();
        if content.is_empty() {
            continue;
        }
        let Some(bbox) = attrs.get("data-bbox").and_then(|b| parse_bbox(b)) else {
            continue;
        };
        let class_name = attrs.get("class").map(String::as_str).unwrap_or("");
        let font = fonts
            .get(class_name)
            .cloned()
            .unwrap_or_else(|| FontInfo::fallback(class_name));

        spans.push(RawSpan {
            text: content.to_string(),
            font,
            bbox,
            block_hint,
        });
    }
}

fn extract_images(html: &str) -> Vec<ImageRegion> {
    IMG_REGEX
        .captures_iter(html)
        .filter_map(|cap| {
            let attrs = parse_attributes(cap.get(1)?.as_str());
            let bbox = parse_bbox(attrs.get("data-bbox")?)?;
            Some(ImageRegion {
                bbox,
                pixel_width: attrs.get("data-width").and_then(|v| v.parse().ok()).unwrap_or(0),
                pixel_height: attrs.get("data-height").and_then(|v| v.parse().ok()).unwrap_or(0),
            })
        })
        .collect()
}

fn parse_attributes(text: &str) -> HashMap<String, String> {
    ATTR_REGEX
        .captures_iter(text)
        .filter_map(|cap| Some((cap.get(1)?.as_str().to_string(), cap.get(2)?.as_str().to_string())))
        .collect()
}

fn parse_dimension(attrs: &HashMap<String, String>, name: &str) -> Option<f32> {
    attrs
        .get(name)
        .and_then(|v| v.trim().parse::<f32>().ok())
        .filter(|v| v.is_finite() && *v > 0.0)
}

/// `"x1,y1,x2,y2"`
fn parse_bbox(value: &str) -> Option<BoundingBox> {
    let parts: Vec<f32> = value
        .split(',')
        .map(|p| p.trim().parse::<f32>())
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    match parts.as_slice() {
        [x1, y1, x2, y2] if parts.iter().all(|v| v.is_finite()) => {
            Some(BoundingBox::new(*x1, *y1, *x2, *y2))
        }
        _ => None,
    }
}

fn unescape_text(text: &str) -> String {
    match quick_xml::escape::unescape(text) {
        Ok(unescaped) => unescaped.into_owned(),
        Err(_) => text.to_string(),
    }
}

/// Font classes from the `<style>` block.
fn extract_font_classes(xhtml: &str) -> HashMap<String, FontInfo> {
    let mut font_classes = HashMap::new();
    let Some(style_cap) = STYLE_REGEX.captures(xhtml) else {
        return font_classes;
    };
    let css = style_cap.get(1).map_or("", |m| m.as_str());

    for cap in FONT_CLASS_REGEX.captures_iter(css) {
        let (Some(class_name), Some(body)) = (cap.get(1), cap.get(2)) else {
            continue;
        };
        let class_name = class_name.as_str().to_string();
        let mut font = FontInfo::fallback(&class_name);
        for declaration in body.as_str().split(';') {
            let Some((key, value)) = declaration.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "font-family" => font.family = value.trim_matches('"').to_string(),
                "font-size" => {
                    if let Ok(size) = value.trim_end_matches("px").trim_end_matches("pt").parse::<f32>() {
                        font.size = size;
                    }
                }
                "font-style" => font.italic = value.contains("italic"),
                "font-weight" => {
                    font.bold = value == "bold" || value.parse::<u32>().map(|w| w >= 600).unwrap_or(false)
                }
                _ => {}
            }
        }
        font_classes.insert(class_name, font);
    }

    font_classes
}

/// Serialise raw pages back into layout XHTML. Backends build their output
/// with this so every producer shares one format.
pub fn write_layout(pages: &[RawPage]) -> String {
    let mut fonts: Vec<&FontInfo> = Vec::new();
    for span in pages.iter().flat_map(|p| p.spans.iter()) {
        if !fonts.iter().any(|f| f.class_name == span.font.class_name) {
            fonts.push(&span.font);
        }
    }

    let mut out = String::from("<html><head><style>\n");
    for font in &fonts {
        out.push_str(&format!(
            ".{} {{ font-family: {}; font-size: {}px; font-style: {}; font-weight: {}; }}\n",
            font.class_name,
            font.family,
            font.size,
            if font.italic { "italic" } else { "normal" },
            if font.bold { "bold" } else { "normal" },
        ));
    }
    out.push_str("</style></head><body>\n");

    for page in pages {
        out.push_str(&format!(
            "<div class=\"page\" data-page=\"{}\" data-width=\"{}\" data-height=\"{}\">\n",
            page.number, page.width, page.height
        ));
        let mut current_block: Option<Option<u32>> = None;
        for span in &page.spans {
            if current_block != Some(span.block_hint) {
                if current_block.is_some() {
                    out.push_str("</p>\n");
                }
                out.push_str("<p>");
                current_block = Some(span.block_hint);
            }
            out.push_str(&format!(
                "<span class=\"{}\" data-bbox=\"{}\">{}</span>",
                span.font.class_name,
                format_bbox(&span.bbox),
                quick_xml::escape::escape(span.text.as_str())
            ));
        }
        if current_block.is_some() {
            out.push_str("</p>\n");
        }
        for image in &page.images {
            out.push_str(&format!(
                "<img data-bbox=\"{}\" data-width=\"{}\" data-height=\"{}\"/>\n",
                format_bbox(&image.bbox),
                image.pixel_width,
                image.pixel_height
            ));
        }
        out.push_str("</div>\n");
    }
    out.push_str("</body></html>\n");
    out
}

fn format_bbox(bbox: &BoundingBox) -> String {
    format!("{:.2},{:.2},{:.2},{:.2}", bbox.x1, bbox.y1, bbox.x2, bbox.y2)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<html><head><style>
.f0 { font-family: Arial; font-size: 11px; font-style: normal; font-weight: bold; }
.f1 { font-family: Times; font-size: 10px; font-style: italic; font-weight: 400; }
</style></head><body>
<div class="page" data-page="1" data-width="595" data-height="842">
<p><span class="f0" data-bbox="50,100,120,112">Pregunta 1</span></p>
<p><span class="f1" data-bbox="50,120,300,132">¿Cu&#225;l es &lt;x&gt;?</span><span class="f1" data-bbox="50,120,300,132"> </span></p>
<img data-bbox="60,140,260,300" data-width="400" data-height="320"/>
</div>
<div class="page" data-page="2" data-width="595" data-height="842">
<span class="f9" data-bbox="50,60,80,72">A) 3</span>
</div>
</body></html>"#;

    #[test]
    fn parses_pages_spans_fonts_and_images() {
        let pages = parse_layout(SAMPLE).unwrap();
        assert_eq!(pages.len(), 2);

        let first = &pages[0];
        assert_eq!(first.number, 1);
        assert_eq!(first.width, 595.0);
        assert_eq!(first.spans.len(), 2);
        assert!(first.spans[0].font.bold);
        assert_eq!(first.spans[0].block_hint, Some(0));
        assert!(first.spans[1].font.italic);
        assert_eq!(first.spans[1].block_hint, Some(1));
        assert_eq!(first.images.len(), 1);
        assert_eq!(first.images[0].pixel_width, 400);

        let second = &pages[1];
        assert_eq!(second.spans[0].block_hint, None);
        assert_eq!(second.spans[0].font.family, "unknown");
    }

    #[test]
    fn decodes_xml_entities() {
        let pages = parse_layout(SAMPLE).unwrap();
        assert_eq!(pages[0].spans[1].text, "¿Cuál es <x>?");
    }

    #[test]
    fn missing_page_size_is_an_error() {
        let xhtml = r#"<div class="page" data-page="1"><span class="f0" data-bbox="0,0,1,1">x</span></div>"#;
        assert!(parse_layout(xhtml).is_err());
    }

    #[test]
    fn written_layout_parses_back() {
        let pages = parse_layout(SAMPLE).unwrap();
        let again = parse_layout(&write_layout(&pages)).unwrap();
        assert_eq!(again.len(), 2);
        assert_eq!(again[0].spans[0].text, "Pregunta 1");
        assert_eq!(again[0].images.len(), 1);
        assert_eq!(again[1].spans[0].text, "A) 3");
    }
}
