use crate::config::SpatialClusteringConfig;
use crate::geometry::{union_all, BoundingBox};
use crate::types::{Page, RawPage, RawSpan, TextBlock, TextLine, TextSpan};

/// Groups raw spans into lines and lines into blocks.
pub struct SpatialClusterer<'a> {
    config: &'a SpatialClusteringConfig,
}

impl<'a> SpatialClusterer<'a> {
    pub fn new(config: &'a SpatialClusteringConfig) -> Self {
        Self { config }
    }

    pub fn build_page(&self, raw: RawPage, reference_scale: f32) -> Page {
        let blocks = self.cluster(&raw.spans);
        Page {
            number: raw.number,
            width: raw.width,
            height: raw.height,
            reference_scale,
            blocks,
            images: raw.images,
        }
    }

    pub fn cluster(&self, spans: &[RawSpan]) -> Vec<TextBlock> {
        if spans.is_empty() {
            return Vec::new();
        }
        let lines = self.group_lines(spans);
        self.group_blocks(lines)
    }

    /// Step 1: spans sharing a baseline band become one line.
    fn group_lines(&self, spans: &[RawSpan]) -> Vec<(TextLine, Option<u32>)> {
        let mut sorted: Vec<&RawSpan> = spans.iter().collect();
        sorted.sort_by(|a, b| {
            a.bbox
                .center_y()
                .total_cmp(&b.bbox.center_y())
                .then_with(|| a.bbox.x1.total_cmp(&b.bbox.x1))
        });

        let mut lines: Vec<(Vec<&RawSpan>, BoundingBox, Option<u32>)> = Vec::new();
        for span in sorted {
            let joined = lines.last_mut().filter(|(_, bbox, hint)| {
                *hint == span.block_hint && self.same_line(bbox, &span.bbox)
            });
            match joined {
                Some((members, bbox, _)) => {
                    members.push(span);
                    *bbox = bbox.union(&span.bbox);
                }
                None => lines.push((vec![span], span.bbox, span.block_hint)),
            }
        }

        lines
            .into_iter()
            .map(|(mut members, bbox, hint)| {
                members.sort_by(|a, b| a.bbox.x1.total_cmp(&b.bbox.x1));
                let spans = members
                    .into_iter()
                    .map(|s| TextSpan {
                        text: s.text.clone(),
                        font: s.font.clone(),
                        bbox: s.bbox,
                    })
                    .collect();
                (TextLine { bbox, spans }, hint)
            })
            .collect()
    }

    fn same_line(&self, line: &BoundingBox, span: &BoundingBox) -> bool {
        let line_height = line
            .height()
            .max(span.height())
            .max(self.config.min_line_height);
        let tolerance = line_height * self.config.line_grouping_tolerance;
        (line.center_y() - span.center_y()).abs() <= tolerance
    }

    /// Step 2: consecutive lines close enough vertically and aligned on the left form a block.
    fn group_blocks(&self, lines: Vec<(TextLine, Option<u32>)>) -> Vec<TextBlock> {
        let mut blocks: Vec<(Vec<TextLine>, Option<u32>)> = Vec::new();

        for (line, hint) in lines {
            let starts_new = match blocks.last() {
                None => true,
                Some((members, block_hint)) => {
                    let previous = &members[members.len() - 1];
                    match (block_hint, hint) {
                        (Some(a), Some(b)) => *a != b,
                        _ => !self.are_adjacent(previous, &line),
                    }
                }
            };
            if starts_new {
                blocks.push((vec![line], hint));
            } else if let Some((members, _)) = blocks.last_mut() {
                members.push(line);
            }
        }

        blocks
            .into_iter()
            .filter_map(|(lines, _)| {
                let bbox = union_all(lines.iter().map(|l| &l.bbox))?;
                Some(TextBlock { bbox, lines })
            })
            .collect()
    }

    fn are_adjacent(&self, previous: &TextLine, next: &TextLine) -> bool {
        let line_height = previous.bbox.height().max(self.config.min_line_height);
        let vertical_gap = next.bbox.y1 - previous.bbox.y2;
        if vertical_gap > line_height * self.config.vertical_gap_threshold_multiplier {
            return false;
        }
        (next.bbox.x1 - previous.bbox.x1).abs() <= self.config.horizontal_alignment_tolerance
    }
}

/// Concatenate block text in reading order: top-to-bottom, then left-to-right.
pub fn flatten_text(blocks: &[TextBlock]) -> String {
    let mut lines: Vec<&TextLine> = blocks.iter().flat_map(|b| b.lines.iter()).collect();
    lines.sort_by(|a, b| {
        a.bbox
            .y1
            .total_cmp(&b.bbox.y1)
            .then_with(|| a.bbox.x1.total_cmp(&b.bbox.x1))
    });
    lines
        .iter()
        .map(|l| l.text())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
