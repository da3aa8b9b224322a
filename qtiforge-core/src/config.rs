use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_llm_split_page_threshold() -> usize {
    40
}

fn default_llm_window_pages() -> usize {
    8
}

fn default_llm_window_overlap() -> usize {
    1
}

fn default_question_start_patterns() -> Vec<String> {
    vec![
        // "Pregunta 12", "Question 3", "Ítem 4", "P7"
        r"^\s*(?:Pregunta|PREGUNTA|Question|QUESTION|Ítem|ÍTEM|Item|ITEM|P)\s*(\d{1,3})\b[\s\.:\)-]*".to_string(),
        // "12. Text", "12) Text"
        r"^\s*(\d{1,3})\s*[\.\)]\s+\S".to_string(),
    ]
}

fn default_shared_context_patterns() -> Vec<String> {
    vec![
        r"(?i)(?:preguntas|questions|ítems|items)\s+(\d{1,3})\s*(?:a|al|to|-|–|y|and|through)\s*(\d{1,3})".to_string(),
    ]
}

fn default_choice_marker_pattern() -> String {
    r"^\s*\(?([A-E])[\)\.:]\s+(.*)$".to_string()
}

fn default_bare_choice_pattern() -> String {
    r"^\s*\(?([A-E])[\)\.:]?\s*$".to_string()
}

fn default_part_pattern() -> String {
    r"^\s*(?:Parte|PARTE|Part|PART)\s+([A-D1-4])\b[\s\.:\)-]*(.*)$".to_string()
}

fn default_header_band() -> f32 {
    0.06
}

fn default_footer_band() -> f32 {
    0.06
}

fn default_left_margin_tolerance() -> f32 {
    36.0
}

fn default_max_missing_starts() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationConfig {
    /// Documents with more pages than this are split with model assistance
    #[serde(default = "default_llm_split_page_threshold")]
    pub llm_split_page_threshold: usize,
    /// Pages per model window
    #[serde(default = "default_llm_window_pages")]
    pub llm_window_pages: usize,
    /// Pages shared by consecutive windows so no boundary is cut blind
    #[serde(default = "default_llm_window_overlap")]
    pub llm_window_overlap: usize,
    /// Regexes whose first capture group is the question number
    #[serde(default = "default_question_start_patterns")]
    pub question_start_patterns: Vec<String>,
    /// Regexes with two capture groups (first and last question) for shared passages
    #[serde(default = "default_shared_context_patterns")]
    pub shared_context_patterns: Vec<String>,
    #[serde(default = "default_choice_marker_pattern")]
    pub choice_marker_pattern: String,
    /// Letter alone on a line: an image-only choice
    #[serde(default = "default_bare_choice_pattern")]
    pub bare_choice_pattern: String,
    #[serde(default = "default_part_pattern")]
    pub part_pattern: String,
    /// Fraction of page height treated as running header
    #[serde(default = "default_header_band")]
    pub header_band: f32,
    /// Fraction of page height treated as running footer
    #[serde(default = "default_footer_band")]
    pub footer_band: f32,
    /// How far right of the page's leftmost text a question number may start (points)
    #[serde(default = "default_left_margin_tolerance")]
    pub left_margin_tolerance: f32,
    /// Consecutive question numbers that may be unreadable between two detected starts
    #[serde(default = "default_max_missing_starts")]
    pub max_missing_starts: u32,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            llm_split_page_threshold: default_llm_split_page_threshold(),
            llm_window_pages: default_llm_window_pages(),
            llm_window_overlap: default_llm_window_overlap(),
            question_start_patterns: default_question_start_patterns(),
            shared_context_patterns: default_shared_context_patterns(),
            choice_marker_pattern: default_choice_marker_pattern(),
            bare_choice_pattern: default_bare_choice_pattern(),
            part_pattern: default_part_pattern(),
            header_band: default_header_band(),
            footer_band: default_footer_band(),
            left_margin_tolerance: default_left_margin_tolerance(),
            max_missing_starts: default_max_missing_starts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialClusteringConfig {
    /// Minimum line height in points
    pub min_line_height: f32,
    /// Gap between lines, as a multiple of line height, that starts a new block
    pub vertical_gap_threshold_multiplier: f32,
    /// Left-edge difference (points) beyond which lines do not share a block
    pub horizontal_alignment_tolerance: f32,
    /// Fraction of line height two spans may differ vertically and share a line
    pub line_grouping_tolerance: f32,
}

impl Default for SpatialClusteringConfig {
    fn default() -> Self {
        Self {
            min_line_height: 8.0,                   // Minimum line height in points
            vertical_gap_threshold_multiplier: 0.8, // 80% of line height = block break
            horizontal_alignment_tolerance: 40.0,   // Indented choices stay with their stem
            line_grouping_tolerance: 0.5,           // Half a line height for same line
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    /// Name of the check
    pub name: String,
    /// Whether this check is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl CheckConfig {
    fn enabled(name: &str) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
        }
    }
}

fn default_checks() -> Vec<CheckConfig> {
    vec![
        CheckConfig::enabled("BoundingBoxes"),
        CheckConfig::enabled("StemPresent"),
        CheckConfig::enabled("ChoicesComplete"),
        CheckConfig::enabled("NoContamination"),
        CheckConfig::enabled("NoInternalSplit"),
        CheckConfig::enabled("NumberingContinuous"),
        CheckConfig::enabled("SharedContextResolved"),
        CheckConfig::enabled("MultiPartComplete"),
    ]
}

fn default_min_stem_chars() -> usize {
    3
}

fn default_min_choices() -> usize {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Checks to run, in order
    #[serde(default = "default_checks")]
    pub checks: Vec<CheckConfig>,
    #[serde(default = "default_min_stem_chars")]
    pub min_stem_chars: usize,
    /// Fewer labelled choices than this and the question is not treated as multiple choice
    #[serde(default = "default_min_choices")]
    pub min_choices: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            checks: default_checks(),
            min_stem_chars: default_min_stem_chars(),
            min_choices: default_min_choices(),
        }
    }
}

fn default_multi_part_patterns() -> Vec<String> {
    vec![
        // letter kept case-sensitive so "parte a la" does not count
        r"\b(?i:part(?:e)?)\s+[A-D]\b".to_string(),
        r"(?i)\blabel\s+each\s+part\b".to_string(),
        r"(?i)\b(?:identify|identifica|rotula)\b".to_string(),
        // "a) Explain ...", "b) Describe ..."
        r"(?im)^\s*[a-d]\)\s+(?:explain|describe|identify|label|calculate|write|explica|describe|calcula|escribe)\b".to_string(),
    ]
}

fn default_prompt_visual_patterns() -> Vec<String> {
    vec![
        r"(?i)\bshown\s+(?:above|below|here|in\s+the\s+(?:figure|diagram|graph|table|image))\b".to_string(),
        r"(?i)\bin\s+the\s+(?:diagram|figure|graph|table|image|map|picture)\b".to_string(),
        r"(?i)\b(?:the|this)\s+(?:diagram|figure|graph|map|table)\s+(?:below|above)\b".to_string(),
        r"(?i)\b(?:en\s+la|la\s+siguiente)\s+(?:figura|imagen|tabla|gráfica|gráfico)\b".to_string(),
        r"(?i)\b(?:el\s+siguiente|en\s+el)\s+(?:diagrama|gráfico|mapa|esquema)\b".to_string(),
        r"(?i)\b(?:se\s+muestra|que\s+se\s+muestra|muestra\s+la\s+figura)\b".to_string(),
    ]
}

fn default_choice_question_patterns() -> Vec<String> {
    vec![
        r"(?i)\bwhich\s+of\s+the\s+following\s+(?:best\s+)?(?:shows|represents|illustrates|models|depicts)\b".to_string(),
        r"(?i)\bwhich\s+(?:diagram|figure|image|model|graph|picture|drawing)\s+(?:best\s+)?(?:shows|represents|illustrates|models|depicts)\b".to_string(),
        r"(?i)\b(?:cuál|cual|qué|que)\s+(?:de\s+los\s+siguientes\s+)?(?:diagrama|figura|imagen|modelo|gráfico|dibujo)s?\s+(?:representa|muestra|ilustra)\b".to_string(),
    ]
}

fn default_option_patterns() -> Vec<String> {
    vec![
        // "A. text", "A) text", "A: text" with at least a few characters of content
        r"(?m)^\s*\(?[A-E][\.\):]\s+\S.{2,}".to_string(),
        // table header rows such as "A Reactants Products"
        r"(?m)^\s*[A-E]\s+[A-Z][a-z]+\s+[A-Z][a-z]+".to_string(),
    ]
}

fn default_min_option_matches() -> usize {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_multi_part_patterns")]
    pub multi_part_patterns: Vec<String>,
    #[serde(default = "default_prompt_visual_patterns")]
    pub prompt_visual_patterns: Vec<String>,
    #[serde(default = "default_choice_question_patterns")]
    pub choice_question_patterns: Vec<String>,
    #[serde(default = "default_option_patterns")]
    pub option_patterns: Vec<String>,
    /// Independent option-structure matches required
    #[serde(default = "default_min_option_matches")]
    pub min_option_matches: usize,
    /// Manual decisions keyed by question id ("Q12": true)
    #[serde(default)]
    pub overrides: BTreeMap<String, bool>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            multi_part_patterns: default_multi_part_patterns(),
            prompt_visual_patterns: default_prompt_visual_patterns(),
            choice_question_patterns: default_choice_question_patterns(),
            option_patterns: default_option_patterns(),
            min_option_matches: default_min_option_matches(),
            overrides: BTreeMap::new(),
        }
    }
}

fn default_scale() -> f32 {
    2.0
}

fn default_fallback_scales() -> Vec<f32> {
    vec![1.5, 1.0, 0.75]
}

fn default_max_pixels() -> u64 {
    40_000_000
}

fn default_region_margin() -> f32 {
    4.0
}

fn default_placeholder_width() -> u32 {
    400
}

fn default_placeholder_height() -> u32 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderingConfig {
    #[serde(default = "default_scale")]
    pub scale: f32,
    /// Tried in order after a size/complexity failure at `scale`
    #[serde(default = "default_fallback_scales")]
    pub fallback_scales: Vec<f32>,
    /// Pixel budget per raster; above it the backend reports the page as too complex
    #[serde(default = "default_max_pixels")]
    pub max_pixels: u64,
    /// Points added around every cropped region
    #[serde(default = "default_region_margin")]
    pub region_margin: f32,
    #[serde(default = "default_placeholder_width")]
    pub placeholder_width: u32,
    #[serde(default = "default_placeholder_height")]
    pub placeholder_height: u32,
}

impl Default for RenderingConfig {
    fn default() -> Self {
        Self {
            scale: default_scale(),
            fallback_scales: default_fallback_scales(),
            max_pixels: default_max_pixels(),
            region_margin: default_region_margin(),
            placeholder_width: default_placeholder_width(),
            placeholder_height: default_placeholder_height(),
        }
    }
}

fn default_title_prefix() -> String {
    "Pregunta".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Embed per-choice feedback when a feedback source provides it
    #[serde(default = "default_true")]
    pub include_feedback: bool,
    #[serde(default = "default_title_prefix")]
    pub title_prefix: String,
    #[serde(default)]
    pub shuffle: bool,
    /// Write items even when the answer key has no entry (no correct response)
    #[serde(default)]
    pub allow_missing_answer: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            include_feedback: true,
            title_prefix: default_title_prefix(),
            shuffle: false,
            allow_missing_answer: false,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_workers() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub segmentation: SegmentationConfig,
    #[serde(default)]
    pub spatial_clustering: SpatialClusteringConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub rendering: RenderingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Questions processed in parallel
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            segmentation: SegmentationConfig::default(),
            spatial_clustering: SpatialClusteringConfig::default(),
            validation: ValidationConfig::default(),
            classifier: ClassifierConfig::default(),
            rendering: RenderingConfig::default(),
            generation: GenerationConfig::default(),
            retry: RetryConfig::default(),
            workers: default_workers(),
        }
    }
}

impl PipelineConfig {
    /// Load config from a YAML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: PipelineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Load config with fallback to default
    pub fn load_with_fallback(path: Option<&Path>) -> Self {
        match path {
            Some(p) => Self::load_from_file(p).unwrap_or_else(|e| {
                log::warn!("⚠️  Failed to load config from {}, using defaults: {:#}", p.display(), e);
                Self::default()
            }),
            None => Self::default(),
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let yaml = r#"
segmentation:
  llm_split_page_threshold: 10
rendering:
  scale: 3.0
classifier:
  overrides:
    Q4: true
"#;
        let config: PipelineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.segmentation.llm_split_page_threshold, 10);
        assert_eq!(config.segmentation.llm_window_pages, 8);
        assert_eq!(config.rendering.scale, 3.0);
        assert_eq!(config.rendering.fallback_scales, vec![1.5, 1.0, 0.75]);
        assert_eq!(config.classifier.min_option_matches, 2);
        assert_eq!(config.classifier.overrides.get("Q4"), Some(&true));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.validation.checks.len(), 8);
        assert_eq!(config.segmentation.max_missing_starts, 2);
    }

    #[test]
    fn fallback_on_unreadable_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "segmentation: [not, a, map]").unwrap();
        let config = PipelineConfig::load_with_fallback(Some(file.path()));
        assert_eq!(config.segmentation.llm_split_page_threshold, 40);
    }

    #[test]
    fn yaml_round_trip_of_defaults() {
        let yaml = PipelineConfig::default().to_yaml().unwrap();
        let back: PipelineConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.workers, 4);
        assert_eq!(back.generation.title_prefix, "Pregunta");
    }
}
