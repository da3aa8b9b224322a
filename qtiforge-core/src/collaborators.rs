//! External collaborators consumed through traits: the structured-JSON model
//! call, AI visual analysis and per-choice feedback.

use crate::error::ModelError;
use crate::retry::{RetryFailure, RetryPolicy};
use crate::types::{ChoiceLetter, QuestionChunk, VisualAnalysis};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Text plus PNG images, answered with JSON.
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    pub instruction: String,
    pub text: String,
    pub images: Vec<Vec<u8>>,
}

pub trait ModelClient: Send + Sync {
    fn ask_json(&self, request: &ModelRequest) -> Result<serde_json::Value, ModelError>;
}

#[derive(Serialize)]
struct WireRequest<'a> {
    instruction: &'a str,
    text: &'a str,
    images: Vec<String>,
    response_format: &'static str,
}

/// Extract the JSON payload from a reply that may wrap it in a `content`
/// string, possibly inside a markdown code fence.
pub fn unwrap_model_reply(reply: serde_json::Value) -> Result<serde_json::Value, ModelError> {
    let content = match reply {
        serde_json::Value::String(s) => s,
        serde_json::Value::Object(mut map) => match map.remove("content") {
            Some(serde_json::Value::String(s)) => s,
            Some(other) => return Ok(other),
            None => return Ok(serde_json::Value::Object(map)),
        },
        other => return Ok(other),
    };

    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim()).map_err(|e| ModelError::InvalidResponse(format!("reply is not JSON: {}", e)))
}

/// Posts requests to a JSON endpoint; images travel base64-encoded.
pub struct HttpModelClient {
    agent: ureq::Agent,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpModelClient {
    pub fn new(endpoint: &str, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            endpoint: endpoint.to_string(),
            api_key,
        }
    }
}

impl ModelClient for HttpModelClient {
    fn ask_json(&self, request: &ModelRequest) -> Result<serde_json::Value, ModelError> {
        let body = WireRequest {
            instruction: &request.instruction,
            text: &request.text,
            images: request.images.iter().map(|png| BASE64.encode(png)).collect(),
            response_format: "json",
        };
        let mut call = self.agent.post(&self.endpoint);
        if let Some(key) = &self.api_key {
            call = call.set("Authorization", &format!("Bearer {}", key));
        }

        let response = match call.send_json(&body) {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) if code == 429 || code >= 500 => {
                return Err(ModelError::Transient(format!("{} {}", code, response.status_text())))
            }
            Err(ureq::Error::Status(code, response)) => {
                return Err(ModelError::InvalidResponse(format!("{} {}", code, response.status_text())))
            }
            Err(ureq::Error::Transport(transport)) => return Err(ModelError::Transient(transport.to_string())),
        };

        let reply: serde_json::Value = response
            .into_json()
            .map_err(|e| ModelError::InvalidResponse(format!("unreadable body: {}", e)))?;
        unwrap_model_reply(reply)
    }
}

pub struct RetryingModelClient<M> {
    inner: M,
    policy: RetryPolicy,
}

impl<M: ModelClient> RetryingModelClient<M> {
    pub fn new(inner: M, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl<M: ModelClient> ModelClient for RetryingModelClient<M> {
    fn ask_json(&self, request: &ModelRequest) -> Result<serde_json::Value, ModelError> {
        self.policy
            .run("model request", || self.inner.ask_json(request), ModelError::is_transient)
            .map_err(|failure| match failure {
                RetryFailure::Permanent(e) => e,
                RetryFailure::Exhausted { attempts, last } => ModelError::Unreachable {
                    attempts,
                    last: last.to_string(),
                },
            })
    }
}

impl<T: ModelClient + ?Sized> ModelClient for Arc<T> {
    fn ask_json(&self, request: &ModelRequest) -> Result<serde_json::Value, ModelError> {
        (**self).ask_json(request)
    }
}

// ===== VISUAL ANALYSIS =====

/// AI layout analysis of one question: block categories and choice regions.
pub trait VisualAnalysisSource: Send + Sync {
    /// `images` are the rendered regions of the chunk, in region order.
    fn analyze(&self, chunk: &QuestionChunk, images: &[Vec<u8>]) -> Result<Option<VisualAnalysis>, ModelError>;

    /// Whether `analyze` looks at the rendered regions at all.
    fn wants_images(&self) -> bool {
        true
    }
}

/// Reads `{dir}/{question_id}.json`; a missing file means no analysis.
pub struct PrecomputedAnalysis {
    dir: PathBuf,
}

impl PrecomputedAnalysis {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self { dir: dir.as_ref().to_path_buf() }
    }
}

impl VisualAnalysisSource for PrecomputedAnalysis {
    fn analyze(&self, chunk: &QuestionChunk, _images: &[Vec<u8>]) -> Result<Option<VisualAnalysis>, ModelError> {
        let path = self.dir.join(format!("{}.json", chunk.id));
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ModelError::InvalidResponse(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| ModelError::InvalidResponse(format!("{}: {}", path.display(), e)))
    }

    fn wants_images(&self) -> bool {
        false
    }
}

const ANALYSIS_INSTRUCTION: &str = "Classify the blocks of this exam question. Reply with JSON only: \
{\"blocks\": [{\"block\": <index>, \"category\": \"question_text|prompt_visual|choice_visual|choice_text|shared_passage|decorative\"}], \
\"choice_regions\": [{\"letter\": \"A\", \"page\": <int>, \"bbox\": {\"x1\": <pt>, \"y1\": <pt>, \"x2\": <pt>, \"y2\": <pt>}}]}. \
Only give choice_regions when the answer choices are pictures, one per letter, in page points from the top-left corner.";

pub struct ModelVisualAnalysis {
    model: Arc<dyn ModelClient>,
}

impl ModelVisualAnalysis {
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self { model }
    }
}

impl VisualAnalysisSource for ModelVisualAnalysis {
    fn analyze(&self, chunk: &QuestionChunk, images: &[Vec<u8>]) -> Result<Option<VisualAnalysis>, ModelError> {
        let request = ModelRequest {
            instruction: ANALYSIS_INSTRUCTION.to_string(),
            text: chunk.raw_lines.join("\n"),
            images: images.to_vec(),
        };
        let value = self.model.ask_json(&request)?;
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| ModelError::InvalidResponse(format!("visual analysis for {}: {}", chunk.id, e)))
    }
}

// ===== FEEDBACK =====

pub type ChoiceFeedback = BTreeMap<ChoiceLetter, String>;

pub trait FeedbackSource: Send + Sync {
    fn feedback(&self, chunk: &QuestionChunk) -> Result<Option<ChoiceFeedback>, ModelError>;
}

/// One JSON file for the whole exam: `{"Q1": {"A": "...", "B": "..."}}`.
pub struct FileFeedbackSource {
    entries: BTreeMap<String, ChoiceFeedback>,
}

impl FileFeedbackSource {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let content = std::fs::read_to_string(path).with_context(|| format!("reading feedback {}", path.display()))?;
        let entries = serde_json::from_str(&content).with_context(|| format!("parsing feedback {}", path.display()))?;
        Ok(Self { entries })
    }

    pub fn from_entries(entries: BTreeMap<String, ChoiceFeedback>) -> Self {
        Self { entries }
    }
}

impl FeedbackSource for FileFeedbackSource {
    fn feedback(&self, chunk: &QuestionChunk) -> Result<Option<ChoiceFeedback>, ModelError> {
        Ok(self.entries.get(&chunk.id).cloned())
    }
}

const FEEDBACK_INSTRUCTION: &str = "Write one sentence of feedback for each answer choice of this exam question, \
explaining why it is right or wrong. Reply with JSON only: {\"A\": \"...\", \"B\": \"...\"}, one key per choice letter.";

pub struct ModelFeedbackSource {
    model: Arc<dyn ModelClient>,
}

impl ModelFeedbackSource {
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self { model }
    }
}

#[derive(Deserialize)]
#[serde(transparent)]
struct FeedbackReply(BTreeMap<ChoiceLetter, String>);

impl FeedbackSource for ModelFeedbackSource {
    fn feedback(&self, chunk: &QuestionChunk) -> Result<Option<ChoiceFeedback>, ModelError> {
        if chunk.content.choices.is_empty() {
            return Ok(None);
        }
        let request = ModelRequest {
            instruction: FEEDBACK_INSTRUCTION.to_string(),
            text: chunk.full_text(),
            images: Vec::new(),
        };
        let value = self.model.ask_json(&request)?;
        let FeedbackReply(map) = serde_json::from_value(value)
            .map_err(|e| ModelError::InvalidResponse(format!("feedback for {}: {}", chunk.id, e)))?;
        Ok(Some(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyModel {
        failures: AtomicU32,
    }

    impl ModelClient for FlakyModel {
        fn ask_json(&self, _request: &ModelRequest) -> Result<serde_json::Value, ModelError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ModelError::Transient("overloaded".into()));
            }
            Ok(json!({"ok": true}))
        }
    }

    #[test]
    fn fenced_string_replies_are_unwrapped() {
        let reply = json!({"content": "```json\n{\"questions\": []}\n```"});
        assert_eq!(unwrap_model_reply(reply).unwrap(), json!({"questions": []}));
        assert_eq!(unwrap_model_reply(json!({"a": 1})).unwrap(), json!({"a": 1}));
        assert!(unwrap_model_reply(json!({"content": "not json"})).is_err());
    }

    #[test]
    fn retrying_client_escalates_to_unreachable() {
        let client = RetryingModelClient::new(
            FlakyModel { failures: AtomicU32::new(10) },
            RetryPolicy::immediate(3),
        );
        let err = client.ask_json(&ModelRequest::default()).unwrap_err();
        assert!(matches!(err, ModelError::Unreachable { attempts: 3, .. }));

        let client = RetryingModelClient::new(
            FlakyModel { failures: AtomicU32::new(2) },
            RetryPolicy::immediate(3),
        );
        assert_eq!(client.ask_json(&ModelRequest::default()).unwrap(), json!({"ok": true}));
    }

    #[test]
    fn feedback_file_maps_letters() {
        let json = r#"{"Q3": {"A": "Revisa el signo.", "B": "Correcto."}}"#;
        let entries: BTreeMap<String, ChoiceFeedback> = serde_json::from_str(json).unwrap();
        let source = FileFeedbackSource::from_entries(entries);
        let chunk = QuestionChunk {
            id: "Q3".into(),
            question_number: 3,
            position: 0,
            regions: vec![],
            content: Default::default(),
            images: vec![],
            raw_lines: vec![],
            shared_context_id: None,
            declared_choice_count: None,
            declared_part_count: None,
        };
        let feedback = source.feedback(&chunk).unwrap().unwrap();
        assert_eq!(feedback.get(&ChoiceLetter::B).map(String::as_str), Some("Correcto."));
    }

    #[test]
    fn precomputed_analysis_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("Q1.json"),
            r#"{"blocks": [{"block": 0, "category": "choice_visual"}]}"#,
        )
        .unwrap();
        let source = PrecomputedAnalysis::new(dir.path());
        let mut chunk = QuestionChunk {
            id: "Q1".into(),
            question_number: 1,
            position: 0,
            regions: vec![],
            content: Default::default(),
            images: vec![],
            raw_lines: vec![],
            shared_context_id: None,
            declared_choice_count: None,
            declared_part_count: None,
        };
        let analysis = source.analyze(&chunk, &[]).unwrap().unwrap();
        assert_eq!(analysis.blocks.len(), 1);

        chunk.id = "Q2".into();
        assert!(source.analyze(&chunk, &[]).unwrap().is_none());
    }
}
