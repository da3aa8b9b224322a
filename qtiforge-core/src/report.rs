//! Run summary: what happened to every question, written as `summary.json`.

use crate::rendering::RenderDegradation;
use crate::types::{QuestionChunk, QuestionState, SegmentationStrategy, VisualClassification};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionOutcome {
    pub question_id: String,
    pub question_number: u32,
    pub position: usize,
    pub state: QuestionState,
    /// Every state passed through, starting at `Extracted`
    pub history: Vec<QuestionState>,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub degradations: Vec<RenderDegradation>,
    #[serde(default)]
    pub classification: Option<VisualClassification>,
    #[serde(default)]
    pub image_urls: Vec<String>,
}

impl QuestionOutcome {
    pub fn segmented(chunk: &QuestionChunk) -> Self {
        Self {
            question_id: chunk.id.clone(),
            question_number: chunk.question_number,
            position: chunk.position,
            state: QuestionState::Segmented,
            history: vec![QuestionState::Extracted, QuestionState::Segmented],
            reasons: Vec::new(),
            degradations: Vec::new(),
            classification: None,
            image_urls: Vec::new(),
        }
    }

    /// A number the exam's numbering implies but segmentation never found.
    pub fn missing(question_number: u32, position: usize) -> Self {
        Self {
            question_id: QuestionChunk::id_for(question_number),
            question_number,
            position,
            state: QuestionState::Rejected,
            history: vec![QuestionState::Extracted, QuestionState::Rejected],
            reasons: vec!["no question start found; its text is in a neighbouring chunk or the preamble".to_string()],
            degradations: Vec::new(),
            classification: None,
            image_urls: Vec::new(),
        }
    }

    pub fn advance(&mut self, next: QuestionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            bail!("{}: illegal transition {:?} → {:?}", self.question_id, self.state, next);
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Move to a terminal state with a reason.
    pub fn finish(&mut self, next: QuestionState, reason: impl Into<String>) -> Result<()> {
        self.reasons.push(reason.into());
        self.advance(next)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub quarantined: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTiming {
    pub step: String,
    pub millis: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source: String,
    pub pdf_hash: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub strategy: Option<SegmentationStrategy>,
    pub page_count: usize,
    pub counts: OutcomeCounts,
    /// Set when a shared collaborator became unreachable and the batch stopped
    pub halted: Option<String>,
    pub questions: Vec<QuestionOutcome>,
    #[serde(default)]
    pub timings: Vec<StepTiming>,
}

impl RunSummary {
    pub fn start(source: &str, pdf_hash: &str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source: source.to_string(),
            pdf_hash: pdf_hash.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            strategy: None,
            page_count: 0,
            counts: OutcomeCounts::default(),
            halted: None,
            questions: Vec::new(),
            timings: Vec::new(),
        }
    }

    /// Sort outcomes into exam order and recount.
    ///
    /// Missing questions carry the position of the chunk after them, so the
    /// question number breaks the tie.
    pub fn finish(&mut self) {
        self.questions.sort_by_key(|q| (q.position, q.question_number));
        let mut counts = OutcomeCounts::default();
        for question in &self.questions {
            match question.state {
                QuestionState::Written => counts.succeeded += 1,
                QuestionState::Failed => counts.failed += 1,
                QuestionState::Rejected => counts.quarantined += 1,
                // anything that never reached a terminal state was cut short by a halt
                _ => counts.skipped += 1,
            }
        }
        self.counts = counts;
        self.finished_at = Some(Utc::now());
    }

    pub fn outcome(&self, question_id: &str) -> Option<&QuestionOutcome> {
        self.questions.iter().find(|q| q.question_id == question_id)
    }

    pub fn log_summary(&self) {
        log::info!(
            "📊 {} questions: {} written, {} failed, {} quarantined, {} skipped",
            self.questions.len(),
            self.counts.succeeded,
            self.counts.failed,
            self.counts.quarantined,
            self.counts.skipped
        );
        if let Some(reason) = &self.halted {
            log::error!("🛑 Batch halted: {}", reason);
        }
        for question in &self.questions {
            if matches!(question.state, QuestionState::Failed | QuestionState::Skipped) {
                log::warn!("   {} {:?}: {}", question.question_id, question.state, question.reasons.join("; "));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkContent;

    fn chunk(number: u32, position: usize) -> QuestionChunk {
        QuestionChunk {
            id: QuestionChunk::id_for(number),
            question_number: number,
            position,
            regions: vec![],
            content: ChunkContent::default(),
            images: vec![],
            raw_lines: vec![],
            shared_context_id: None,
            declared_choice_count: None,
            declared_part_count: None,
        }
    }

    #[test]
    fn transitions_follow_the_lifecycle() {
        let mut outcome = QuestionOutcome::segmented(&chunk(1, 0));
        outcome.advance(QuestionState::Validated).unwrap();
        outcome.advance(QuestionState::Classified).unwrap();
        assert!(outcome.advance(QuestionState::Written).is_err());
        outcome.advance(QuestionState::Assembled).unwrap();
        outcome.advance(QuestionState::Written).unwrap();
        assert_eq!(
            outcome.history,
            vec![
                QuestionState::Extracted,
                QuestionState::Segmented,
                QuestionState::Validated,
                QuestionState::Classified,
                QuestionState::Assembled,
                QuestionState::Written
            ]
        );
    }

    #[test]
    fn counts_every_terminal_state() {
        let mut summary = RunSummary::start("exam.pdf", "abc");
        let mut written = QuestionOutcome::segmented(&chunk(2, 1));
        for state in [
            QuestionState::Validated,
            QuestionState::Classified,
            QuestionState::Assembled,
            QuestionState::Written,
        ] {
            written.advance(state).unwrap();
        }
        let mut rejected = QuestionOutcome::segmented(&chunk(1, 0));
        rejected.finish(QuestionState::Rejected, "missing choice D").unwrap();
        let mut failed = QuestionOutcome::segmented(&chunk(3, 2));
        failed.advance(QuestionState::Validated).unwrap();
        failed.advance(QuestionState::Classified).unwrap();
        failed.finish(QuestionState::Failed, "storage rejected").unwrap();
        let pending = QuestionOutcome::segmented(&chunk(4, 3));
        let missing = QuestionOutcome::missing(5, 4);
        let last = QuestionOutcome::segmented(&chunk(6, 4));

        summary.questions = vec![last, written, failed, missing, pending, rejected];
        summary.finish();
        assert_eq!(
            summary.counts,
            OutcomeCounts {
                succeeded: 1,
                failed: 1,
                quarantined: 2,
                skipped: 2
            }
        );
        assert_eq!(summary.questions[0].question_id, "Q1");
        let order: Vec<&str> = summary.questions.iter().map(|q| q.question_id.as_str()).collect();
        assert_eq!(order, vec!["Q1", "Q2", "Q3", "Q4", "Q5", "Q6"]);
        assert!(summary.finished_at.is_some());
    }
}
