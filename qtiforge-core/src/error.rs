//! Error types at the collaborator seams.
//!
//! Orchestration code uses `anyhow::Result`; the enums below are for the
//! places where callers branch on the kind of failure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    /// The page is too large or too complex at this scale.
    #[error("page {page} too complex to render at scale {scale}: {reason}")]
    TooComplex { page: u32, scale: f32, reason: String },

    #[error("page {page} is out of range (document has {page_count} pages)")]
    PageOutOfRange { page: u32, page_count: usize },

    #[error("render backend failed: {0}")]
    Backend(String),
}

impl RenderError {
    /// Only size/complexity failures are worth retrying at a smaller scale.
    pub fn is_size_related(&self) -> bool {
        matches!(self, RenderError::TooComplex { .. })
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// The store refused this particular object. Retrying will not help.
    #[error("storage rejected '{name}': {reason}")]
    Rejected { name: String, reason: String },

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage unreachable after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_) | StorageError::Io(_))
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("transient model failure: {0}")]
    Transient(String),

    #[error("model returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("model unreachable after {attempts} attempts: {last}")]
    Unreachable { attempts: u32, last: String },
}

impl ModelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ModelError::Transient(_))
    }
}

/// Failure of one question during generation.
#[derive(Debug, Error)]
pub enum QuestionError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("no answer key entry for question {0}")]
    MissingAnswer(u32),

    #[error("answer key letter {letter} is not among the choices of question {question}")]
    AnswerOutOfRange { question: u32, letter: char },

    #[error("assembled XML failed to parse: {0}")]
    MalformedXml(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl QuestionError {
    /// Errors that mean a shared collaborator is gone and the batch must stop.
    pub fn halts_batch(&self) -> bool {
        matches!(
            self,
            QuestionError::Storage(StorageError::RetriesExhausted { .. })
                | QuestionError::Model(ModelError::Unreachable { .. })
        )
    }
}
