use thiserror::Error;
use uuid::Uuid;

use crate::judgment::JudgmentError;

#[derive(Error, Debug)]
pub enum DedupError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Embedding service error: {0}")]
    Embedding(#[source] anyhow::Error),

    #[error("Judgment service error: {0}")]
    Judgment(#[from] JudgmentError),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invariant violation: {message}")]
    InvariantViolation { message: String },

    #[error("Deliberation {deliberation_id} is already being deduplicated")]
    ScopeBusy { deliberation_id: i64 },

    #[error("Operation timeout: {message}")]
    OperationTimeout { message: String },

    /// `retryable` carries over whether the underlying error was transient.
    #[error("Cluster {cluster_index} failed: {message}")]
    ClusterFailed {
        cluster_index: usize,
        message: String,
        retryable: bool,
    },

    #[error("Job {job_id} is no longer leased by this worker")]
    LeaseLost { job_id: Uuid },

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl DedupError {
    pub fn invariant(message: impl Into<String>) -> Self {
        DedupError::InvariantViolation {
            message: message.into(),
        }
    }

    /// Errors the job layer should retry with backoff rather than record as
    /// a permanent failure.
    pub fn is_transient(&self) -> bool {
        match self {
            DedupError::Database(_)
            | DedupError::Embedding(_)
            | DedupError::OperationTimeout { .. }
            | DedupError::ScopeBusy { .. } => true,
            DedupError::ClusterFailed { retryable, .. } => *retryable,
            DedupError::Judgment(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, DedupError>;
