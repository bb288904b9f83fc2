//! Error types shared across the daemon.

use std::time::Duration;
use thiserror::Error;
use vibecheck_core::scanner::IngestError;
use vibecheck_core::TransitionError;

/// Classified failure of one provider attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    /// Missing credential or a resource that could not be constructed.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("remote error: {0}")]
    RemoteError(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl CapabilityError {
    /// Short machine-readable kind, used in logs and audit rows.
    pub fn kind(&self) -> &'static str {
        match self {
            CapabilityError::Unavailable(_) => "unavailable",
            CapabilityError::Timeout(_) => "timeout",
            CapabilityError::RemoteError(_) => "remote_error",
            CapabilityError::InvalidResponse(_) => "invalid_response",
        }
    }
}

/// Storage failures. Never propagated out of a pipeline run.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("edge {edge} references missing node {node}")]
    MissingEndpoint { edge: String, node: String },

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Fatal to the whole run.
    #[error("{0}")]
    CloneFailure(String),

    #[error("stage {stage} failed: {message}")]
    StageFailure { stage: &'static str, message: String },

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("analysis {0} is already running")]
    AlreadyRunning(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error("metadata ingestion failed: {0}")]
    Ingest(#[from] IngestError),
}

impl PipelineError {
    pub fn stage(stage: &'static str, message: impl Into<String>) -> Self {
        PipelineError::StageFailure {
            stage,
            message: message.into(),
        }
    }
}
