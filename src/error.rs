//! Error types for flowforge operations.
//!
//! Defines error types for the major subsystems:
//! - Task classification
//! - Workflow composition
//! - Stage execution
//! - Checkpoint persistence
//! - LLM and search collaborators
//! - Orchestrator control flow

use thiserror::Error;

use crate::state::Decision;

/// Errors that can occur while building the task classifier.
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("Invalid classification pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Errors that can occur during workflow composition.
#[derive(Debug, Error)]
pub enum ComposeError {
    /// The classifier produced a task type the composition table does not
    /// know about. Always a configuration bug, never retried.
    #[error("Unknown task type '{0}': no workflow registered in the composition table")]
    UnknownTaskType(String),

    #[error("Workflow for '{task_type}' references stage '{stage}' which has no registered implementation")]
    MissingStageImplementation { task_type: String, stage: String },

    #[error("Workflow for '{task_type}' declares checkpoint on unknown stage '{stage}'")]
    UnknownCheckpointStage { task_type: String, stage: String },

    #[error("Checkpoint on stage '{stage}' has an empty allowed-decisions set")]
    EmptyAllowedDecisions { stage: String },

    #[error("Field '{field}' is written by both '{first}' and '{second}'")]
    DuplicateOutputField {
        field: String,
        first: String,
        second: String,
    },
}

/// Errors that can occur during a single stage execution.
///
/// These are transient from the orchestrator's point of view: the stage is
/// retried with backoff before the whole execution is failed.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Generation service error: {0}")]
    Generation(#[from] LlmError),

    #[error("Search service error: {0}")]
    Search(#[from] SearchError),

    #[error("Stage '{stage}' timed out after {seconds}s")]
    Timeout { stage: String, seconds: u64 },

    #[error("Stage '{stage}' requires input field '{field}' which is not present")]
    MissingInput { stage: String, field: String },

    #[error("Stage '{stage}' produced invalid output: {reason}")]
    InvalidOutput { stage: String, reason: String },
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API base URL: FLOWFORGE_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Empty completion: the model returned no choices")]
    EmptyCompletion,
}

/// Errors that can occur during search/ingestion operations.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Search backend error: {0}")]
    Backend(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Ingestion failed for '{path}': {reason}")]
    IngestFailed { path: String, reason: String },
}

/// Errors that can occur during checkpoint persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No state is stored under the requested thread id.
    #[error("Thread '{0}' not found")]
    NotFound(String),

    #[error("Invalid thread id '{0}': only alphanumeric characters, hyphens, and underscores are allowed")]
    InvalidThreadId(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the orchestrator to external callers.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Composition error: {0}")]
    Compose(#[from] ComposeError),

    #[error("Persistence error: {0}")]
    Store(#[from] StoreError),

    /// The supplied decision is not permitted at the pending checkpoint.
    /// Execution state is left untouched; the caller must retry with one of
    /// the allowed decisions.
    #[error("Decision '{got}' is not allowed at checkpoint '{checkpoint}' (allowed: {allowed:?})")]
    InvalidDecision {
        checkpoint: String,
        got: Decision,
        allowed: Vec<Decision>,
    },

    /// `resume` was called on a thread that is not suspended.
    #[error("Thread '{thread_id}' has no pending checkpoint to resume")]
    NoPendingInterrupt { thread_id: String },

    /// `resume` or `execute` was called on a thread that already finished.
    #[error("Thread '{thread_id}' already finished with status '{status}'")]
    ThreadFinished { thread_id: String, status: String },
}
