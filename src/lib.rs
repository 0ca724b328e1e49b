//! flowforge: Task-adaptive pipeline orchestrator with resumable checkpoints.
//!
//! This library classifies natural-language requests into task types,
//! composes task-specific retrieval pipelines, and runs them as resumable
//! state machines with quality gates and human-in-the-loop checkpoints.

// Core modules
pub mod classifier;
pub mod cli;
pub mod config;
pub mod error;
pub mod gate;
pub mod llm;
pub mod orchestrator;
pub mod search;
pub mod stages;
pub mod state;
pub mod store;
pub mod workflow;

// Re-export commonly used error types
pub use error::{
    ClassifierError, ComposeError, LlmError, OrchestratorError, SearchError, StageError,
    StoreError,
};

// Re-export the caller-facing surface
pub use classifier::{TaskClassifier, TaskType};
pub use config::PipelineConfig;
pub use orchestrator::{ExecuteRequest, Orchestrator};
pub use state::{HumanDecision, PipelineResult, PipelineStatus, StateSummary};
