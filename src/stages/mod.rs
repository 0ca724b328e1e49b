//! Stage contracts and the stage registry.
//!
//! A [`Stage`] is one pluggable processing step. The orchestrator hands it
//! the declared subset of accumulated fields and merges whatever it returns
//! back into execution state. Implementations are registered per
//! [`StageKind`] in a [`StageRegistry`] constructed once per process and
//! passed by reference into the orchestrator; there are no hidden globals.

pub mod query_analysis;
pub mod quality_assess;
pub mod rerank;
pub mod retrieval;
pub mod synthesize;

pub use query_analysis::QueryAnalysisStage;
pub use quality_assess::QualityAssessStage;
pub use rerank::{rerank, RankedDocument, ReRankStage};
pub use retrieval::RetrievalStage;
pub use synthesize::SynthesizeStage;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::classifier::TaskType;
use crate::error::StageError;
use crate::llm::GenerationService;
use crate::search::SearchService;
use crate::workflow::{StageKind, Thresholds};

/// Input handed to a stage: the task context plus the declared field subset.
#[derive(Debug, Clone)]
pub struct StageInput {
    /// Name of the stage being run, for error attribution.
    pub stage: String,
    /// The raw request text.
    pub query: String,
    /// The classified task type.
    pub task_type: TaskType,
    /// The declared input fields, copied from execution state.
    pub fields: Map<String, Value>,
    /// Workflow thresholds (retrieval width, result caps).
    pub thresholds: Thresholds,
}

impl StageInput {
    /// A field as a JSON array.
    ///
    /// # Errors
    ///
    /// Returns `MissingInput` if the field is absent or not an array.
    pub fn require_array(&self, name: &str) -> Result<&Vec<Value>, StageError> {
        self.fields
            .get(name)
            .and_then(|v| v.as_array())
            .ok_or_else(|| StageError::MissingInput {
                stage: self.stage.clone(),
                field: name.to_string(),
            })
    }

    /// A field as a string, if present.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_str())
    }

    /// A string-array field, skipping non-string entries.
    pub fn string_list(&self, name: &str) -> Vec<String> {
        self.fields
            .get(name)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Fields produced by a stage run, merged into execution state by the
/// orchestrator according to the stage's declared output specs.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    pub fields: Map<String, Value>,
}

impl StageOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// One pluggable processing stage.
#[async_trait]
pub trait Stage: Send + Sync {
    /// The stage kind this implementation serves.
    fn kind(&self) -> StageKind;

    /// Runs the stage. Errors are transient from the orchestrator's point
    /// of view and retried with backoff.
    async fn run(&self, input: &StageInput) -> Result<StageOutput, StageError>;
}

/// Holds the stage implementations for one pipeline process.
#[derive(Default)]
pub struct StageRegistry {
    stages: HashMap<StageKind, Arc<dyn Stage>>,
}

impl StageRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the default implementation set over the given collaborators.
    pub fn with_defaults(
        generation: Arc<dyn GenerationService>,
        search: Arc<dyn SearchService>,
        temperature: f64,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(QueryAnalysisStage::new(Arc::clone(&generation))));
        registry.register(Arc::new(RetrievalStage::new(search)));
        registry.register(Arc::new(ReRankStage::new()));
        registry.register(Arc::new(QualityAssessStage::new()));
        registry.register(Arc::new(SynthesizeStage::new(generation, temperature)));
        registry
    }

    /// Registers a stage implementation, replacing any prior one of the
    /// same kind.
    pub fn register(&mut self, stage: Arc<dyn Stage>) {
        self.stages.insert(stage.kind(), stage);
    }

    /// Looks up the implementation for a kind.
    pub fn get(&self, kind: StageKind) -> Option<Arc<dyn Stage>> {
        self.stages.get(&kind).cloned()
    }

    /// Whether an implementation is registered for the kind.
    pub fn contains(&self, kind: StageKind) -> bool {
        self.stages.contains_key(&kind)
    }
}
