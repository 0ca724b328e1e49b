//! Workflow definitions: what a pipeline for a given task type looks like.
//!
//! A [`WorkflowDefinition`] is the single source of truth for a task type's
//! stage sequence, checkpoint placement, and quality thresholds. Definitions
//! are composed once per task type by the [`composer::WorkflowComposer`]
//! static table and never mutated at runtime.

pub mod composer;

pub use composer::WorkflowComposer;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::classifier::TaskType;
use crate::error::ComposeError;
use crate::state::Decision;

/// Canonical stage names used across the composition table.
pub mod stage_names {
    pub const QUERY_ANALYSIS: &str = "query_analysis";
    pub const RETRIEVAL: &str = "retrieval";
    pub const RERANK: &str = "rerank";
    pub const QUALITY_ASSESS: &str = "quality_assess";
    pub const SYNTHESIZE: &str = "synthesize";
}

/// The kind of processing a stage performs. Stage implementations are
/// registered per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    QueryAnalysis,
    Retrieval,
    ReRank,
    QualityAssess,
    Synthesize,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageKind::QueryAnalysis => write!(f, "query-analysis"),
            StageKind::Retrieval => write!(f, "retrieval"),
            StageKind::ReRank => write!(f, "rerank"),
            StageKind::QualityAssess => write!(f, "quality-assess"),
            StageKind::Synthesize => write!(f, "synthesize"),
        }
    }
}

/// How a stage output is folded into `ExecutionState.fields`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// Replace the field wholesale.
    Overwrite,
    /// Concatenate onto an existing JSON array.
    Append,
}

/// A single declared output field with its merge strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: String,
    pub merge: MergeStrategy,
}

impl OutputSpec {
    pub fn overwrite(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            merge: MergeStrategy::Overwrite,
        }
    }

    pub fn append(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            merge: MergeStrategy::Append,
        }
    }
}

/// Declares what one stage reads and writes in `ExecutionState.fields`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    /// Stage name, unique within a workflow.
    pub name: String,
    /// Which registered implementation runs this stage.
    pub kind: StageKind,
    /// Field names the stage reads. The orchestrator passes only these.
    pub inputs: Vec<String>,
    /// Fields the stage writes, with merge strategies.
    pub outputs: Vec<OutputSpec>,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            kind,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: &[&str]) -> Self {
        self.inputs = inputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<OutputSpec>) -> Self {
        self.outputs = outputs;
        self
    }
}

/// Governs what a human may do at a suspension point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSpec {
    /// Non-empty subset of `{approve, edit, reject}`.
    pub allowed_decisions: Vec<Decision>,
    /// Preview template; `{field}` placeholders are filled from
    /// `ExecutionState.fields` plus the implicit `{query}`.
    pub description_template: String,
    /// Stage to rewind to on `reject`. Defaults to the checkpointed stage.
    pub rewind_target: String,
}

impl CheckpointSpec {
    /// Full-decision checkpoint rewinding to the checkpointed stage itself.
    pub fn standard(stage: impl Into<String>, template: impl Into<String>) -> Self {
        let stage = stage.into();
        Self {
            allowed_decisions: vec![Decision::Approve, Decision::Edit, Decision::Reject],
            description_template: template.into(),
            rewind_target: stage,
        }
    }

    pub fn with_rewind_target(mut self, target: impl Into<String>) -> Self {
        self.rewind_target = target.into();
        self
    }

    pub fn with_allowed(mut self, allowed: Vec<Decision>) -> Self {
        self.allowed_decisions = allowed;
        self
    }
}

/// Numeric thresholds governing the quality gate and retry bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Minimum acceptable quality score.
    pub quality_threshold: f64,
    /// Minimum acceptable sub-topic coverage.
    pub coverage_threshold: f64,
    /// Minimum ranked-document count below which re-ranking cannot help.
    pub min_result_count: usize,
    /// Maximum documents carried into synthesis.
    pub max_results: usize,
    /// Maximum quality-driven rewinds per rewind-target stage.
    pub max_retries: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            quality_threshold: 0.6,
            coverage_threshold: 0.5,
            min_result_count: 3,
            max_results: 10,
            max_retries: 2,
        }
    }
}

/// The composed pipeline for one task type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub task_type: TaskType,
    /// Ordered stage list; execution proceeds front to back.
    pub stages: Vec<StageSpec>,
    /// Checkpoints keyed by stage name.
    pub checkpoints: HashMap<String, CheckpointSpec>,
    pub thresholds: Thresholds,
}

impl WorkflowDefinition {
    /// Index of a stage by name.
    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    /// Name of the first stage of the given kind, if present.
    pub fn stage_of_kind(&self, kind: StageKind) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.kind == kind)
    }

    /// Structural validation: checkpoints reference real stages and carry
    /// non-empty decision sets, and no field is written by two stages.
    pub fn validate(&self) -> Result<(), ComposeError> {
        let task_type = self.task_type.to_string();

        for (stage, checkpoint) in &self.checkpoints {
            if self.stage_index(stage).is_none() {
                return Err(ComposeError::UnknownCheckpointStage {
                    task_type,
                    stage: stage.clone(),
                });
            }
            if checkpoint.allowed_decisions.is_empty() {
                return Err(ComposeError::EmptyAllowedDecisions {
                    stage: stage.clone(),
                });
            }
            if self.stage_index(&checkpoint.rewind_target).is_none() {
                return Err(ComposeError::UnknownCheckpointStage {
                    task_type,
                    stage: checkpoint.rewind_target.clone(),
                });
            }
        }

        let mut writers: HashMap<&str, &str> = HashMap::new();
        for stage in &self.stages {
            for output in &stage.outputs {
                if let Some(first) = writers.insert(output.name.as_str(), stage.name.as_str()) {
                    return Err(ComposeError::DuplicateOutputField {
                        field: output.name.clone(),
                        first: first.to_string(),
                        second: stage.name.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Renders a checkpoint description template against accumulated fields.
///
/// `{query}` expands to the task's raw text; `{name}` expands to the
/// stringified field value (JSON for non-scalars). Unknown placeholders are
/// left in place so a template typo is visible rather than silent.
pub fn render_description(template: &str, query: &str, fields: &Map<String, Value>) -> String {
    let mut rendered = template.replace("{query}", query);

    for (name, value) in fields {
        let placeholder = format!("{{{}}}", name);
        if !rendered.contains(&placeholder) {
            continue;
        }
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        rendered = rendered.replace(&placeholder, &text);
    }

    rendered
}
