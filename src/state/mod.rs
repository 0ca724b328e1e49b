//! Execution state: the single mutable entity of the pipeline.
//!
//! This module defines the core data model:
//!
//! - `Task`: one immutable record per incoming request
//! - `ExecutionState`: per-thread mutable state, owned by the checkpoint store
//! - `HumanDecision`: transient input supplied to `resume`
//! - `QualityReport` / `StageTransition`: per-stage history entries
//! - `PipelineResult` / `InterruptPayload`: values returned to callers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

use crate::classifier::TaskType;
use crate::workflow::{MergeStrategy, OutputSpec};

/// One incoming request. Immutable after classification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Unique identifier for the task.
    pub id: Uuid,
    /// The raw request text as received.
    pub raw_text: String,
    /// Task type assigned by the classifier (or forced by the caller).
    pub task_type: TaskType,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Creates a new classified task.
    pub fn new(raw_text: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            id: Uuid::new_v4(),
            raw_text: raw_text.into(),
            task_type,
            created_at: Utc::now(),
        }
    }
}

/// A decision a human may take at a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Decision {
    Approve,
    Edit,
    Reject,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Approve => write!(f, "approve"),
            Decision::Edit => write!(f, "edit"),
            Decision::Reject => write!(f, "reject"),
        }
    }
}

/// Input supplied to `resume` for a suspended thread.
///
/// Transient: folded into history, never persisted on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanDecision {
    /// The decision type.
    pub decision: Decision,
    /// Optional payload: edited fields for `edit` (a JSON object merged into
    /// `fields`), or free-text feedback for `reject`.
    #[serde(default)]
    pub payload: Option<Value>,
}

impl HumanDecision {
    pub fn approve() -> Self {
        Self {
            decision: Decision::Approve,
            payload: None,
        }
    }

    pub fn edit(fields: Value) -> Self {
        Self {
            decision: Decision::Edit,
            payload: Some(fields),
        }
    }

    pub fn reject(feedback: impl Into<String>) -> Self {
        Self {
            decision: Decision::Reject,
            payload: Some(Value::String(feedback.into())),
        }
    }
}

/// Recommendation emitted by the quality gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Recommendation {
    Continue,
    Retry,
    Reenter,
}

/// Quality evaluation attached to a stage transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityReport {
    /// Overall quality score in `[0, 1]`.
    pub score: f64,
    /// Fraction of required sub-topics addressed, in `[0, 1]`.
    pub coverage: f64,
    /// Number of ranked documents available to synthesis.
    pub result_count: usize,
    /// The gate's recommendation.
    pub recommendation: Recommendation,
}

/// Outcome of a single stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransitionStatus {
    Completed,
    Failed,
    Rewound,
    DecisionApplied,
}

/// One entry in the per-thread execution history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTransition {
    /// Name of the stage (or checkpoint) this transition records.
    pub stage: String,
    /// Attempt number for the stage, starting at 1.
    pub attempt: u32,
    /// What happened.
    pub status: TransitionStatus,
    /// When the transition was recorded.
    pub at: DateTime<Utc>,
    /// Wall-clock duration of the stage run in milliseconds.
    pub duration_ms: u64,
    /// Quality report, present only for quality-assessment stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityReport>,
    /// Free-text note (error message, rewind reason, human feedback).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A checkpoint the thread is currently suspended at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInterrupt {
    /// Name of the checkpointed stage.
    pub checkpoint_name: String,
    /// Index of the checkpointed stage in the workflow's stage list.
    pub stage_index: usize,
    /// Human-readable preview rendered from the checkpoint template.
    pub description: String,
    /// Decisions the caller may respond with. Always non-empty.
    pub allowed_decisions: Vec<Decision>,
    /// Stage to rewind to if the decision is `reject`.
    pub rewind_target: String,
    /// When the interrupt was raised; used by the TTL sweep.
    pub raised_at: DateTime<Utc>,
}

/// Lifecycle status of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreadStatus {
    Running,
    Interrupted,
    Completed,
    Failed,
}

impl std::fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadStatus::Running => write!(f, "running"),
            ThreadStatus::Interrupted => write!(f, "interrupted"),
            ThreadStatus::Completed => write!(f, "completed"),
            ThreadStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Per-thread execution state.
///
/// Exactly one exists per thread id, owned by the checkpoint store and
/// mutated only by the orchestrator (one in-flight call per thread at a
/// time). `pending_interrupt` is `Some` if and only if the last orchestrator
/// invocation ended by suspending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    /// Logical execution identifier.
    pub thread_id: String,
    /// The classified task driving this thread.
    pub task: Task,
    /// Index of the next stage to run in the workflow's stage list.
    pub current_stage_index: usize,
    /// Accumulated stage outputs, keyed by declared output field name.
    pub fields: Map<String, Value>,
    /// Quality/rewind retry counts per rewind-target stage name.
    pub retry_counts: HashMap<String, u32>,
    /// The checkpoint currently awaiting a human decision, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_interrupt: Option<PendingInterrupt>,
    /// Ordered record of every stage attempt and decision.
    pub history: Vec<StageTransition>,
    /// Lifecycle status.
    pub status: ThreadStatus,
    /// Last persistence timestamp.
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    /// Creates fresh state for a new thread at stage zero.
    pub fn new(thread_id: impl Into<String>, task: Task) -> Self {
        Self {
            thread_id: thread_id.into(),
            task,
            current_stage_index: 0,
            fields: Map::new(),
            retry_counts: HashMap::new(),
            pending_interrupt: None,
            history: Vec::new(),
            status: ThreadStatus::Running,
            updated_at: Utc::now(),
        }
    }

    /// Merges stage outputs into `fields` according to each output's
    /// declared merge strategy.
    ///
    /// `Overwrite` replaces the field; `Append` concatenates onto an existing
    /// JSON array (a scalar is promoted to a one-element array first).
    /// Fields not declared by any output spec are ignored.
    pub fn merge_outputs(&mut self, outputs: Map<String, Value>, specs: &[OutputSpec]) {
        for spec in specs {
            let Some(value) = outputs.get(&spec.name) else {
                continue;
            };
            match spec.merge {
                MergeStrategy::Overwrite => {
                    self.fields.insert(spec.name.clone(), value.clone());
                }
                MergeStrategy::Append => {
                    let entry = self
                        .fields
                        .entry(spec.name.clone())
                        .or_insert_with(|| Value::Array(Vec::new()));
                    if !entry.is_array() {
                        *entry = Value::Array(vec![entry.take()]);
                    }
                    if let Some(arr) = entry.as_array_mut() {
                        match value {
                            Value::Array(items) => arr.extend(items.iter().cloned()),
                            other => arr.push(other.clone()),
                        }
                    }
                }
            }
        }
    }

    /// Retry count for a rewind-target stage.
    pub fn retry_count(&self, stage: &str) -> u32 {
        self.retry_counts.get(stage).copied().unwrap_or(0)
    }

    /// Records a rewind to `stage`, incrementing its retry counter.
    pub fn record_rewind(&mut self, stage: &str) -> u32 {
        let count = self.retry_counts.entry(stage.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Names of stages that completed, in execution order.
    pub fn stages_executed(&self) -> Vec<String> {
        self.history
            .iter()
            .filter(|t| t.status == TransitionStatus::Completed)
            .map(|t| t.stage.clone())
            .collect()
    }

    /// Error notes from failed transitions, in order.
    pub fn errors(&self) -> Vec<String> {
        self.history
            .iter()
            .filter(|t| t.status == TransitionStatus::Failed)
            .filter_map(|t| t.note.clone())
            .collect()
    }
}

/// Terminal or suspension status reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineStatus {
    Completed,
    Interrupted,
    Failed,
}

/// The contract rendered by the UI layer when a thread suspends.
///
/// `allowed_decisions` is always a non-empty subset of
/// `{approve, edit, reject}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptPayload {
    pub thread_id: String,
    pub checkpoint_name: String,
    pub description: String,
    pub allowed_decisions: Vec<Decision>,
}

/// Terminal or suspension-time return value. Derived from
/// [`ExecutionState`], never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub thread_id: String,
    pub status: PipelineStatus,
    /// Synthesized answer, present when `status` is `completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Names of completed stages, in execution order.
    pub stages_executed: Vec<String>,
    /// Error messages collected from failed stage attempts.
    pub errors: Vec<String>,
    /// Present when `status` is `interrupted`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<InterruptPayload>,
}

impl PipelineResult {
    /// Derives the caller-facing result from persisted state.
    pub fn from_state(state: &ExecutionState) -> Self {
        let status = match state.status {
            ThreadStatus::Completed => PipelineStatus::Completed,
            ThreadStatus::Interrupted => PipelineStatus::Interrupted,
            // A thread loaded mid-run reports as interrupted until it
            // reaches a terminal state.
            ThreadStatus::Running => PipelineStatus::Interrupted,
            ThreadStatus::Failed => PipelineStatus::Failed,
        };

        let output = if state.status == ThreadStatus::Completed {
            state
                .fields
                .get("answer")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        } else {
            None
        };

        let interrupt = state.pending_interrupt.as_ref().map(|p| InterruptPayload {
            thread_id: state.thread_id.clone(),
            checkpoint_name: p.checkpoint_name.clone(),
            description: p.description.clone(),
            allowed_decisions: p.allowed_decisions.clone(),
        });

        Self {
            thread_id: state.thread_id.clone(),
            status,
            output,
            stages_executed: state.stages_executed(),
            errors: state.errors(),
            interrupt,
        }
    }
}

/// Compact state view for session-history listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSummary {
    pub thread_id: String,
    pub task_type: TaskType,
    pub raw_text: String,
    pub status: ThreadStatus,
    pub current_stage_index: usize,
    pub stages_executed: Vec<String>,
    pub pending_checkpoint: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StateSummary {
    /// Builds a summary from full state.
    pub fn from_state(state: &ExecutionState) -> Self {
        Self {
            thread_id: state.thread_id.clone(),
            task_type: state.task.task_type,
            raw_text: state.task.raw_text.clone(),
            status: state.status,
            current_stage_index: state.current_stage_index,
            stages_executed: state.stages_executed(),
            pending_checkpoint: state
                .pending_interrupt
                .as_ref()
                .map(|p| p.checkpoint_name.clone()),
            updated_at: state.updated_at,
        }
    }
}
