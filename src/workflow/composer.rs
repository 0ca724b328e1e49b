//! The workflow composition table: task type → pipeline definition.
//!
//! This table is the one source of truth for task-type dispatch. An
//! unrecognized task type fails loudly with `UnknownTaskType` rather than
//! silently defaulting, because it indicates a classifier/composer mismatch.

use std::collections::HashMap;

use crate::classifier::TaskType;
use crate::error::ComposeError;
use crate::stages::StageRegistry;
use crate::state::Decision;

use super::{
    stage_names, CheckpointSpec, OutputSpec, StageKind, StageSpec, Thresholds, WorkflowDefinition,
};

/// Composes workflow definitions from the static table.
///
/// Pure lookup after construction; safe to call concurrently without
/// locking.
pub struct WorkflowComposer {
    table: HashMap<TaskType, WorkflowDefinition>,
}

impl WorkflowComposer {
    /// Builds the default composition table with the given thresholds.
    ///
    /// # Errors
    ///
    /// Returns `ComposeError` if any built-in definition fails structural
    /// validation (a programming error in the table itself).
    pub fn new(thresholds: Thresholds) -> Result<Self, ComposeError> {
        let mut table = HashMap::new();

        for task_type in TaskType::all() {
            let definition = build_definition(task_type, thresholds);
            definition.validate()?;
            table.insert(task_type, definition);
        }

        Ok(Self { table })
    }

    /// Looks up the workflow for a task type.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTaskType` if the table has no entry. This is fatal at
    /// composition time and never retried.
    pub fn compose(&self, task_type: TaskType) -> Result<WorkflowDefinition, ComposeError> {
        self.table
            .get(&task_type)
            .cloned()
            .ok_or_else(|| ComposeError::UnknownTaskType(task_type.to_string()))
    }

    /// Verifies that every stage kind referenced by the table has a
    /// registered implementation.
    pub fn validate_registry(&self, registry: &StageRegistry) -> Result<(), ComposeError> {
        for definition in self.table.values() {
            for stage in &definition.stages {
                if !registry.contains(stage.kind) {
                    return Err(ComposeError::MissingStageImplementation {
                        task_type: definition.task_type.to_string(),
                        stage: stage.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn query_analysis_spec() -> StageSpec {
    StageSpec::new(stage_names::QUERY_ANALYSIS, StageKind::QueryAnalysis).with_outputs(vec![
        OutputSpec::overwrite("query_intent"),
        OutputSpec::overwrite("sub_topics"),
        OutputSpec::overwrite("search_queries"),
        OutputSpec::overwrite("retrieval_strategy"),
    ])
}

fn retrieval_spec() -> StageSpec {
    StageSpec::new(stage_names::RETRIEVAL, StageKind::Retrieval)
        .with_inputs(&["search_queries", "retrieval_strategy"])
        .with_outputs(vec![
            OutputSpec::overwrite("documents"),
            OutputSpec::overwrite("result_count"),
            OutputSpec::append("searches_run"),
        ])
}

fn rerank_spec() -> StageSpec {
    StageSpec::new(stage_names::RERANK, StageKind::ReRank)
        .with_inputs(&["documents"])
        .with_outputs(vec![OutputSpec::overwrite("ranked_documents")])
}

fn quality_assess_spec() -> StageSpec {
    StageSpec::new(stage_names::QUALITY_ASSESS, StageKind::QualityAssess)
        .with_inputs(&["ranked_documents", "sub_topics"])
        .with_outputs(vec![
            OutputSpec::overwrite("quality_score"),
            OutputSpec::overwrite("quality_coverage"),
            OutputSpec::overwrite("quality_result_count"),
        ])
}

/// `documents_field` is `ranked_documents` for workflows with a rerank
/// stage, `documents` otherwise.
fn synthesize_spec(documents_field: &str) -> StageSpec {
    StageSpec::new(stage_names::SYNTHESIZE, StageKind::Synthesize)
        .with_inputs(&[documents_field, "query_intent"])
        .with_outputs(vec![OutputSpec::overwrite("answer")])
}

fn retrieval_checkpoint() -> CheckpointSpec {
    CheckpointSpec::standard(
        stage_names::RETRIEVAL,
        "Retrieved {result_count} documents for '{query}' using the {retrieval_strategy} strategy.",
    )
}

fn quality_checkpoint() -> CheckpointSpec {
    // Quality concerns are remedied by retrieving more material, so a
    // reject here rewinds to retrieval rather than re-running the check.
    CheckpointSpec::standard(
        stage_names::QUALITY_ASSESS,
        "Quality check for '{query}': score {quality_score}, coverage {quality_coverage}.",
    )
    .with_rewind_target(stage_names::RETRIEVAL)
}

fn synthesis_checkpoint() -> CheckpointSpec {
    CheckpointSpec::standard(
        stage_names::SYNTHESIZE,
        "Draft answer for '{query}' is ready for review.",
    )
}

fn review_only_checkpoint(stage: &str, template: &str) -> CheckpointSpec {
    CheckpointSpec::standard(stage, template)
        .with_allowed(vec![Decision::Approve, Decision::Reject])
}

fn build_definition(task_type: TaskType, thresholds: Thresholds) -> WorkflowDefinition {
    let mut checkpoints = HashMap::new();

    let stages = match task_type {
        TaskType::SimpleQa => {
            // Three stages, zero checkpoints: a simple factual question
            // completes in a single `execute` call.
            vec![
                query_analysis_spec(),
                retrieval_spec(),
                synthesize_spec("documents"),
            ]
        }
        TaskType::FactVerification => {
            checkpoints.insert(stage_names::QUALITY_ASSESS.to_string(), quality_checkpoint());
            vec![
                query_analysis_spec(),
                retrieval_spec(),
                rerank_spec(),
                quality_assess_spec(),
                synthesize_spec("ranked_documents"),
            ]
        }
        TaskType::CodeGeneration => {
            checkpoints.insert(stage_names::SYNTHESIZE.to_string(), synthesis_checkpoint());
            vec![
                query_analysis_spec(),
                retrieval_spec(),
                rerank_spec(),
                synthesize_spec("ranked_documents"),
            ]
        }
        TaskType::Comparison => {
            checkpoints.insert(stage_names::RETRIEVAL.to_string(), retrieval_checkpoint());
            checkpoints.insert(stage_names::SYNTHESIZE.to_string(), synthesis_checkpoint());
            vec![
                query_analysis_spec(),
                retrieval_spec(),
                rerank_spec(),
                quality_assess_spec(),
                synthesize_spec("ranked_documents"),
            ]
        }
        TaskType::Summarization => {
            checkpoints.insert(stage_names::SYNTHESIZE.to_string(), synthesis_checkpoint());
            vec![
                query_analysis_spec(),
                retrieval_spec(),
                rerank_spec(),
                synthesize_spec("ranked_documents"),
            ]
        }
        TaskType::Explanation => {
            checkpoints.insert(stage_names::QUALITY_ASSESS.to_string(), quality_checkpoint());
            vec![
                query_analysis_spec(),
                retrieval_spec(),
                rerank_spec(),
                quality_assess_spec(),
                synthesize_spec("ranked_documents"),
            ]
        }
        TaskType::LongFormArticle => {
            // Every stage carries a checkpoint: long-form output is
            // expensive to regenerate, so the human steers each step.
            checkpoints.insert(
                stage_names::QUERY_ANALYSIS.to_string(),
                CheckpointSpec::standard(
                    stage_names::QUERY_ANALYSIS,
                    "Planned sub-topics for '{query}': {sub_topics}",
                ),
            );
            checkpoints.insert(stage_names::RETRIEVAL.to_string(), retrieval_checkpoint());
            checkpoints.insert(
                stage_names::RERANK.to_string(),
                review_only_checkpoint(
                    stage_names::RERANK,
                    "Re-ranked source material for '{query}' is ready for review.",
                )
                .with_rewind_target(stage_names::RETRIEVAL),
            );
            checkpoints.insert(stage_names::QUALITY_ASSESS.to_string(), quality_checkpoint());
            checkpoints.insert(stage_names::SYNTHESIZE.to_string(), synthesis_checkpoint());
            vec![
                query_analysis_spec(),
                retrieval_spec(),
                rerank_spec(),
                quality_assess_spec(),
                synthesize_spec("ranked_documents"),
            ]
        }
    };

    WorkflowDefinition {
        task_type,
        stages,
        checkpoints,
        thresholds,
    }
}
