//! Synthesis stage: generate the final answer from ranked material.
//!
//! Documents are presented to the model in the order produced by
//! re-ranking's position-optimization pass; this stage does not reorder
//! them. Workflows without a rerank stage feed raw retrieval output
//! through the `documents` field instead.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::classifier::TaskType;
use crate::error::StageError;
use crate::llm::GenerationService;
use crate::workflow::StageKind;

use super::{Stage, StageInput, StageOutput};

/// The synthesis stage.
pub struct SynthesizeStage {
    generation: Arc<dyn GenerationService>,
    temperature: f64,
}

impl SynthesizeStage {
    pub fn new(generation: Arc<dyn GenerationService>, temperature: f64) -> Self {
        Self {
            generation,
            temperature,
        }
    }

    fn instruction(task_type: TaskType) -> &'static str {
        match task_type {
            TaskType::CodeGeneration => {
                "Write working, idiomatic code that solves the request, with a short explanation."
            }
            TaskType::FactVerification => {
                "State whether the claim is supported by the sources, citing which source supports or contradicts it."
            }
            TaskType::Comparison => {
                "Compare the alternatives point by point, grounded in the sources."
            }
            TaskType::Summarization => "Summarize the source material faithfully and concisely.",
            TaskType::LongFormArticle => {
                "Write a well-structured long-form article covering every sub-topic, grounded in the sources."
            }
            TaskType::Explanation => "Explain the topic clearly, building up from fundamentals.",
            TaskType::SimpleQa => "Answer the question directly using the sources.",
        }
    }

    fn build_prompt(&self, input: &StageInput, documents: &[Value]) -> String {
        let mut prompt = String::new();
        prompt.push_str(Self::instruction(input.task_type));
        prompt.push_str("\n\nSources:\n");

        for (i, doc) in documents.iter().enumerate() {
            let content = doc.get("content").and_then(|c| c.as_str()).unwrap_or("");
            let source = doc.get("source").and_then(|s| s.as_str()).unwrap_or("?");
            prompt.push_str(&format!("[{}] ({})\n{}\n\n", i + 1, source, content));
        }

        prompt.push_str(&format!("Request: {}\n", input.query));
        prompt
    }
}

#[async_trait]
impl Stage for SynthesizeStage {
    fn kind(&self) -> StageKind {
        StageKind::Synthesize
    }

    async fn run(&self, input: &StageInput) -> Result<StageOutput, StageError> {
        // Ranked documents when a rerank stage ran, raw retrieval output
        // otherwise.
        let documents = input
            .fields
            .get("ranked_documents")
            .or_else(|| input.fields.get("documents"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let prompt = self.build_prompt(input, &documents);
        let answer = self.generation.generate(&prompt, self.temperature).await?;

        if answer.trim().is_empty() {
            return Err(StageError::InvalidOutput {
                stage: input.stage.clone(),
                reason: "model returned an empty answer".to_string(),
            });
        }

        tracing::debug!(sources = documents.len(), "Synthesis complete");

        Ok(StageOutput::new().with_field("answer", json!(answer)))
    }
}
