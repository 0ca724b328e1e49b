//! Quality-assessment stage: score the ranked material before synthesis.
//!
//! Produces the numeric inputs the quality gate decides on: an overall
//! score, sub-topic coverage, and the ranked-document count. The decision
//! itself (continue, rewind, fail) belongs to the gate, not this stage.

use async_trait::async_trait;
use serde_json::json;

use crate::error::StageError;
use crate::search::{jaccard, tokenize};
use crate::workflow::StageKind;

use super::{RankedDocument, Stage, StageInput, StageOutput};

/// Minimum token overlap for a document to count as addressing a sub-topic.
const TOPIC_MATCH_THRESHOLD: f64 = 0.2;

/// Weight of document strength vs. coverage in the overall score.
const WEIGHT_DOCUMENT_STRENGTH: f64 = 0.6;
const WEIGHT_COVERAGE: f64 = 0.4;

/// The quality-assessment stage.
#[derive(Default)]
pub struct QualityAssessStage;

impl QualityAssessStage {
    pub fn new() -> Self {
        Self
    }
}

/// Fraction of sub-topics addressed by at least one document.
fn coverage(sub_topics: &[String], documents: &[RankedDocument]) -> f64 {
    if sub_topics.is_empty() {
        // Nothing was required, so nothing is missing.
        return 1.0;
    }

    let doc_tokens: Vec<_> = documents.iter().map(|d| tokenize(&d.content)).collect();
    let addressed = sub_topics
        .iter()
        .filter(|topic| {
            let topic_tokens = tokenize(topic);
            doc_tokens
                .iter()
                .any(|d| jaccard(&topic_tokens, d) >= TOPIC_MATCH_THRESHOLD || topic_tokens.is_subset(d))
        })
        .count();

    addressed as f64 / sub_topics.len() as f64
}

#[async_trait]
impl Stage for QualityAssessStage {
    fn kind(&self) -> StageKind {
        StageKind::QualityAssess
    }

    async fn run(&self, input: &StageInput) -> Result<StageOutput, StageError> {
        let ranked = input.require_array("ranked_documents")?;
        let documents: Vec<RankedDocument> = ranked
            .iter()
            .filter_map(|d| serde_json::from_value(d.clone()).ok())
            .collect();
        if documents.len() < ranked.len() {
            return Err(StageError::InvalidOutput {
                stage: input.stage.clone(),
                reason: "ranked_documents field contains malformed entries".to_string(),
            });
        }

        let sub_topics = input.string_list("sub_topics");

        let strength = if documents.is_empty() {
            0.0
        } else {
            documents.iter().map(|d| d.combined).sum::<f64>() / documents.len() as f64
        };
        let coverage = coverage(&sub_topics, &documents);
        let score =
            (WEIGHT_DOCUMENT_STRENGTH * strength + WEIGHT_COVERAGE * coverage).clamp(0.0, 1.0);

        tracing::debug!(
            score = score,
            coverage = coverage,
            result_count = documents.len(),
            "Quality assessment complete"
        );

        Ok(StageOutput::new()
            .with_field("quality_score", json!(score))
            .with_field("quality_coverage", json!(coverage))
            .with_field("quality_result_count", json!(documents.len())))
    }
}
