//! Query-analysis stage: classify intent and plan searches.
//!
//! Asks the generation service for a structured analysis of the request
//! (intent, sub-topics, query variants) and falls back to deterministic
//! heuristics when the model's output cannot be parsed. Ambiguity is never
//! surfaced as an error; transport failures are, and the orchestrator
//! retries them.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::error::StageError;
use crate::llm::GenerationService;
use crate::workflow::StageKind;

use super::{Stage, StageInput, StageOutput};

/// Classified intent of a request, driving retrieval strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryIntent {
    /// Narrow factual lookup: single focused search.
    Factual,
    /// Conceptual/explanatory: broad multi-variant search.
    Conceptual,
    /// Comparative: broad search covering both sides.
    Comparative,
    /// Multi-hop: sequential dependent searches.
    MultiHop,
}

impl QueryIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryIntent::Factual => "factual",
            QueryIntent::Conceptual => "conceptual",
            QueryIntent::Comparative => "comparative",
            QueryIntent::MultiHop => "multi_hop",
        }
    }

    /// The retrieval strategy this intent maps to.
    pub fn strategy(&self) -> &'static str {
        match self {
            QueryIntent::Factual => "focused",
            QueryIntent::Conceptual | QueryIntent::Comparative => "broad",
            QueryIntent::MultiHop => "multi_stage",
        }
    }

    fn parse(name: &str) -> Option<QueryIntent> {
        match name.trim().to_lowercase().as_str() {
            "factual" => Some(QueryIntent::Factual),
            "conceptual" => Some(QueryIntent::Conceptual),
            "comparative" => Some(QueryIntent::Comparative),
            "multi_hop" | "multi-hop" => Some(QueryIntent::MultiHop),
            _ => None,
        }
    }
}

const ANALYSIS_PROMPT: &str = r#"Analyze the following request for a retrieval pipeline.
Respond with only a JSON object of this shape:
{"intent": "factual|conceptual|comparative|multi_hop",
 "sub_topics": ["..."],
 "queries": ["..."]}

"sub_topics" lists the distinct aspects an answer must cover.
"queries" lists 2-4 search query variants.

Request: "#;

/// Parsed model response; any missing piece falls back to heuristics.
#[derive(Debug, Deserialize)]
struct Analysis {
    intent: Option<String>,
    #[serde(default)]
    sub_topics: Vec<String>,
    #[serde(default)]
    queries: Vec<String>,
}

/// The query-analysis stage.
pub struct QueryAnalysisStage {
    generation: Arc<dyn GenerationService>,
}

impl QueryAnalysisStage {
    pub fn new(generation: Arc<dyn GenerationService>) -> Self {
        Self { generation }
    }

    /// Deterministic intent fallback from keyword inspection.
    fn heuristic_intent(query: &str) -> QueryIntent {
        let text = query.to_lowercase();

        if text.contains("compare")
            || text.contains(" vs ")
            || text.contains("versus")
            || text.contains("difference between")
        {
            QueryIntent::Comparative
        } else if text.contains("and then")
            || text.contains("led to")
            || text.contains("caused by")
            || text.contains("which in turn")
        {
            QueryIntent::MultiHop
        } else if text.starts_with("what is")
            || text.starts_with("who ")
            || text.starts_with("when ")
            || text.starts_with("where ")
        {
            QueryIntent::Factual
        } else {
            QueryIntent::Conceptual
        }
    }

    /// Deterministic query-variant fallback.
    fn heuristic_queries(query: &str, intent: QueryIntent) -> Vec<String> {
        let base = query.trim().trim_end_matches('?').to_string();
        match intent {
            QueryIntent::Factual => vec![base],
            _ => vec![
                base.clone(),
                format!("{} overview", base),
                format!("{} examples", base),
            ],
        }
    }

    /// Extracts the first JSON object from model output, tolerating code
    /// fences and surrounding prose.
    fn extract_json(text: &str) -> Option<Analysis> {
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        if end <= start {
            return None;
        }
        serde_json::from_str(&text[start..=end]).ok()
    }
}

#[async_trait]
impl Stage for QueryAnalysisStage {
    fn kind(&self) -> StageKind {
        StageKind::QueryAnalysis
    }

    async fn run(&self, input: &StageInput) -> Result<StageOutput, StageError> {
        let prompt = format!("{}{}", ANALYSIS_PROMPT, input.query);
        let response = self.generation.generate(&prompt, 0.0).await?;

        let analysis = Self::extract_json(&response);
        let intent = analysis
            .as_ref()
            .and_then(|a| a.intent.as_deref())
            .and_then(QueryIntent::parse)
            .unwrap_or_else(|| Self::heuristic_intent(&input.query));

        let sub_topics = analysis
            .as_ref()
            .map(|a| a.sub_topics.clone())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| vec![input.query.trim().trim_end_matches('?').to_string()]);

        let queries = analysis
            .as_ref()
            .map(|a| a.queries.clone())
            .filter(|q| !q.is_empty())
            .unwrap_or_else(|| Self::heuristic_queries(&input.query, intent));

        tracing::debug!(
            intent = intent.as_str(),
            variants = queries.len(),
            "Query analysis complete"
        );

        Ok(StageOutput::new()
            .with_field("query_intent", json!(intent.as_str()))
            .with_field("sub_topics", json!(sub_topics))
            .with_field("search_queries", json!(queries))
            .with_field("retrieval_strategy", json!(intent.strategy())))
    }
}
