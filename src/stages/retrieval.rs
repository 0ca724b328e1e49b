//! Retrieval stage: execute the strategy chosen by query analysis.
//!
//! Three strategies:
//!
//! - `focused`: one search with a small `k`, for narrow factual intents
//! - `broad`: query variants issued concurrently and joined, larger `k`
//! - `multi_stage`: sequential searches where each hop's best hit seeds the
//!   next query
//!
//! The strategy lives in `fields` and may be overridden by a quality-gate
//! rewind hint (typically forcing `focused` to `broad`).

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::StageError;
use crate::search::{tokenize, SearchHit, SearchService};
use crate::workflow::StageKind;

use super::{Stage, StageInput, StageOutput};

/// `k` for a focused single search.
const FOCUSED_K: usize = 5;
/// Maximum query variants issued by the broad strategy.
const MAX_VARIANTS: usize = 4;
/// Hops performed by the multi-stage strategy.
const MULTI_STAGE_HOPS: usize = 2;

/// The retrieval stage.
pub struct RetrievalStage {
    search: Arc<dyn SearchService>,
}

impl RetrievalStage {
    pub fn new(search: Arc<dyn SearchService>) -> Self {
        Self { search }
    }

    async fn run_focused(
        &self,
        query: &str,
    ) -> Result<(Vec<SearchHit>, Vec<String>), StageError> {
        let hits = self.search.search(query, FOCUSED_K, None).await?;
        Ok((hits, vec![query.to_string()]))
    }

    async fn run_broad(
        &self,
        queries: &[String],
        k: usize,
    ) -> Result<(Vec<SearchHit>, Vec<String>), StageError> {
        let variants: Vec<&String> = queries.iter().take(MAX_VARIANTS).collect();

        let searches = variants
            .iter()
            .map(|q| self.search.search(q, k, None));
        let results = join_all(searches).await;

        let mut hits = Vec::new();
        for result in results {
            hits.extend(result?);
        }

        Ok((
            merge_hits(hits),
            variants.iter().map(|q| q.to_string()).collect(),
        ))
    }

    async fn run_multi_stage(
        &self,
        queries: &[String],
        k: usize,
    ) -> Result<(Vec<SearchHit>, Vec<String>), StageError> {
        let primary = queries
            .first()
            .cloned()
            .unwrap_or_default();

        let mut executed = vec![primary.clone()];
        let mut hits = self.search.search(&primary, k, None).await?;

        for hop in 1..MULTI_STAGE_HOPS {
            // Seed the next hop with salient terms from the best hit so far.
            let Some(best) = hits.first() else { break };
            let mut seed_terms: Vec<String> = tokenize(&best.content).into_iter().collect();
            seed_terms.sort();
            seed_terms.truncate(5);

            let follow_up = match queries.get(hop) {
                Some(variant) => format!("{} {}", variant, seed_terms.join(" ")),
                None => format!("{} {}", primary, seed_terms.join(" ")),
            };

            let follow_up_hits = self.search.search(&follow_up, k, None).await?;
            executed.push(follow_up);
            hits.extend(follow_up_hits);
            hits = merge_hits(hits);
        }

        Ok((hits, executed))
    }
}

/// Deduplicates hits by source (keeping the best score) and re-sorts into a
/// stable order.
fn merge_hits(hits: Vec<SearchHit>) -> Vec<SearchHit> {
    let mut by_source: HashMap<String, SearchHit> = HashMap::new();
    for hit in hits {
        match by_source.get(&hit.source) {
            Some(existing) if existing.score >= hit.score => {}
            _ => {
                by_source.insert(hit.source.clone(), hit);
            }
        }
    }

    let mut merged: Vec<SearchHit> = by_source.into_values().collect();
    merged.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.source.cmp(&b.source))
    });
    merged
}

#[async_trait]
impl Stage for RetrievalStage {
    fn kind(&self) -> StageKind {
        StageKind::Retrieval
    }

    async fn run(&self, input: &StageInput) -> Result<StageOutput, StageError> {
        let strategy = input.str_field("retrieval_strategy").unwrap_or("focused");

        let mut queries = input.string_list("search_queries");
        if queries.is_empty() {
            queries.push(input.query.clone());
        }

        let k = input.thresholds.max_results;
        let (mut hits, executed) = match strategy {
            "broad" => self.run_broad(&queries, k).await?,
            "multi_stage" => self.run_multi_stage(&queries, k).await?,
            _ => self.run_focused(&queries[0]).await?,
        };

        // Keep headroom above max_results so re-ranking has material to
        // deduplicate and diversify.
        hits.truncate(k * 2);

        tracing::debug!(
            strategy = strategy,
            searches = executed.len(),
            hits = hits.len(),
            "Retrieval complete"
        );

        let documents: Vec<serde_json::Value> = hits
            .iter()
            .map(|h| json!({"content": h.content, "source": h.source, "score": h.score}))
            .collect();

        Ok(StageOutput::new()
            .with_field("result_count", json!(documents.len()))
            .with_field("documents", json!(documents))
            .with_field("searches_run", json!(executed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::TaskType;
    use crate::error::SearchError;
    use crate::search::MemoryIndex;
    use crate::workflow::Thresholds;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Search stub that records how many searches were issued.
    struct CountingSearch {
        calls: AtomicUsize,
        inner: MemoryIndex,
    }

    #[async_trait]
    impl SearchService for CountingSearch {
        async fn search(
            &self,
            query: &str,
            k: usize,
            filters: Option<&Map<String, serde_json::Value>>,
        ) -> Result<Vec<SearchHit>, SearchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.search(query, k, filters).await
        }

        async fn ingest(&self, source: &str, content: &str) -> Result<usize, SearchError> {
            self.inner.ingest(source, content).await
        }
    }

    async fn seeded() -> Arc<CountingSearch> {
        let search = CountingSearch {
            calls: AtomicUsize::new(0),
            inner: MemoryIndex::new(),
        };
        search
            .ingest("a.md", "rust ownership and borrowing rules")
            .await
            .unwrap();
        search
            .ingest("b.md", "rust async runtimes overview tokio")
            .await
            .unwrap();
        search
            .ingest("c.md", "garbage collection in go examples")
            .await
            .unwrap();
        Arc::new(search)
    }

    fn input(strategy: &str, queries: &[&str]) -> StageInput {
        let mut fields = Map::new();
        fields.insert("retrieval_strategy".into(), json!(strategy));
        fields.insert("search_queries".into(), json!(queries));
        StageInput {
            stage: "retrieval".into(),
            query: "rust".into(),
            task_type: TaskType::SimpleQa,
            fields,
            thresholds: Thresholds::default(),
        }
    }

    #[tokio::test]
    async fn test_focused_issues_single_search() {
        let search = seeded().await;
        let stage = RetrievalStage::new(Arc::clone(&search) as Arc<dyn SearchService>);

        let output = stage
            .run(&input("focused", &["rust ownership"]))
            .await
            .unwrap();

        assert_eq!(search.calls.load(Ordering::SeqCst), 1);
        assert!(output.fields["result_count"].as_u64().unwrap() >= 1);
        assert_eq!(
            output.fields["searches_run"],
            json!(["rust ownership"])
        );
    }

    #[tokio::test]
    async fn test_broad_joins_all_variants() {
        let search = seeded().await;
        let stage = RetrievalStage::new(Arc::clone(&search) as Arc<dyn SearchService>);

        let output = stage
            .run(&input(
                "broad",
                &["rust ownership", "rust async runtimes", "go examples"],
            ))
            .await
            .unwrap();

        assert_eq!(search.calls.load(Ordering::SeqCst), 3);
        // Documents deduplicated by source.
        let docs = output.fields["documents"].as_array().unwrap();
        let sources: Vec<&str> = docs.iter().filter_map(|d| d["source"].as_str()).collect();
        let mut unique = sources.clone();
        unique.dedup();
        assert_eq!(sources.len(), unique.len());
    }

    #[tokio::test]
    async fn test_multi_stage_runs_dependent_searches() {
        let search = seeded().await;
        let stage = RetrievalStage::new(Arc::clone(&search) as Arc<dyn SearchService>);

        let output = stage
            .run(&input("multi_stage", &["rust ownership", "borrowing"]))
            .await
            .unwrap();

        assert_eq!(search.calls.load(Ordering::SeqCst), MULTI_STAGE_HOPS);
        let executed = output.fields["searches_run"].as_array().unwrap();
        assert_eq!(executed.len(), MULTI_STAGE_HOPS);
        // Second search is seeded by the first hop's best hit.
        assert!(executed[1].as_str().unwrap().starts_with("borrowing"));
    }

    #[tokio::test]
    async fn test_falls_back_to_raw_query_without_variants() {
        let search = seeded().await;
        let stage = RetrievalStage::new(Arc::clone(&search) as Arc<dyn SearchService>);

        let mut fields = Map::new();
        fields.insert("retrieval_strategy".into(), json!("focused"));
        let input = StageInput {
            stage: "retrieval".into(),
            query: "rust ownership".into(),
            task_type: TaskType::SimpleQa,
            fields,
            thresholds: Thresholds::default(),
        };

        let output = stage.run(&input).await.unwrap();
        assert_eq!(output.fields["searches_run"], json!(["rust ownership"]));
    }

    #[test]
    fn test_merge_hits_keeps_best_score_per_source() {
        let merged = merge_hits(vec![
            SearchHit {
                content: "x".into(),
                source: "a".into(),
                score: 0.2,
            },
            SearchHit {
                content: "x".into(),
                source: "a".into(),
                score: 0.9,
            },
            SearchHit {
                content: "y".into(),
                source: "b".into(),
                score: 0.5,
            },
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].source, "a");
        assert!((merged[0].score - 0.9).abs() < f64::EPSILON);
    }
}
