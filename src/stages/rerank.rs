//! Re-ranking stage: multi-signal scoring with deterministic ordering.
//!
//! Candidates are deduplicated by content similarity, scored by a weighted
//! combination of four signals, then reordered by a position-optimization
//! pass that counters "lost in the middle" degradation in downstream
//! synthesis. Given identical input (including tied scores) the output
//! ordering is byte-identical across invocations: every comparison falls
//! back to shortest source path, then lexical source order.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Ordering;

use crate::error::StageError;
use crate::search::{jaccard, tokenize, SearchHit};
use crate::workflow::StageKind;

use super::{Stage, StageInput, StageOutput};

/// Signal weights for the combined score.
const WEIGHT_SEMANTIC: f64 = 0.40;
const WEIGHT_KEYWORD: f64 = 0.25;
const WEIGHT_QUALITY: f64 = 0.20;
const WEIGHT_DIVERSITY: f64 = 0.15;

/// Content similarity above which two candidates are near-duplicates.
const DUPLICATE_THRESHOLD: f64 = 0.9;

/// Word count at which the content-quality signal saturates.
const QUALITY_SATURATION_WORDS: f64 = 200.0;

/// A candidate after scoring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedDocument {
    pub content: String,
    pub source: String,
    /// Backend relevance score carried from retrieval.
    pub score: f64,
    pub semantic: f64,
    pub keyword: f64,
    pub quality: f64,
    pub diversity: f64,
    /// Weighted combination of the four signals.
    pub combined: f64,
}

/// Source-path tie-break: shortest path first, then lexical order.
fn source_order(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn descending(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

/// Collapses near-duplicates, keeping the highest-scoring instance.
///
/// Candidates are visited in (score desc, source tie-break) order so the
/// survivor of each duplicate group is fully determined by the input set,
/// not its arrival order.
fn deduplicate(candidates: &[SearchHit]) -> Vec<SearchHit> {
    let mut ordered: Vec<&SearchHit> = candidates.iter().collect();
    ordered.sort_by(|a, b| {
        descending(a.score, b.score).then_with(|| source_order(&a.source, &b.source))
    });

    let mut kept: Vec<SearchHit> = Vec::new();
    let mut kept_tokens: Vec<std::collections::HashSet<String>> = Vec::new();

    for candidate in ordered {
        let tokens = tokenize(&candidate.content);
        let duplicate = kept_tokens
            .iter()
            .any(|k| jaccard(k, &tokens) >= DUPLICATE_THRESHOLD);
        if !duplicate {
            kept.push(candidate.clone());
            kept_tokens.push(tokens);
        }
    }

    kept
}

/// Length-and-structure heuristic for content quality in `[0, 1]`.
fn content_quality(content: &str) -> f64 {
    let words = content.split_whitespace().count() as f64;
    if words == 0.0 {
        return 0.0;
    }
    let length_score = (words / QUALITY_SATURATION_WORDS).min(1.0);
    let has_sentences = content.contains('.') || content.contains('\n');
    let structure_score = if has_sentences { 1.0 } else { 0.5 };
    0.7 * length_score + 0.3 * structure_score
}

/// Scores, orders, and position-optimizes a candidate set.
///
/// Pure function: given an identical candidate list the output is
/// byte-identical across invocations.
pub fn rerank(query: &str, candidates: &[SearchHit], max_results: usize) -> Vec<RankedDocument> {
    let unique = deduplicate(candidates);
    let query_tokens = tokenize(query);
    let doc_tokens: Vec<_> = unique.iter().map(|d| tokenize(&d.content)).collect();

    let mut scored: Vec<RankedDocument> = unique
        .iter()
        .enumerate()
        .map(|(i, doc)| {
            let semantic = doc.score.clamp(0.0, 1.0);
            let keyword = jaccard(&query_tokens, &doc_tokens[i]);
            let quality = content_quality(&doc.content);

            // Diversity: distance from the nearest other candidate. A lone
            // document is maximally diverse.
            let nearest = doc_tokens
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, other)| jaccard(&doc_tokens[i], other))
                .fold(0.0_f64, f64::max);
            let diversity = 1.0 - nearest;

            let combined = WEIGHT_SEMANTIC * semantic
                + WEIGHT_KEYWORD * keyword
                + WEIGHT_QUALITY * quality
                + WEIGHT_DIVERSITY * diversity;

            RankedDocument {
                content: doc.content.clone(),
                source: doc.source.clone(),
                score: doc.score,
                semantic,
                keyword,
                quality,
                diversity,
                combined,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        descending(a.combined, b.combined).then_with(|| source_order(&a.source, &b.source))
    });
    scored.truncate(max_results);

    position_optimize(scored)
}

/// Reorders a score-descending list to counter "lost in the middle":
/// the two best documents lead, the weakest sit in the middle in descending
/// order, and the third-best takes the final slot when more than two
/// high scorers exist.
fn position_optimize(sorted: Vec<RankedDocument>) -> Vec<RankedDocument> {
    if sorted.len() <= 3 {
        return sorted;
    }

    let mut result = Vec::with_capacity(sorted.len());
    let mut iter = sorted.into_iter();

    let first = iter.next();
    let second = iter.next();
    let tail = iter.next();

    result.extend(first);
    result.extend(second);
    result.extend(iter);
    result.extend(tail);
    result
}

/// The re-ranking stage: a thin wrapper over [`rerank`].
#[derive(Default)]
pub struct ReRankStage;

impl ReRankStage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Stage for ReRankStage {
    fn kind(&self) -> StageKind {
        StageKind::ReRank
    }

    async fn run(&self, input: &StageInput) -> Result<StageOutput, StageError> {
        let documents = input.require_array("documents")?;

        let candidates: Vec<SearchHit> = documents
            .iter()
            .filter_map(|d| serde_json::from_value(d.clone()).ok())
            .collect();
        if candidates.len() < documents.len() {
            return Err(StageError::InvalidOutput {
                stage: input.stage.clone(),
                reason: "documents field contains malformed entries".to_string(),
            });
        }

        let ranked = rerank(&input.query, &candidates, input.thresholds.max_results);

        tracing::debug!(
            candidates = candidates.len(),
            ranked = ranked.len(),
            "Re-ranking complete"
        );

        Ok(StageOutput::new().with_field("ranked_documents", json!(ranked)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(content: &str, source: &str, score: f64) -> SearchHit {
        SearchHit {
            content: content.into(),
            source: source.into(),
            score,
        }
    }

    #[test]
    fn test_near_duplicates_collapse_to_best_instance() {
        let candidates = vec![
            hit("rust ownership model and borrowing", "long/path/a.md", 0.4),
            hit("rust ownership model and borrowing", "b.md", 0.9),
            hit("completely different content about go", "c.md", 0.5),
        ];

        let ranked = rerank("rust ownership", &candidates, 10);
        assert_eq!(ranked.len(), 2);
        assert!(ranked.iter().any(|d| d.source == "b.md"));
        assert!(!ranked.iter().any(|d| d.source == "long/path/a.md"));
    }

    #[test]
    fn test_duplicate_tie_breaks_by_path_then_lexical() {
        // Identical content and identical scores: the shortest source path
        // survives; among equal lengths, lexical order wins.
        let candidates = vec![
            hit("identical content here", "zz.md", 0.5),
            hit("identical content here", "aa.md", 0.5),
            hit("identical content here", "longer.md", 0.5),
        ];

        let ranked = rerank("identical", &candidates, 10);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].source, "aa.md");
    }

    #[test]
    fn test_combined_uses_documented_weights() {
        let candidates = vec![hit("one", "a.md", 1.0)];
        let ranked = rerank("unrelated query", &candidates, 10);
        let d = &ranked[0];

        let expected = WEIGHT_SEMANTIC * d.semantic
            + WEIGHT_KEYWORD * d.keyword
            + WEIGHT_QUALITY * d.quality
            + WEIGHT_DIVERSITY * d.diversity;
        assert!((d.combined - expected).abs() < 1e-12);
    }

    #[test]
    fn test_ordering_is_deterministic_with_tied_scores() {
        let candidates = vec![
            hit("alpha content entirely unique", "b/path.md", 0.5),
            hit("beta material wholly distinct", "a/path.md", 0.5),
            hit("gamma text fully separate", "c.md", 0.5),
            hit("delta prose altogether other", "d.md", 0.5),
        ];

        let first = rerank("query", &candidates, 10);
        for _ in 0..10 {
            assert_eq!(rerank("query", &candidates, 10), first);
        }

        // Input order must not matter either.
        let mut reversed = candidates.clone();
        reversed.reverse();
        assert_eq!(rerank("query", &reversed, 10), first);
    }

    #[test]
    fn test_position_optimization_brackets_the_middle() {
        let docs: Vec<RankedDocument> = (0..5)
            .map(|i| RankedDocument {
                content: format!("doc {}", i),
                source: format!("s{}.md", i),
                score: 0.0,
                semantic: 0.0,
                keyword: 0.0,
                quality: 0.0,
                diversity: 0.0,
                // s0 has the highest combined score, s4 the lowest.
                combined: 1.0 - i as f64 * 0.1,
            })
            .collect();

        let optimized = position_optimize(docs);
        let order: Vec<&str> = optimized.iter().map(|d| d.source.as_str()).collect();
        // Best two first, weakest in the middle descending, third-best last.
        assert_eq!(order, vec!["s0.md", "s1.md", "s3.md", "s4.md", "s2.md"]);
    }

    #[test]
    fn test_position_optimization_short_lists_untouched() {
        let docs: Vec<RankedDocument> = (0..3)
            .map(|i| RankedDocument {
                content: String::new(),
                source: format!("s{}.md", i),
                score: 0.0,
                semantic: 0.0,
                keyword: 0.0,
                quality: 0.0,
                diversity: 0.0,
                combined: 1.0 - i as f64 * 0.1,
            })
            .collect();

        let optimized = position_optimize(docs.clone());
        assert_eq!(optimized, docs);
    }

    #[test]
    fn test_max_results_truncates_before_positioning() {
        let topics = [
            "ownership transfers move values between bindings",
            "async executors poll futures until completion",
            "trait objects enable runtime polymorphism",
            "lifetimes tie borrows to their referents",
            "iterators chain lazy adapter combinators",
            "channels pass messages across threads",
            "macros expand syntax at compile time",
            "modules group items behind visibility rules",
        ];
        let candidates: Vec<SearchHit> = topics
            .iter()
            .enumerate()
            .map(|(i, topic)| hit(topic, &format!("s{}.md", i), 0.9 - i as f64 * 0.1))
            .collect();

        let ranked = rerank("rust concepts", &candidates, 4);
        assert_eq!(ranked.len(), 4);
        // Truncation kept the four best-scored candidates, reordered only by
        // position optimization.
        for doc in &ranked {
            assert!(doc.score > 0.55, "kept {}", doc.source);
        }
    }

    #[test]
    fn test_content_quality_favors_substantial_text() {
        let short = content_quality("tiny");
        let long = content_quality(&"sentence with words. ".repeat(60));
        assert!(long > short);
        assert!(long <= 1.0);
    }

    #[tokio::test]
    async fn test_stage_rejects_malformed_documents() {
        use crate::classifier::TaskType;
        use crate::workflow::Thresholds;
        use serde_json::Map;

        let mut fields = Map::new();
        fields.insert("documents".into(), json!([{"not": "a document"}]));
        let input = StageInput {
            stage: "rerank".into(),
            query: "q".into(),
            task_type: TaskType::SimpleQa,
            fields,
            thresholds: Thresholds::default(),
        };

        let stage = ReRankStage::new();
        assert!(matches!(
            stage.run(&input).await,
            Err(StageError::InvalidOutput { .. })
        ));
    }
}
