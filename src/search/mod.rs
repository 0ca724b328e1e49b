//! Document-search collaborator interface.
//!
//! The pipeline treats search as an opaque, idempotent, side-effect-free
//! capability: `search(query, k, filters) -> ranked documents`. The bundled
//! [`MemoryIndex`] is a token-overlap index used by tests and the demo CLI;
//! production deployments plug in a vector store behind the same trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use tokio::sync::RwLock;

use crate::error::SearchError;

/// One retrieved document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    /// Document text.
    pub content: String,
    /// Origin path or URL, used for deterministic tie-breaking downstream.
    pub source: String,
    /// Backend relevance score in `[0, 1]`.
    pub score: f64,
}

/// Opaque search capability consumed by the retrieval stage.
#[async_trait]
pub trait SearchService: Send + Sync {
    /// Returns up to `k` documents ranked by relevance to `query`.
    ///
    /// Must be idempotent and side-effect-free. The only filter understood
    /// by the bundled backend is `source_prefix`.
    async fn search(
        &self,
        query: &str,
        k: usize,
        filters: Option<&Map<String, Value>>,
    ) -> Result<Vec<SearchHit>, SearchError>;

    /// Indexes a document, returning the number of indexed records.
    async fn ingest(&self, source: &str, content: &str) -> Result<usize, SearchError>;
}

/// Lower-cased word tokens of a text.
pub fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(str::to_string)
        .collect()
}

/// Jaccard similarity of two token sets.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

#[derive(Debug, Clone)]
struct IndexedDoc {
    source: String,
    content: String,
    tokens: HashSet<String>,
}

/// Token-overlap search index held in memory.
#[derive(Default)]
pub struct MemoryIndex {
    docs: RwLock<Vec<IndexedDoc>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed documents.
    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }
}

#[async_trait]
impl SearchService for MemoryIndex {
    async fn search(
        &self,
        query: &str,
        k: usize,
        filters: Option<&Map<String, Value>>,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let source_prefix = match filters {
            None => None,
            Some(map) => {
                for key in map.keys() {
                    if key != "source_prefix" {
                        return Err(SearchError::InvalidFilter(key.clone()));
                    }
                }
                map.get("source_prefix").and_then(|v| v.as_str())
            }
        };

        let query_tokens = tokenize(query);
        let docs = self.docs.read().await;

        let mut hits: Vec<SearchHit> = docs
            .iter()
            .filter(|d| source_prefix.map_or(true, |p| d.source.starts_with(p)))
            .map(|d| SearchHit {
                content: d.content.clone(),
                source: d.source.clone(),
                score: jaccard(&query_tokens, &d.tokens),
            })
            .filter(|h| h.score > 0.0)
            .collect();

        // Stable order: score descending, source ascending for ties.
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.source.cmp(&b.source))
        });
        hits.truncate(k);

        Ok(hits)
    }

    async fn ingest(&self, source: &str, content: &str) -> Result<usize, SearchError> {
        if content.trim().is_empty() {
            return Err(SearchError::IngestFailed {
                path: source.to_string(),
                reason: "empty document".to_string(),
            });
        }

        let mut docs = self.docs.write().await;
        // Re-ingesting a source replaces its record.
        docs.retain(|d| d.source != source);
        docs.push(IndexedDoc {
            source: source.to_string(),
            content: content.to_string(),
            tokens: tokenize(content),
        });

        Ok(1)
    }
}
