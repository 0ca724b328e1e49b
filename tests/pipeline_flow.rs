//! End-to-end pipeline tests over stub generation and search services.
//!
//! These exercise the full orchestrator surface: classification,
//! composition, checkpoint suspension and resume, quality-gate rewinds,
//! and persistence across orchestrator instances.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use flowforge::config::PipelineConfig;
use flowforge::error::{LlmError, SearchError};
use flowforge::llm::GenerationService;
use flowforge::orchestrator::{ExecuteRequest, Orchestrator};
use flowforge::search::{MemoryIndex, SearchHit, SearchService};
use flowforge::stages::StageRegistry;
use flowforge::state::{HumanDecision, PipelineStatus, ThreadStatus, TransitionStatus};
use flowforge::store::{CheckpointStore, FileStore, MemoryStore};

/// Generation stub: structured analysis for analysis prompts, a fixed
/// answer for synthesis prompts.
struct StubGeneration;

#[async_trait]
impl GenerationService for StubGeneration {
    async fn generate(&self, prompt: &str, _temperature: f64) -> Result<String, LlmError> {
        if prompt.starts_with("Analyze") {
            Ok(r#"{"intent": "conceptual",
                   "sub_topics": ["stateful graphs", "interrupts"],
                   "queries": ["langgraph stateful graphs", "langgraph interrupts"]}"#
                .to_string())
        } else {
            Ok("LangGraph runs stateful graphs with human interrupts.".to_string())
        }
    }
}

/// Generation stub that always fails, for transient-failure paths.
struct BrokenGeneration;

#[async_trait]
impl GenerationService for BrokenGeneration {
    async fn generate(&self, _prompt: &str, _temperature: f64) -> Result<String, LlmError> {
        Err(LlmError::RequestFailed("connection refused".into()))
    }
}

/// Search wrapper that records every query it receives.
struct RecordingSearch {
    inner: MemoryIndex,
    queries: Mutex<Vec<String>>,
}

impl RecordingSearch {
    fn new(inner: MemoryIndex) -> Self {
        Self {
            inner,
            queries: Mutex::new(Vec::new()),
        }
    }

    fn recorded(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchService for RecordingSearch {
    async fn search(
        &self,
        query: &str,
        k: usize,
        filters: Option<&Map<String, Value>>,
    ) -> Result<Vec<SearchHit>, SearchError> {
        self.queries.lock().unwrap().push(query.to_string());
        self.inner.search(query, k, filters).await
    }

    async fn ingest(&self, source: &str, content: &str) -> Result<usize, SearchError> {
        self.inner.ingest(source, content).await
    }
}

/// Four documents with clearly distinct token sets so re-ranking's
/// near-duplicate collapse keeps all of them.
async fn rich_corpus() -> MemoryIndex {
    let index = MemoryIndex::new();
    let docs = [
        (
            "docs/graphs.md",
            "langgraph builds stateful graphs with persistent node channels and cyclic execution",
        ),
        (
            "docs/interrupts.md",
            "langgraph supports human interrupts allowing approval gates before expensive operations",
        ),
        (
            "docs/channels.md",
            "langgraph reducers accumulate partial updates across supersteps into shared values",
        ),
        (
            "docs/compare.md",
            "langgraph offers finer branching control than linear chain abstractions provide",
        ),
    ];
    for (source, content) in docs {
        index.ingest(source, content).await.unwrap();
    }
    index
}

/// A corpus too small to ever satisfy `min_result_count`.
async fn thin_corpus() -> MemoryIndex {
    let index = MemoryIndex::new();
    index
        .ingest("docs/only.md", "langgraph stateful graphs single note")
        .await
        .unwrap();
    index
}

/// Thresholds loose enough that the rich corpus passes the quality gate.
fn permissive_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.thresholds.quality_threshold = 0.05;
    config.thresholds.coverage_threshold = 0.05;
    config.retry_backoff = Duration::from_millis(1);
    config
}

fn orchestrator_over(
    generation: Arc<dyn GenerationService>,
    search: Arc<dyn SearchService>,
    store: Arc<dyn CheckpointStore>,
    config: PipelineConfig,
) -> Orchestrator {
    let registry = Arc::new(StageRegistry::with_defaults(
        generation,
        search,
        config.temperature,
    ));
    Orchestrator::new(registry, store, config).unwrap()
}

async fn default_orchestrator(config: PipelineConfig) -> Orchestrator {
    orchestrator_over(
        Arc::new(StubGeneration),
        Arc::new(rich_corpus().await),
        Arc::new(MemoryStore::new()),
        config,
    )
}

#[tokio::test]
async fn test_simple_qa_completes_in_one_call() {
    let orch = default_orchestrator(permissive_config()).await;

    let result = orch
        .execute(ExecuteRequest::new("What is LangGraph?"))
        .await
        .unwrap();

    assert_eq!(result.status, PipelineStatus::Completed);
    assert!(result.interrupt.is_none());
    assert!(result.errors.is_empty());
    assert_eq!(
        result.stages_executed,
        vec!["query_analysis", "retrieval", "synthesize"]
    );
    assert!(result.output.unwrap().contains("LangGraph"));
}

#[tokio::test]
async fn test_explanation_suspends_after_passing_quality_gate() {
    let orch = default_orchestrator(permissive_config()).await;

    let result = orch
        .execute(
            ExecuteRequest::new("Explain how LangGraph checkpointing works")
                .with_thread_id("explain-1"),
        )
        .await
        .unwrap();

    // The gate passed (no rewind recorded), so the quality checkpoint fires.
    assert_eq!(result.status, PipelineStatus::Interrupted);
    let interrupt = result.interrupt.unwrap();
    assert_eq!(interrupt.checkpoint_name, "quality_assess");
    assert!(interrupt.description.contains("score"));

    let state = orch.state("explain-1").await.unwrap();
    assert_eq!(state.status, ThreadStatus::Interrupted);

    let finished = orch
        .resume("explain-1", HumanDecision::approve())
        .await
        .unwrap();
    assert_eq!(finished.status, PipelineStatus::Completed);
    assert!(finished.output.is_some());
}

#[tokio::test]
async fn test_long_form_walks_every_checkpoint() {
    let orch = default_orchestrator(permissive_config()).await;

    let mut result = orch
        .execute(
            ExecuteRequest::new("Write a comprehensive guide on LangGraph")
                .with_thread_id("guide-1"),
        )
        .await
        .unwrap();

    let mut visited = Vec::new();
    while result.status == PipelineStatus::Interrupted {
        let interrupt = result.interrupt.as_ref().unwrap();
        visited.push(interrupt.checkpoint_name.clone());
        result = orch
            .resume("guide-1", HumanDecision::approve())
            .await
            .unwrap();
    }

    assert_eq!(result.status, PipelineStatus::Completed);
    assert_eq!(
        visited,
        vec![
            "query_analysis",
            "retrieval",
            "rerank",
            "quality_assess",
            "synthesize"
        ]
    );
    assert!(result.output.is_some());
}

#[tokio::test]
async fn test_edit_decision_redirects_retrieval() {
    let search = Arc::new(RecordingSearch::new(rich_corpus().await));
    let orch = orchestrator_over(
        Arc::new(StubGeneration),
        Arc::clone(&search) as Arc<dyn SearchService>,
        Arc::new(MemoryStore::new()),
        permissive_config(),
    );

    // Long-form suspends at query_analysis before any search runs.
    orch.execute(
        ExecuteRequest::new("Write a comprehensive guide on LangGraph")
            .with_thread_id("edit-1"),
    )
    .await
    .unwrap();
    assert!(search.recorded().is_empty());

    orch.resume(
        "edit-1",
        HumanDecision::edit(json!({
            "search_queries": ["langgraph interrupts"],
            "retrieval_strategy": "focused"
        })),
    )
    .await
    .unwrap();

    // Focused retrieval runs exactly the edited query.
    assert_eq!(search.recorded(), vec!["langgraph interrupts"]);
}

#[tokio::test]
async fn test_reject_reruns_the_rewind_target() {
    let store = Arc::new(MemoryStore::new());
    let orch = orchestrator_over(
        Arc::new(StubGeneration),
        Arc::new(rich_corpus().await),
        Arc::clone(&store) as Arc<dyn CheckpointStore>,
        permissive_config(),
    );

    orch.execute(
        ExecuteRequest::new("Compare LangGraph and plain chains")
            .with_thread_id("cmp-1"),
    )
    .await
    .unwrap();

    let state = orch.state("cmp-1").await.unwrap();
    assert_eq!(state.pending_checkpoint.as_deref(), Some("retrieval"));

    let result = orch
        .resume("cmp-1", HumanDecision::reject("need newer sources"))
        .await
        .unwrap();

    // Retrieval re-ran and suspended at its checkpoint again.
    assert_eq!(result.status, PipelineStatus::Interrupted);
    assert_eq!(result.interrupt.unwrap().checkpoint_name, "retrieval");

    let state = store.load("cmp-1").await.unwrap();
    assert_eq!(state.retry_count("retrieval"), 1);
    assert!(state.history.iter().any(|t| {
        t.status == TransitionStatus::Rewound
            && t.note.as_deref().is_some_and(|n| n.contains("need newer sources"))
    }));
}

#[tokio::test]
async fn test_quality_loop_is_bounded_and_broadens() {
    // Default thresholds demand at least 3 ranked documents; the thin
    // corpus can never provide them.
    let mut config = PipelineConfig::default();
    config.retry_backoff = Duration::from_millis(1);
    let store = Arc::new(MemoryStore::new());
    let orch = orchestrator_over(
        Arc::new(StubGeneration),
        Arc::new(thin_corpus().await),
        Arc::clone(&store) as Arc<dyn CheckpointStore>,
        config,
    );

    let result = orch
        .execute(
            ExecuteRequest::new("Verify that LangGraph persists state")
                .with_thread_id("verify-1"),
        )
        .await
        .unwrap();

    assert_eq!(result.status, PipelineStatus::Failed);
    assert!(result
        .errors
        .iter()
        .any(|e| e.contains("insufficient quality after 2 retries")));

    let state = store.load("verify-1").await.unwrap();
    assert_eq!(state.status, ThreadStatus::Failed);
    // Exactly max_retries rewinds, then terminal failure.
    assert_eq!(state.retry_count("retrieval"), 2);
    let rewinds = state
        .history
        .iter()
        .filter(|t| t.status == TransitionStatus::Rewound)
        .count();
    assert_eq!(rewinds, 2);
    // The re-entry hint broadened the retrieval strategy.
    assert_eq!(state.fields["retrieval_strategy"], json!("broad"));
}

#[tokio::test]
async fn test_thread_survives_orchestrator_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let orch = orchestrator_over(
            Arc::new(StubGeneration),
            Arc::new(rich_corpus().await),
            Arc::new(FileStore::new(dir.path())),
            permissive_config(),
        );
        let result = orch
            .execute(
                ExecuteRequest::new("Write a comprehensive guide on LangGraph")
                    .with_thread_id("restart-1"),
            )
            .await
            .unwrap();
        assert_eq!(result.status, PipelineStatus::Interrupted);
    }

    // A fresh orchestrator over the same directory picks the thread up.
    let orch = orchestrator_over(
        Arc::new(StubGeneration),
        Arc::new(rich_corpus().await),
        Arc::new(FileStore::new(dir.path())),
        permissive_config(),
    );
    let result = orch
        .resume("restart-1", HumanDecision::approve())
        .await
        .unwrap();
    assert_eq!(result.status, PipelineStatus::Interrupted);
    assert_eq!(result.interrupt.unwrap().checkpoint_name, "retrieval");
}

#[tokio::test]
async fn test_concurrent_threads_are_isolated() {
    let store = Arc::new(MemoryStore::new());
    let orch = Arc::new(orchestrator_over(
        Arc::new(StubGeneration),
        Arc::new(rich_corpus().await),
        Arc::clone(&store) as Arc<dyn CheckpointStore>,
        permissive_config(),
    ));

    let a = {
        let orch = Arc::clone(&orch);
        tokio::spawn(async move {
            orch.execute(ExecuteRequest::new("What is LangGraph?").with_thread_id("iso-a"))
                .await
        })
    };
    let b = {
        let orch = Arc::clone(&orch);
        tokio::spawn(async move {
            orch.execute(ExecuteRequest::new("What is a reducer?").with_thread_id("iso-b"))
                .await
        })
    };

    let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
    assert_eq!(a.status, PipelineStatus::Completed);
    assert_eq!(b.status, PipelineStatus::Completed);
    assert_ne!(a.thread_id, b.thread_id);

    // Each thread kept its own task text.
    let state_a = store.load("iso-a").await.unwrap();
    let state_b = store.load("iso-b").await.unwrap();
    assert_eq!(state_a.task.raw_text, "What is LangGraph?");
    assert_eq!(state_b.task.raw_text, "What is a reducer?");
}

#[tokio::test]
async fn test_persistent_stage_failure_fails_the_thread() {
    let mut config = permissive_config();
    config.stage_retry_limit = 1;
    let orch = orchestrator_over(
        Arc::new(BrokenGeneration),
        Arc::new(rich_corpus().await),
        Arc::new(MemoryStore::new()),
        config,
    );

    let result = orch
        .execute(ExecuteRequest::new("What is LangGraph?").with_thread_id("broken-1"))
        .await
        .unwrap();

    assert_eq!(result.status, PipelineStatus::Failed);
    assert!(result
        .errors
        .iter()
        .any(|e| e.contains("query_analysis") && e.contains("connection refused")));
    assert!(result.output.is_none());
}

#[tokio::test]
async fn test_repeated_rejects_exhaust_the_budget() {
    let mut config = permissive_config();
    config.thresholds.max_retries = 1;
    let orch = orchestrator_over(
        Arc::new(StubGeneration),
        Arc::new(rich_corpus().await),
        Arc::new(MemoryStore::new()),
        config,
    );

    orch.execute(
        ExecuteRequest::new("Compare LangGraph and plain chains")
            .with_thread_id("stubborn-1"),
    )
    .await
    .unwrap();

    // First reject fits the budget and re-runs retrieval.
    let result = orch
        .resume("stubborn-1", HumanDecision::reject("no"))
        .await
        .unwrap();
    assert_eq!(result.status, PipelineStatus::Interrupted);

    // Second reject exceeds it and fails the thread.
    let result = orch
        .resume("stubborn-1", HumanDecision::reject("still no"))
        .await
        .unwrap();
    assert_eq!(result.status, PipelineStatus::Failed);

    // A finished thread refuses further decisions.
    let err = orch
        .resume("stubborn-1", HumanDecision::approve())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("finished"));
}

#[tokio::test]
async fn test_classification_can_be_overridden() {
    let orch = default_orchestrator(permissive_config()).await;

    // "What is ..." would classify as simple QA; force summarization,
    // whose workflow carries a synthesis checkpoint.
    let result = orch
        .execute(
            ExecuteRequest::new("What is LangGraph?")
                .with_task_type(flowforge::TaskType::Summarization)
                .with_thread_id("forced-1"),
        )
        .await
        .unwrap();

    assert_eq!(result.status, PipelineStatus::Interrupted);
    assert_eq!(result.interrupt.unwrap().checkpoint_name, "synthesize");
}
