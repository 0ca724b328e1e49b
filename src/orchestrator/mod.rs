//! The orchestrator: a resumable, checkpointed pipeline state machine.
//!
//! Given a workflow definition and per-thread execution state, the
//! orchestrator drives stages in order, consults the quality gate after
//! assessment stages, raises structured interrupts at checkpoints, and
//! applies resume decisions. Suspension is simply "persist state and
//! return": no blocked task, no callback registry, resumable from a
//! different process.
//!
//! Concurrency model: calls for the same thread id are serialized through a
//! per-thread async mutex; calls for distinct threads proceed fully in
//! parallel with no shared mutable state beyond the checkpoint store.

use chrono::Utc;
use rand::Rng;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::classifier::{TaskClassifier, TaskType};
use crate::config::PipelineConfig;
use crate::error::{OrchestratorError, StageError};
use crate::gate::{GateOutcome, QualityGate};
use crate::stages::{StageInput, StageOutput, StageRegistry};
use crate::state::{
    Decision, ExecutionState, HumanDecision, PendingInterrupt, PipelineResult, StageTransition,
    StateSummary, Task, ThreadStatus, TransitionStatus,
};
use crate::store::CheckpointStore;
use crate::workflow::{
    render_description, StageKind, StageSpec, WorkflowComposer, WorkflowDefinition,
};

/// Maximum random jitter added to each retry backoff step.
const BACKOFF_JITTER_MS: u64 = 50;

/// A request to start (or re-enter) a pipeline execution.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    /// The raw natural-language request.
    pub query: String,
    /// Skip classification and force a task type.
    pub task_type: Option<TaskType>,
    /// Reuse an existing thread id; a fresh one is generated if absent.
    pub thread_id: Option<String>,
}

impl ExecuteRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            task_type: None,
            thread_id: None,
        }
    }

    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }
}

/// Aggregate counters across all threads handled by this orchestrator.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    /// Threads started.
    pub executions: u64,
    /// Threads that reached `completed`.
    pub completed: u64,
    /// Suspensions returned to callers.
    pub interruptions: u64,
    /// Threads that reached `failed`.
    pub failed: u64,
    /// Quality-driven rewinds applied.
    pub quality_rewinds: u64,
    /// Resume calls that applied a valid decision.
    pub resumes: u64,
    /// Average wall-clock duration of terminal runs.
    pub average_duration: Duration,
    /// Terminal runs measured for the average.
    terminal_runs: u64,
}

impl PipelineStats {
    fn record_terminal(&mut self, duration: Duration) {
        self.terminal_runs += 1;
        if self.terminal_runs == 1 {
            self.average_duration = duration;
        } else {
            // Incremental average: avg = avg + (new - avg) / n
            let n = self.terminal_runs as f64;
            let old_avg = self.average_duration.as_secs_f64();
            let new_avg = old_avg + (duration.as_secs_f64() - old_avg) / n;
            self.average_duration = Duration::from_secs_f64(new_avg);
        }
    }
}

/// The pipeline orchestrator and its caller-facing service surface.
pub struct Orchestrator {
    classifier: TaskClassifier,
    composer: WorkflowComposer,
    registry: Arc<StageRegistry>,
    store: Arc<dyn CheckpointStore>,
    gate: QualityGate,
    config: PipelineConfig,
    /// Per-thread serialization locks, created on first use.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    stats: RwLock<PipelineStats>,
}

impl Orchestrator {
    /// Creates an orchestrator over the given stage registry and store.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError` if the classifier rules fail to build,
    /// the composition table is invalid, or the table references a stage
    /// kind the registry has no implementation for.
    pub fn new(
        registry: Arc<StageRegistry>,
        store: Arc<dyn CheckpointStore>,
        config: PipelineConfig,
    ) -> Result<Self, OrchestratorError> {
        let classifier = TaskClassifier::new()?;
        let composer = WorkflowComposer::new(config.thresholds)?;
        composer.validate_registry(&registry)?;

        Ok(Self {
            classifier,
            composer,
            registry,
            store,
            gate: QualityGate::new(),
            config,
            locks: Mutex::new(HashMap::new()),
            stats: RwLock::new(PipelineStats::default()),
        })
    }

    /// Starts or continues a pipeline execution.
    ///
    /// For a new thread id this classifies the request, composes the
    /// workflow, and runs until completion, failure, or the first
    /// checkpoint. Calling `execute` again on a suspended thread returns
    /// its current interrupt payload without re-running anything.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError` for composition and persistence
    /// failures. Stage failures do not error; they surface as a result
    /// with `status: failed`.
    pub async fn execute(&self, request: ExecuteRequest) -> Result<PipelineResult, OrchestratorError> {
        let thread_id = request
            .thread_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let _guard = self.lock_thread(&thread_id).await;

        let mut state = match self.store.load(&thread_id).await {
            Ok(state) => match state.status {
                // A suspended or finished thread re-reports its result.
                ThreadStatus::Interrupted | ThreadStatus::Completed | ThreadStatus::Failed => {
                    return Ok(PipelineResult::from_state(&state));
                }
                // A thread persisted mid-run (crash recovery) continues
                // from its last checkpointed stage index.
                ThreadStatus::Running => state,
            },
            Err(crate::error::StoreError::NotFound(_)) => {
                let task_type = request
                    .task_type
                    .unwrap_or_else(|| self.classifier.classify(&request.query));
                tracing::info!(
                    thread_id = %thread_id,
                    task_type = %task_type,
                    "Starting new pipeline thread"
                );
                self.stats.write().await.executions += 1;
                ExecutionState::new(&thread_id, Task::new(&request.query, task_type))
            }
            Err(e) => return Err(e.into()),
        };

        let workflow = self.composer.compose(state.task.task_type)?;
        self.run_loop(&mut state, &workflow).await
    }

    /// Resolves a pending checkpoint and continues execution.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the thread does not exist
    /// - `NoPendingInterrupt` if the thread is not suspended
    /// - `ThreadFinished` if the thread already completed or failed
    /// - `InvalidDecision` if the decision is not allowed at this
    ///   checkpoint; execution state is left untouched
    pub async fn resume(
        &self,
        thread_id: &str,
        decision: HumanDecision,
    ) -> Result<PipelineResult, OrchestratorError> {
        let _guard = self.lock_thread(thread_id).await;

        let mut state = self.store.load(thread_id).await?;

        match state.status {
            ThreadStatus::Completed | ThreadStatus::Failed => {
                return Err(OrchestratorError::ThreadFinished {
                    thread_id: thread_id.to_string(),
                    status: state.status.to_string(),
                });
            }
            ThreadStatus::Running | ThreadStatus::Interrupted => {}
        }

        let Some(pending) = state.pending_interrupt.clone() else {
            return Err(OrchestratorError::NoPendingInterrupt {
                thread_id: thread_id.to_string(),
            });
        };

        // Validate before any mutation: an invalid decision must leave the
        // persisted state byte-identical.
        if !pending.allowed_decisions.contains(&decision.decision) {
            return Err(OrchestratorError::InvalidDecision {
                checkpoint: pending.checkpoint_name,
                got: decision.decision,
                allowed: pending.allowed_decisions,
            });
        }

        let workflow = self.composer.compose(state.task.task_type)?;

        tracing::info!(
            thread_id = %thread_id,
            checkpoint = %pending.checkpoint_name,
            decision = %decision.decision,
            "Applying checkpoint decision"
        );

        match decision.decision {
            Decision::Approve => {
                push_transition(
                    &mut state,
                    &pending.checkpoint_name,
                    TransitionStatus::DecisionApplied,
                    Some("approved".to_string()),
                );
                state.current_stage_index = pending.stage_index + 1;
            }
            Decision::Edit => {
                if let Some(Value::Object(edits)) = &decision.payload {
                    for (key, value) in edits {
                        state.fields.insert(key.clone(), value.clone());
                    }
                }
                push_transition(
                    &mut state,
                    &pending.checkpoint_name,
                    TransitionStatus::DecisionApplied,
                    Some("edited".to_string()),
                );
                state.current_stage_index = pending.stage_index + 1;
            }
            Decision::Reject => {
                let feedback = decision
                    .payload
                    .as_ref()
                    .and_then(|p| p.as_str())
                    .unwrap_or("rejected");
                let count = state.record_rewind(&pending.rewind_target);

                if count > workflow.thresholds.max_retries {
                    push_transition(
                        &mut state,
                        &pending.checkpoint_name,
                        TransitionStatus::Failed,
                        Some(format!(
                            "rejected {} times at '{}', exceeding the retry budget of {}",
                            count, pending.checkpoint_name, workflow.thresholds.max_retries
                        )),
                    );
                    state.pending_interrupt = None;
                    state.status = ThreadStatus::Failed;
                    self.persist(&mut state).await?;
                    self.stats.write().await.failed += 1;
                    return Ok(PipelineResult::from_state(&state));
                }

                push_transition(
                    &mut state,
                    &pending.checkpoint_name,
                    TransitionStatus::Rewound,
                    Some(format!("rejected: {}", feedback)),
                );
                state.current_stage_index = workflow
                    .stage_index(&pending.rewind_target)
                    .unwrap_or(pending.stage_index);
            }
        }

        state.pending_interrupt = None;
        state.status = ThreadStatus::Running;
        self.stats.write().await.resumes += 1;

        self.run_loop(&mut state, &workflow).await
    }

    /// Returns a summary of a thread's state for session listings.
    pub async fn state(&self, thread_id: &str) -> Result<StateSummary, OrchestratorError> {
        let state = self.store.load(thread_id).await?;
        Ok(StateSummary::from_state(&state))
    }

    /// Lists all stored thread ids.
    pub async fn threads(&self) -> Result<Vec<String>, OrchestratorError> {
        Ok(self.store.list_threads().await?)
    }

    /// Deletes abandoned interrupted threads older than the configured TTL.
    pub async fn sweep_abandoned(&self) -> Result<usize, OrchestratorError> {
        Ok(self.store.sweep_expired(self.config.interrupt_ttl).await?)
    }

    /// Current aggregate statistics.
    pub async fn stats(&self) -> PipelineStats {
        self.stats.read().await.clone()
    }

    /// Acquires the per-thread serialization lock.
    ///
    /// Idle entries are pruned on each acquisition: a lock whose `Arc` is
    /// held only by the map has no live guard and no waiter, so the map
    /// stays proportional to the number of in-flight threads.
    async fn lock_thread(&self, thread_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(
                locks
                    .entry(thread_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    /// Persists state with a fresh timestamp.
    async fn persist(&self, state: &mut ExecutionState) -> Result<(), OrchestratorError> {
        state.updated_at = Utc::now();
        self.store.save(state).await?;
        Ok(())
    }

    /// The main transition loop: runs stages from `current_stage_index`
    /// until completion, failure, or a checkpoint suspension. State is
    /// persisted at every iteration boundary, so the loop is safely
    /// re-entrant after a crash.
    async fn run_loop(
        &self,
        state: &mut ExecutionState,
        workflow: &WorkflowDefinition,
    ) -> Result<PipelineResult, OrchestratorError> {
        let run_started = Instant::now();

        while state.current_stage_index < workflow.stages.len() {
            let spec = &workflow.stages[state.current_stage_index];
            let input = self.build_input(state, workflow, spec);

            let (output, duration) = match self.run_stage_bounded(spec, &input).await {
                Ok(run) => run,
                Err(reason) => {
                    tracing::warn!(
                        thread_id = %state.thread_id,
                        stage = %spec.name,
                        "Stage failed after retries: {}",
                        reason
                    );
                    push_transition(
                        &mut *state,
                        &spec.name,
                        TransitionStatus::Failed,
                        Some(reason),
                    );
                    state.status = ThreadStatus::Failed;
                    self.persist(state).await?;
                    self.stats.write().await.failed += 1;
                    self.stats
                        .write()
                        .await
                        .record_terminal(run_started.elapsed());
                    return Ok(PipelineResult::from_state(state));
                }
            };

            state.merge_outputs(output.fields, &spec.outputs);
            let attempt = state.retry_count(&spec.name) + 1;
            state.history.push(StageTransition {
                stage: spec.name.clone(),
                attempt,
                status: TransitionStatus::Completed,
                at: Utc::now(),
                duration_ms: duration.as_millis() as u64,
                quality: None,
                note: None,
            });

            if spec.kind == StageKind::QualityAssess {
                let report = self.gate.evaluate(&state.fields, &workflow.thresholds);
                if let Some(last) = state.history.last_mut() {
                    last.quality = Some(report.clone());
                }

                let target_retries = workflow
                    .stage_of_kind(StageKind::Retrieval)
                    .map(|s| state.retry_count(&s.name))
                    .unwrap_or(0);

                match self.gate.decide(&report, workflow, target_retries) {
                    GateOutcome::Continue => {}
                    GateOutcome::Reenter {
                        target,
                        hint,
                        reason,
                    } => {
                        tracing::info!(
                            thread_id = %state.thread_id,
                            target = %target,
                            "Quality gate rewind: {}",
                            reason
                        );
                        state.record_rewind(&target);
                        for (key, value) in hint {
                            state.fields.insert(key, value);
                        }
                        push_transition(
                            &mut *state,
                            &spec.name,
                            TransitionStatus::Rewound,
                            Some(reason),
                        );
                        state.current_stage_index =
                            workflow.stage_index(&target).unwrap_or(0);
                        self.stats.write().await.quality_rewinds += 1;
                        self.persist(state).await?;
                        continue;
                    }
                    GateOutcome::Fail { reason } => {
                        push_transition(
                            &mut *state,
                            &spec.name,
                            TransitionStatus::Failed,
                            Some(reason),
                        );
                        state.status = ThreadStatus::Failed;
                        self.persist(state).await?;
                        self.stats.write().await.failed += 1;
                        self.stats
                            .write()
                            .await
                            .record_terminal(run_started.elapsed());
                        return Ok(PipelineResult::from_state(state));
                    }
                }
            }

            if let Some(checkpoint) = workflow.checkpoints.get(&spec.name) {
                let description = render_description(
                    &checkpoint.description_template,
                    &state.task.raw_text,
                    &state.fields,
                );
                state.pending_interrupt = Some(PendingInterrupt {
                    checkpoint_name: spec.name.clone(),
                    stage_index: state.current_stage_index,
                    description,
                    allowed_decisions: checkpoint.allowed_decisions.clone(),
                    rewind_target: checkpoint.rewind_target.clone(),
                    raised_at: Utc::now(),
                });
                state.status = ThreadStatus::Interrupted;
                self.persist(state).await?;
                self.stats.write().await.interruptions += 1;
                tracing::info!(
                    thread_id = %state.thread_id,
                    checkpoint = %spec.name,
                    "Suspending at checkpoint"
                );
                return Ok(PipelineResult::from_state(state));
            }

            state.current_stage_index += 1;
            self.persist(state).await?;
        }

        state.status = ThreadStatus::Completed;
        self.persist(state).await?;
        {
            let mut stats = self.stats.write().await;
            stats.completed += 1;
            stats.record_terminal(run_started.elapsed());
        }
        tracing::info!(thread_id = %state.thread_id, "Pipeline completed");
        Ok(PipelineResult::from_state(state))
    }

    /// Copies the declared input fields out of execution state.
    fn build_input(
        &self,
        state: &ExecutionState,
        workflow: &WorkflowDefinition,
        spec: &StageSpec,
    ) -> StageInput {
        let mut fields = Map::new();
        for name in &spec.inputs {
            if let Some(value) = state.fields.get(name) {
                fields.insert(name.clone(), value.clone());
            }
        }

        StageInput {
            stage: spec.name.clone(),
            query: state.task.raw_text.clone(),
            task_type: state.task.task_type,
            fields,
            thresholds: workflow.thresholds,
        }
    }

    /// Runs one stage with a per-attempt timeout and bounded exponential
    /// backoff. Returns the terse failure reason once retries are
    /// exhausted; the orchestrator turns that into a failed result, never
    /// a bare stack trace.
    async fn run_stage_bounded(
        &self,
        spec: &StageSpec,
        input: &StageInput,
    ) -> Result<(StageOutput, Duration), String> {
        let Some(stage) = self.registry.get(spec.kind) else {
            return Err(format!(
                "no implementation registered for stage kind '{}'",
                spec.kind
            ));
        };

        let mut last_error = String::new();

        for attempt in 0..=self.config.stage_retry_limit {
            if attempt > 0 {
                let jitter = rand::thread_rng().gen_range(0..BACKOFF_JITTER_MS);
                let backoff = self.config.retry_backoff * 2u32.pow(attempt - 1)
                    + Duration::from_millis(jitter);
                tracing::debug!(
                    stage = %spec.name,
                    attempt = attempt,
                    "Retrying stage after {:?}",
                    backoff
                );
                tokio::time::sleep(backoff).await;
            }

            let started = Instant::now();
            match tokio::time::timeout(self.config.stage_timeout, stage.run(input)).await {
                Ok(Ok(output)) => return Ok((output, started.elapsed())),
                Ok(Err(e)) => {
                    tracing::warn!(stage = %spec.name, attempt = attempt, "Stage error: {}", e);
                    last_error = format!("stage '{}' failed: {}", spec.name, e);
                }
                Err(_) => {
                    let timeout = StageError::Timeout {
                        stage: spec.name.clone(),
                        seconds: self.config.stage_timeout.as_secs(),
                    };
                    tracing::warn!(stage = %spec.name, attempt = attempt, "{}", timeout);
                    last_error = timeout.to_string();
                }
            }
        }

        Err(last_error)
    }
}

fn push_transition(
    state: &mut ExecutionState,
    stage: &str,
    status: TransitionStatus,
    note: Option<String>,
) {
    let attempt = state.retry_count(stage) + 1;
    state.history.push(StageTransition {
        stage: stage.to_string(),
        attempt,
        status,
        at: Utc::now(),
        duration_ms: 0,
        quality: None,
        note,
    });
}
