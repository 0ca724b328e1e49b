//! CLI command definitions for flowforge.
//!
//! The `execute` and `resume` commands build a full orchestrator over a
//! file-backed checkpoint store, so a thread suspended in one invocation
//! can be resumed from a later one. `state`, `threads`, and `sweep` talk
//! to the store directly.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::classifier::TaskType;
use crate::config::PipelineConfig;
use crate::llm::HttpGenerationClient;
use crate::orchestrator::{ExecuteRequest, Orchestrator};
use crate::search::{MemoryIndex, SearchService};
use crate::stages::StageRegistry;
use crate::state::{Decision, HumanDecision, PipelineResult};
use crate::store::{CheckpointStore, FileStore};

/// Default directory for persisted thread state.
const DEFAULT_STORE_DIR: &str = "./flowforge-threads";

/// Task-adaptive pipeline orchestrator with human-in-the-loop checkpoints.
#[derive(Parser)]
#[command(name = "flowforge")]
#[command(about = "Run task-adaptive retrieval pipelines with resumable checkpoints")]
#[command(version)]
#[command(
    long_about = "flowforge classifies a natural-language request, composes a task-specific \
pipeline, and runs it with quality gates and human checkpoints.\n\nSuspended threads persist \
to disk and resume across invocations:\n  flowforge execute \"Compare tokio and async-std\" --corpus ./docs\n  flowforge resume <thread-id> approve --corpus ./docs"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Execute a pipeline for a natural-language request.
    #[command(alias = "exec")]
    Execute(ExecuteArgs),

    /// Resolve a pending checkpoint and continue a suspended thread.
    Resume(ResumeArgs),

    /// Show the state summary of a thread.
    State(StateArgs),

    /// List all persisted thread ids.
    Threads(StoreArgs),

    /// Delete abandoned interrupted threads older than the configured TTL.
    Sweep(StoreArgs),
}

/// Arguments for `flowforge execute`.
#[derive(Parser, Debug)]
pub struct ExecuteArgs {
    /// The natural-language request to run.
    pub query: String,

    /// Force a task type instead of classifying (e.g. simple-qa, comparison).
    #[arg(short, long)]
    pub task_type: Option<String>,

    /// Reuse an existing thread id; a fresh one is generated if absent.
    #[arg(long)]
    pub thread_id: Option<String>,

    /// Directory of .md/.txt files to index for retrieval.
    #[arg(short, long)]
    pub corpus: Option<PathBuf>,

    /// YAML file with threshold overrides.
    #[arg(long)]
    pub overrides: Option<PathBuf>,

    /// Directory for persisted thread state.
    #[arg(short, long, default_value = DEFAULT_STORE_DIR)]
    pub store_dir: PathBuf,

    /// Output the result as JSON.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `flowforge resume`.
#[derive(Parser, Debug)]
pub struct ResumeArgs {
    /// The suspended thread to resume.
    pub thread_id: String,

    /// The decision to apply: approve, edit, or reject.
    pub decision: String,

    /// JSON object of field edits (required for edit).
    #[arg(short, long)]
    pub payload: Option<String>,

    /// Free-text feedback attached to a reject.
    #[arg(short, long)]
    pub feedback: Option<String>,

    /// Directory of .md/.txt files to index for retrieval.
    #[arg(short, long)]
    pub corpus: Option<PathBuf>,

    /// YAML file with threshold overrides.
    #[arg(long)]
    pub overrides: Option<PathBuf>,

    /// Directory for persisted thread state.
    #[arg(short, long, default_value = DEFAULT_STORE_DIR)]
    pub store_dir: PathBuf,

    /// Output the result as JSON.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `flowforge state`.
#[derive(Parser, Debug)]
pub struct StateArgs {
    /// The thread to inspect.
    pub thread_id: String,

    /// Directory for persisted thread state.
    #[arg(short, long, default_value = DEFAULT_STORE_DIR)]
    pub store_dir: PathBuf,
}

/// Arguments for store-only commands.
#[derive(Parser, Debug)]
pub struct StoreArgs {
    /// Directory for persisted thread state.
    #[arg(short, long, default_value = DEFAULT_STORE_DIR)]
    pub store_dir: PathBuf,
}

/// Parse CLI arguments without running a command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Execute(args) => run_execute_command(args).await,
        Commands::Resume(args) => run_resume_command(args).await,
        Commands::State(args) => run_state_command(args).await,
        Commands::Threads(args) => run_threads_command(args).await,
        Commands::Sweep(args) => run_sweep_command(args).await,
    }
}

async fn run_execute_command(args: ExecuteArgs) -> anyhow::Result<()> {
    let task_type = args
        .task_type
        .as_deref()
        .map(|raw| {
            TaskType::parse(raw)
                .ok_or_else(|| anyhow::anyhow!("unknown task type '{raw}'"))
        })
        .transpose()?;

    let orchestrator =
        build_orchestrator(&args.store_dir, args.corpus.as_deref(), args.overrides.as_deref())
            .await?;

    let mut request = ExecuteRequest::new(&args.query);
    request.task_type = task_type;
    request.thread_id = args.thread_id;

    let result = orchestrator.execute(request).await?;
    print_result(&result, args.json)?;
    Ok(())
}

async fn run_resume_command(args: ResumeArgs) -> anyhow::Result<()> {
    let decision = match parse_decision(&args.decision) {
        Some(Decision::Approve) => HumanDecision::approve(),
        Some(Decision::Edit) => {
            let raw = args
                .payload
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("edit requires --payload with a JSON object"))?;
            let payload: serde_json::Value = serde_json::from_str(raw)?;
            if !payload.is_object() {
                anyhow::bail!("--payload must be a JSON object of field edits");
            }
            HumanDecision::edit(payload)
        }
        Some(Decision::Reject) => {
            HumanDecision::reject(args.feedback.as_deref().unwrap_or("rejected"))
        }
        None => anyhow::bail!(
            "unknown decision '{}' (expected approve, edit, or reject)",
            args.decision
        ),
    };

    let orchestrator =
        build_orchestrator(&args.store_dir, args.corpus.as_deref(), args.overrides.as_deref())
            .await?;

    let result = orchestrator.resume(&args.thread_id, decision).await?;
    print_result(&result, args.json)?;
    Ok(())
}

async fn run_state_command(args: StateArgs) -> anyhow::Result<()> {
    let store = FileStore::new(&args.store_dir);
    let state = store.load(&args.thread_id).await?;
    let summary = crate::state::StateSummary::from_state(&state);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run_threads_command(args: StoreArgs) -> anyhow::Result<()> {
    let store = FileStore::new(&args.store_dir);
    for thread_id in store.list_threads().await? {
        println!("{thread_id}");
    }
    Ok(())
}

async fn run_sweep_command(args: StoreArgs) -> anyhow::Result<()> {
    let config = PipelineConfig::from_env()?;
    let store = FileStore::new(&args.store_dir);
    let swept = store.sweep_expired(config.interrupt_ttl).await?;
    info!(swept = swept, "Sweep complete");
    println!("Deleted {swept} abandoned thread(s)");
    Ok(())
}

/// Builds a full orchestrator: env config (plus optional YAML threshold
/// overrides), file-backed store, HTTP generation client, and an in-memory
/// search index populated from the corpus directory.
async fn build_orchestrator(
    store_dir: &Path,
    corpus: Option<&Path>,
    overrides: Option<&Path>,
) -> anyhow::Result<Orchestrator> {
    let mut config = PipelineConfig::from_env()?;
    if let Some(path) = overrides {
        config = config.with_overrides_file(path)?;
    }

    let generation = Arc::new(HttpGenerationClient::from_env()?);
    let index = MemoryIndex::new();
    if let Some(dir) = corpus {
        let ingested = ingest_corpus(&index, dir).await?;
        info!(documents = ingested, corpus = %dir.display(), "Corpus indexed");
    }

    let registry = Arc::new(StageRegistry::with_defaults(
        generation,
        Arc::new(index) as Arc<dyn SearchService>,
        config.temperature,
    ));
    let store = Arc::new(FileStore::new(store_dir));

    Ok(Orchestrator::new(registry, store, config)?)
}

/// Recursively indexes .md and .txt files under `dir`, keyed by path.
async fn ingest_corpus(index: &MemoryIndex, dir: &Path) -> anyhow::Result<usize> {
    let mut count = 0;
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            let indexable = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("md") | Some("txt")
            );
            if !indexable {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            index.ingest(&path.display().to_string(), &content).await?;
            count += 1;
        }
    }

    Ok(count)
}

fn print_result(result: &PipelineResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    println!("thread:  {}", result.thread_id);
    println!("status:  {:?}", result.status);

    if let Some(output) = &result.output {
        println!("\n{output}");
    }

    if let Some(interrupt) = &result.interrupt {
        println!("\ncheckpoint: {}", interrupt.checkpoint_name);
        println!("{}", interrupt.description);
        let allowed: Vec<String> = interrupt
            .allowed_decisions
            .iter()
            .map(|d| d.to_string())
            .collect();
        println!("allowed decisions: {}", allowed.join(", "));
        println!(
            "\nresume with: flowforge resume {} <{}>",
            result.thread_id,
            allowed.join("|")
        );
    }

    for error in &result.errors {
        println!("error: {error}");
    }

    Ok(())
}

/// Parses a decision name the way `resume` accepts it.
fn parse_decision(raw: &str) -> Option<Decision> {
    match raw {
        "approve" => Some(Decision::Approve),
        "edit" => Some(Decision::Edit),
        "reject" => Some(Decision::Reject),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_execute_parses_minimal_invocation() {
        let cli = Cli::parse_from(["flowforge", "execute", "what is rust"]);
        match cli.command {
            Commands::Execute(args) => {
                assert_eq!(args.query, "what is rust");
                assert!(args.task_type.is_none());
                assert!(!args.json);
            }
            _ => panic!("expected execute"),
        }
    }

    #[test]
    fn test_resume_parses_decision_and_payload() {
        let cli = Cli::parse_from([
            "flowforge",
            "resume",
            "thread-1",
            "edit",
            "--payload",
            r#"{"search_queries": ["x"]}"#,
        ]);
        match cli.command {
            Commands::Resume(args) => {
                assert_eq!(args.thread_id, "thread-1");
                assert_eq!(args.decision, "edit");
                assert!(args.payload.is_some());
            }
            _ => panic!("expected resume"),
        }
    }

    #[test]
    fn test_parse_decision_rejects_unknown() {
        assert_eq!(parse_decision("approve"), Some(Decision::Approve));
        assert_eq!(parse_decision("maybe"), None);
    }

    #[test]
    fn test_cli_types_nameable_from_module_root() {
        // Library callers drive run_with_cli with arguments they parsed
        // themselves, so the argument types must be reachable alongside it.
        let cli: crate::cli::Cli =
            crate::cli::Cli::parse_from(["flowforge", "threads", "--store-dir", "/tmp/t"]);
        match cli.command {
            crate::cli::Commands::Threads(args) => {
                assert_eq!(args.store_dir, PathBuf::from("/tmp/t"));
            }
            _ => panic!("expected threads"),
        }
    }
}
