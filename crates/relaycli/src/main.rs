// crates/relaycli/src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relaycore::{ExecutionEvent, NodeEvent, NodeId, NodeSpec, Workflow, WorkflowId};
use relayruntime::{
    build_execution_order, persist, RelayRuntime, RunOutcome, RuntimeConfig, StopFileSource,
    StopPoller,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Resumable pipeline runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Run input as a JSON string
        #[arg(short, long)]
        input: Option<String>,

        /// Save a checkpoint file after every completed node
        #[arg(short, long)]
        checkpoint_dir: Option<PathBuf>,

        /// Directory watched for `<workflow_id>.stop` marker files
        #[arg(long)]
        stop_dir: Option<PathBuf>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Resume a workflow from checkpoints saved by `run`
    Resume {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Directory the checkpoints were saved to
        #[arg(short, long)]
        checkpoint_dir: PathBuf,

        /// Continue after this node (default: the latest checkpoint)
        #[arg(long)]
        from: Option<Uuid>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            checkpoint_dir,
            stop_dir,
            verbose,
        } => {
            init_tracing(verbose);
            run_workflow(file, input, checkpoint_dir, stop_dir).await?;
        }

        Commands::Resume {
            file,
            checkpoint_dir,
            from,
            verbose,
        } => {
            init_tracing(verbose);
            resume_workflow(file, checkpoint_dir, from).await?;
        }

        Commands::Validate { file } => {
            validate_workflow(file)?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_workflow(output)?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

fn load_workflow(file: &Path) -> Result<Workflow> {
    let workflow_json = std::fs::read_to_string(file)
        .with_context(|| format!("reading workflow file {}", file.display()))?;
    let workflow: Workflow = serde_json::from_str(&workflow_json)
        .with_context(|| format!("parsing workflow file {}", file.display()))?;
    Ok(workflow)
}

async fn build_runtime(workflow: &Workflow) -> Result<Arc<RelayRuntime>> {
    let registry = Arc::new(relaynodes::standard_registry());
    registry.validate(workflow)?;

    let runtime = Arc::new(RelayRuntime::with_registry(
        registry,
        RuntimeConfig::from_env()?,
    ));
    runtime.register_workflow(workflow.clone()).await?;
    Ok(runtime)
}

/// Print events as they arrive; with a checkpoint dir, also write each new
/// checkpoint to disk. Missed writes are caught up by `persist::save_run`
/// once the run returns.
fn spawn_event_listener(
    runtime: Arc<RelayRuntime>,
    workflow: &Workflow,
    checkpoint_dir: Option<PathBuf>,
) -> JoinHandle<()> {
    let names: HashMap<NodeId, String> = workflow
        .nodes
        .iter()
        .map(|n| (n.id, n.display_name().to_string()))
        .collect();
    let name_of = move |id: &NodeId| names.get(id).cloned().unwrap_or_else(|| id.to_string());
    let mut events = runtime.subscribe_events();

    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(missed)) => {
                    eprintln!("     ⚠️  output fell behind, {} events skipped", missed);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match event {
                ExecutionEvent::WorkflowStarted {
                    start_index,
                    total_nodes,
                    ..
                } => {
                    if start_index == 0 {
                        println!("▶️  Workflow started ({} nodes)", total_nodes);
                    } else {
                        println!("▶️  Continuing at node {}/{}", start_index + 1, total_nodes);
                    }
                }
                ExecutionEvent::NodeStarted {
                    node_id, node_type, ..
                } => {
                    println!("  ⚡ Starting node: {} ({})", name_of(&node_id), node_type);
                }
                ExecutionEvent::NodeCompleted(progress) => {
                    println!(
                        "  ✅ Node {} completed [{:.0}%]",
                        progress.node_name, progress.progress
                    );
                    if let Some(dir) = &checkpoint_dir {
                        if let Some(checkpoint) =
                            runtime.checkpoint(progress.workflow_id, progress.node_id)
                        {
                            if let Err(e) = persist::save_checkpoint(dir, &checkpoint) {
                                eprintln!("     ⚠️  could not save checkpoint: {}", e);
                            }
                        }
                    }
                }
                ExecutionEvent::NodeFailed { node_id, error, .. } => {
                    println!("  ❌ Node {} failed: {}", name_of(&node_id), error);
                }
                ExecutionEvent::NodeEvent { node_id, event, .. } => match event {
                    NodeEvent::Info { message } => {
                        println!("     ℹ️  [{}] {}", name_of(&node_id), message);
                    }
                    NodeEvent::Warning { message } => {
                        println!("     ⚠️  [{}] {}", name_of(&node_id), message);
                    }
                    NodeEvent::Progress { percent, message } => {
                        if let Some(msg) = message {
                            println!("     📊 [{}] {}% - {}", name_of(&node_id), percent, msg);
                        } else {
                            println!("     📊 [{}] {}%", name_of(&node_id), percent);
                        }
                    }
                    NodeEvent::Partial { .. } => {}
                },
                ExecutionEvent::WorkflowPaused { .. } => println!("⏸️  Workflow paused"),
                ExecutionEvent::WorkflowResumed { .. } => println!("⏯️  Workflow resumed"),
                ExecutionEvent::WorkflowStopped { .. } => {
                    println!("⏹️  Stop requested; finishing the current node")
                }
                ExecutionEvent::WorkflowCompleted {
                    status,
                    duration_ms,
                    ..
                } => {
                    println!("🏁 Workflow {} after {}ms", status, duration_ms);
                }
            }
        }
    })
}

/// Stop the run on Ctrl-C; the in-flight node is allowed to finish.
fn spawn_ctrl_c(runtime: Arc<RelayRuntime>, workflow_id: WorkflowId) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            runtime.stop(workflow_id);
        }
    })
}

fn print_outcome(
    workflow: &Workflow,
    result: &relaycore::Result<RunOutcome>,
    checkpoint_dir: Option<&Path>,
    file: &Path,
) {
    println!();
    println!("📊 Execution Summary:");
    match result {
        Ok(RunOutcome::Completed(result)) => {
            println!("   Completed: {}/{} nodes", result.completed_nodes, result.total_nodes);
            println!("   Duration: {}ms", result.duration_ms);
            println!();
            println!("📤 Outputs:");
            for node in &workflow.nodes {
                if let Some(value) = result.outputs.get(&node.id) {
                    println!("   {}: {}", node.display_name(), value);
                }
            }
        }
        Ok(RunOutcome::Stopped {
            completed_nodes,
            total_nodes,
            ..
        }) => {
            println!("   Stopped after {}/{} nodes", completed_nodes, total_nodes);
        }
        Err(e) => {
            println!("   Failed: {}", e);
        }
    }

    let finished = matches!(result, Ok(RunOutcome::Completed(_)));
    if let (false, Some(dir)) = (finished, checkpoint_dir) {
        println!();
        println!("Resume with:");
        println!(
            "  relay resume --file {} --checkpoint-dir {}",
            file.display(),
            dir.display()
        );
    }
}

async fn run_workflow(
    file: PathBuf,
    input: Option<String>,
    checkpoint_dir: Option<PathBuf>,
    stop_dir: Option<PathBuf>,
) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());
    let workflow = load_workflow(&file)?;
    let workflow_id = workflow.id;

    println!("📋 Workflow: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Edges: {}", workflow.edges.len());
    println!();

    let input: serde_json::Value = match input {
        Some(input_str) => serde_json::from_str(&input_str).context("parsing --input")?,
        None => serde_json::Value::Null,
    };

    let runtime = build_runtime(&workflow).await?;
    if let Some(dir) = &checkpoint_dir {
        // a fresh run must not leave older checkpoints to be resumed from
        for checkpoint in persist::load_checkpoints(dir)? {
            std::fs::remove_file(persist::checkpoint_path(dir, checkpoint.node_id))?;
        }
    }

    let shutdown = CancellationToken::new();
    let poller = stop_dir.map(|dir| {
        println!("🛑 Watching {} for {}.stop", dir.display(), workflow_id);
        StopPoller::new(
            runtime.clone(),
            Arc::new(StopFileSource::new(dir)),
            Duration::from_millis(500),
        )
        .spawn(shutdown.clone())
    });
    let event_task = spawn_event_listener(runtime.clone(), &workflow, checkpoint_dir.clone());
    let ctrl_c = spawn_ctrl_c(runtime.clone(), workflow_id);

    let result = runtime.execute(workflow_id, input).await;

    // Wait for events to finish printing
    tokio::time::sleep(Duration::from_millis(100)).await;
    event_task.abort();
    ctrl_c.abort();
    shutdown.cancel();
    if let Some(poller) = poller {
        let _ = poller.await;
    }

    if let Some(dir) = &checkpoint_dir {
        persist::save_run(dir, &runtime, workflow_id)?;
    }
    print_outcome(&workflow, &result, checkpoint_dir.as_deref(), &file);

    result?;
    Ok(())
}

async fn resume_workflow(file: PathBuf, checkpoint_dir: PathBuf, from: Option<Uuid>) -> Result<()> {
    println!("🔁 Resuming workflow from: {}", file.display());
    let workflow = load_workflow(&file)?;
    let workflow_id = workflow.id;
    let runtime = build_runtime(&workflow).await?;

    let checkpoints = persist::load_checkpoints(&checkpoint_dir)?;
    let latest = checkpoints.last().map(|cp| cp.node_id);
    println!(
        "   Found {} checkpoint(s) in {}",
        checkpoints.len(),
        checkpoint_dir.display()
    );
    if let Some(state) = persist::load_state(&checkpoint_dir)? {
        if state.workflow_id != workflow_id {
            anyhow::bail!(
                "state in {} belongs to workflow {}, not {}",
                checkpoint_dir.display(),
                state.workflow_id,
                workflow_id
            );
        }
        runtime.restore_state(state);
    }
    for checkpoint in checkpoints {
        if checkpoint.workflow_id == workflow_id {
            runtime.import_checkpoint(checkpoint);
        }
    }

    let event_task = spawn_event_listener(runtime.clone(), &workflow, Some(checkpoint_dir.clone()));
    let ctrl_c = spawn_ctrl_c(runtime.clone(), workflow_id);

    let result = match from.or(latest) {
        Some(node_id) => {
            println!("   Continuing after node {}", node_id);
            runtime.restart_from_checkpoint(workflow_id, node_id).await
        }
        None => {
            let first = runtime
                .execution_order(workflow_id)
                .await?
                .first()
                .map(|n| n.id)
                .context("workflow has no nodes")?;
            println!("   No checkpoints; running from the first node");
            runtime.restart_failed_node(workflow_id, first).await
        }
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    event_task.abort();
    ctrl_c.abort();

    persist::save_run(&checkpoint_dir, &runtime, workflow_id)?;
    print_outcome(&workflow, &result, Some(&checkpoint_dir), &file);

    result?;
    Ok(())
}

fn validate_workflow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let workflow = load_workflow(&file)?;
    relaynodes::standard_registry().validate(&workflow)?;
    let order = build_execution_order(&workflow.nodes, &workflow.edges)?;

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Edges: {}", workflow.edges.len());
    println!();
    println!("   Execution order:");
    for (i, node) in order.iter().enumerate() {
        println!("   {:>3}. {} ({})", i + 1, node.display_name(), node.node_type);
    }

    Ok(())
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let registry = relaynodes::standard_registry();
    for node_type in registry.list_node_types() {
        if let Some(metadata) = registry.get_metadata(&node_type) {
            println!("  • {} ({})", node_type, metadata.category);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", node_type);
        }
    }
}

fn create_example_workflow(output: PathBuf) -> Result<()> {
    let mut workflow = Workflow::new("Example Prompt Pipeline");
    workflow.description = Some("Builds a prompt from the run input and logs it".to_string());

    workflow.chain([
        NodeSpec::new("input.field")
            .with_name("Read Topic")
            .with_config("key", "topic")
            .with_position(100.0, 100.0),
        NodeSpec::new("text.template")
            .with_name("Build Prompt")
            .with_config("template", "Write a short note about {{upstream}}.")
            .with_position(300.0, 100.0),
        NodeSpec::new("time.delay")
            .with_name("Simulate Provider")
            .with_config("delay_ms", 2000)
            .with_position(500.0, 100.0),
        NodeSpec::new("debug.log")
            .with_name("Log Prompt")
            .with_config("message", "prompt")
            .with_position(700.0, 100.0),
    ]);

    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  relay run --file {} --input '{{\"topic\": \"tides\"}}' --checkpoint-dir .relay",
        output.display()
    );

    Ok(())
}
