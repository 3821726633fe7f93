// crates/wfcli/src/main.rs

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use wfcore::{
    Connection, ExecutionEvent, ExecutionMode, ExecutionRequest, NodeEvent, NodeSpec, NodeStatus,
    RunStatus, Workflow, WorkflowDefinition,
};
use wfruntime::{FlowRuntime, NodeRegistry, RuntimeConfig};

#[derive(Parser)]
#[command(name = "wf")]
#[command(about = "Workflow engine CLI", long_about = None)]
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

        /// Input data as JSON string
        #[arg(short, long)]
        input: Option<String>,

        /// Only run what is needed to reach this node
        #[arg(short, long)]
        destination: Option<String>,

        /// Upper bound on nodes running at once
        #[arg(long)]
        max_parallel: Option<usize>,

        /// manual, trigger (ignores pinned data) or test (static data is not kept)
        #[arg(long, default_value = "manual")]
        mode: ExecutionMode,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,

        /// Write updated static data back into the workflow file
        #[arg(long)]
        save: bool,
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

    /// Rename a node and every reference to it
    Rename {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        old: String,

        new: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let verbose = matches!(cli.command, Commands::Run { verbose: true, .. });
    init_logging(verbose);

    match cli.command {
        Commands::Run {
            file,
            input,
            destination,
            max_parallel,
            mode,
            verbose: _,
            save,
        } => {
            run_workflow(&file, input, destination, max_parallel, mode, save).await?;
        }

        Commands::Validate { file } => {
            validate_workflow(&file)?;
        }

        Commands::Nodes => {
            list_nodes()?;
        }

        Commands::Init { output } => {
            create_example_workflow(&output)?;
        }

        Commands::Rename { file, old, new } => {
            rename_node(&file, &old, &new)?;
        }
    }

    Ok(())
}

/// `RUST_LOG` wins; otherwise info, or debug with `--verbose`.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_workflow(file: &Path) -> Result<Workflow> {
    let workflow_json = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let definition: WorkflowDefinition = serde_json::from_str(&workflow_json)
        .with_context(|| format!("parsing {}", file.display()))?;
    Ok(Workflow::from_definition(definition)?)
}

fn save_workflow(workflow: &Workflow, file: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&workflow.to_definition())?;
    std::fs::write(file, json).with_context(|| format!("writing {}", file.display()))?;
    Ok(())
}

fn registry() -> Result<Arc<NodeRegistry>> {
    Ok(Arc::new(wfnodes::standard_registry()?))
}

async fn run_workflow(
    file: &Path,
    input: Option<String>,
    destination: Option<String>,
    max_parallel: Option<usize>,
    mode: ExecutionMode,
    save: bool,
) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());

    let workflow = Arc::new(load_workflow(file)?);

    println!("📋 Workflow: {}", workflow.name);
    println!("   Nodes: {}", workflow.node_count());
    println!("   Connections: {}", workflow.connections().len());
    println!();

    let mut request = ExecutionRequest::manual().with_mode(mode);
    if let Some(input_str) = input {
        let input: Value = serde_json::from_str(&input_str).context("parsing --input")?;
        request = request.with_input(input);
    }
    if let Some(destination) = destination {
        request = request.with_destination(destination);
    }

    let mut config = RuntimeConfig::default();
    if let Some(max_parallel) = max_parallel {
        config.max_parallel_nodes = max_parallel;
    }
    let runtime = FlowRuntime::with_config(registry()?, config);

    // Subscribe to events for real-time output
    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(event);
        }
    });

    let handle = runtime.start(workflow.clone(), request);
    let cancel = handle.cancellation();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("🛑 Cancelling...");
            cancel.cancel();
        }
    });
    let record = handle.wait().await?;
    ctrl_c.abort();

    // Wait for events to finish printing
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();

    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", record.execution_id);
    println!("   Status: {:?}", record.status);
    if let Some(ms) = record.duration_ms() {
        println!("   Duration: {}ms", ms);
    }
    println!(
        "   Succeeded: {}, failed: {}, skipped: {}",
        record.count(NodeStatus::Succeeded),
        record.count(NodeStatus::Failed),
        record.count(NodeStatus::Skipped)
    );
    if let Some(error) = &record.error {
        println!("   Error: {}", error);
    }

    let order = record.execution_order();
    if !order.is_empty() {
        println!();
        println!("📤 Outputs:");
        for name in order {
            let Some(run) = record.node(name) else {
                continue;
            };
            if let Some(outputs) = &run.output {
                println!("   {}:", name);
                for (port, value) in outputs {
                    println!("     [{}] {}", port, value);
                }
            }
        }
    }

    if save && record.static_data_changed && workflow.settings.save_static_data {
        save_workflow(&workflow, file)?;
        println!();
        println!("💾 Saved static data to {}", file.display());
    }

    if record.status != RunStatus::Finished {
        std::process::exit(1);
    }
    Ok(())
}

fn print_event(event: ExecutionEvent) {
    match event {
        ExecutionEvent::WorkflowStarted { start_node, .. } => {
            println!("▶️  Workflow started at '{}'", start_node);
        }
        ExecutionEvent::NodeStarted { node, node_type, .. } => {
            println!("  ⚡ Starting node: {} ({})", node, node_type);
        }
        ExecutionEvent::NodeCompleted { node, duration_ms, .. } => {
            println!("  ✅ Node {} completed in {}ms", node, duration_ms);
        }
        ExecutionEvent::NodeFailed { node, error, .. } => {
            println!("  ❌ Node {} failed: {}", node, error);
        }
        ExecutionEvent::NodeRetrying { node, attempt, error, .. } => {
            println!("  🔁 Node {} attempt {} failed: {}", node, attempt, error);
        }
        ExecutionEvent::NodeSkipped { node, reason, .. } => {
            println!("  ⏭️  Node {} skipped ({:?})", node, reason);
        }
        ExecutionEvent::NodeEvent { node, event, .. } => match event {
            NodeEvent::Info { message } => {
                println!("     ℹ️  [{}] {}", node, message);
            }
            NodeEvent::Warning { message } => {
                println!("     ⚠️  [{}] {}", node, message);
            }
            NodeEvent::Progress { percent, message } => {
                if let Some(msg) = message {
                    println!("     📊 [{}] {}% - {}", node, percent, msg);
                } else {
                    println!("     📊 [{}] {}%", node, percent);
                }
            }
            NodeEvent::Data { .. } => {}
        },
        ExecutionEvent::WorkflowCompleted { success, duration_ms, .. } => {
            if success {
                println!("✨ Workflow completed successfully in {}ms", duration_ms);
            } else {
                println!("💥 Workflow failed after {}ms", duration_ms);
            }
        }
    }
}

fn validate_workflow(file: &Path) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let workflow = load_workflow(file)?;
    let registry = registry()?;

    for node in workflow.nodes() {
        let description = registry.describe(&node.node_type)?;
        if !node.disabled {
            description
                .validate_definition(&node.parameters_value())
                .map_err(|e| anyhow!("node '{}': {}", node.name, e))?;
        }
    }
    let start = workflow.get_start_node(registry.as_ref(), None)?;

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name);
    println!("   Nodes: {}", workflow.node_count());
    println!("   Connections: {}", workflow.connections().len());
    println!("   Start node: {}", start.name);

    Ok(())
}

fn list_nodes() -> Result<()> {
    println!("📦 Available Node Types:");
    println!();

    let registry = registry()?;
    for node_type in registry.list_node_types() {
        let metadata = registry.describe(&node_type)?;
        println!("  • {} ({})", node_type, metadata.category);
        if !metadata.description.is_empty() {
            println!("    {}", metadata.description);
        }
        for parameter in &metadata.parameters {
            let required = if parameter.required { ", required" } else { "" };
            println!("      - {}: {}{}", parameter.name, parameter.kind.as_str(), required);
        }
    }
    Ok(())
}

fn create_example_workflow(output: &Path) -> Result<()> {
    let mut workflow = Workflow::new("Example HTTP Workflow");

    workflow.add_node(NodeSpec::new("Start", "trigger.manual").with_position(0.0, 100.0))?;
    workflow.add_node(
        NodeSpec::new("Fetch Data", "http.request")
            .with_parameter("url", "{{ $json.url }}")
            .with_parameter("method", "GET")
            .with_retry(3, 500)
            .with_position(200.0, 100.0),
    )?;
    workflow.add_node(
        NodeSpec::new("Log Response", "debug.log")
            .with_parameter("message", "status {{ $node[\"Fetch Data\"].json.status }}")
            .with_position(400.0, 100.0),
    )?;
    workflow.add_node(
        NodeSpec::new("Log Failure", "debug.log")
            .with_parameter("message", "request failed: {{ $json.error.message }}")
            .with_position(400.0, 250.0),
    )?;

    workflow.connect("Start", "Fetch Data")?;
    workflow.connect("Fetch Data", "Log Response")?;
    workflow.add_connection(Connection::error("Fetch Data", "Log Failure"))?;

    save_workflow(&workflow, output)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  wf run --file {} --input '{}'",
        output.display(),
        json!({"url": "https://api.github.com/zen"})
    );

    Ok(())
}

fn rename_node(file: &Path, old: &str, new: &str) -> Result<()> {
    let mut workflow = load_workflow(file)?;
    workflow.rename_node(old, new)?;
    save_workflow(&workflow, file)?;

    println!("✏️  Renamed '{}' to '{}' in {}", old, new, file.display());
    Ok(())
}
