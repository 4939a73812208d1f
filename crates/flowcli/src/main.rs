// crates/flowcli/src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flowcore::{BatchConfig, ErrorHandling, ExecutionEvent, Map, NodeEvent, NodeSpec, Value, Workflow};
use flowruntime::{ExecutionRecord, FlowRuntime, NodeRegistry, RuntimeConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow Engine CLI", long_about = None)]
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

        /// Initial params as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Runtime configuration JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a workflow file without running it
    Validate {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Initial params the run would be given, as a JSON object
        #[arg(short, long)]
        input: Option<String>,
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

    let verbose = matches!(cli.command, Commands::Run { verbose: true, .. });
    init_tracing(verbose);

    match cli.command {
        Commands::Run {
            file,
            input,
            config,
            ..
        } => {
            run_workflow(file, input, config).await?;
        }

        Commands::Validate { file, input } => {
            validate_workflow(file, input)?;
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

/// RUST_LOG wins when set; otherwise info, or debug with --verbose
fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_workflow(file: &Path) -> Result<Workflow> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading workflow {}", file.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing workflow {}", file.display()))
}

fn parse_input(input: Option<String>) -> Result<Map<String, Value>> {
    let Some(text) = input else {
        return Ok(Map::new());
    };
    match serde_json::from_str(&text).context("parsing --input")? {
        Value::Object(params) => Ok(params),
        other => bail!("Input must be a JSON object, got {}", flowcore::ValueKind::of(&other)),
    }
}

fn runtime_with_builtins(config: RuntimeConfig) -> FlowRuntime {
    let mut registry = NodeRegistry::new();
    flownodes::register_all(&mut registry);
    FlowRuntime::with_registry(Arc::new(registry), config)
}

async fn run_workflow(file: PathBuf, input: Option<String>, config: Option<PathBuf>) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());

    let workflow = load_workflow(&file)?;
    let initial = parse_input(input)?;
    let config = match config {
        Some(path) => RuntimeConfig::from_file(&path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    let sample_limit = config.error_sample_limit;
    tracing::debug!(?config, "Runtime config");

    println!("📋 Workflow: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Edges: {}", workflow.edges.len());
    println!();

    let runtime = runtime_with_builtins(config);

    // Subscribe to events for real-time output
    let mut events = runtime.subscribe_events();

    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::WorkflowStarted { .. } => {
                    println!("▶️  Workflow started");
                }
                ExecutionEvent::NodeStarted {
                    node_id, node_type, ..
                } => {
                    println!("  ⚡ Starting node: {} ({})", node_id, node_type);
                }
                ExecutionEvent::NodeCompleted {
                    node_id,
                    action,
                    duration_ms,
                    ..
                } => {
                    println!("  ✅ Node {} completed in {}ms -> {}", node_id, duration_ms, action);
                }
                ExecutionEvent::NodeFailed { node_id, error, .. } => {
                    println!("  ❌ Node {} failed: {}", node_id, error);
                }
                ExecutionEvent::BatchItemRetry {
                    node_id,
                    index,
                    attempt,
                    error,
                    ..
                } => {
                    println!("     🔁 [{}] item {} attempt {} failed: {}", node_id, index, attempt, error);
                }
                ExecutionEvent::BatchItemFailed {
                    node_id, index, error, ..
                } => {
                    println!("     ⚠️  [{}] item {} gave up: {}", node_id, index, error);
                }
                ExecutionEvent::NodeEvent { node_id, event, .. } => match event {
                    NodeEvent::Info { message } => {
                        println!("     ℹ️  [{}] {}", node_id, message);
                    }
                    NodeEvent::Warning { message } => {
                        println!("     ⚠️  [{}] {}", node_id, message);
                    }
                    NodeEvent::Progress { percent, message } => {
                        if let Some(msg) = message {
                            println!("     📊 [{}] {}% - {}", node_id, percent, msg);
                        } else {
                            println!("     📊 [{}] {}%", node_id, percent);
                        }
                    }
                    NodeEvent::Data { .. } => {}
                },
                ExecutionEvent::WorkflowCompleted {
                    success,
                    duration_ms,
                    ..
                } => {
                    if success {
                        println!("✨ Workflow completed successfully in {}ms", duration_ms);
                    } else {
                        println!("💥 Workflow failed after {}ms", duration_ms);
                    }
                }
            }
        }
    });

    let outcome = runtime.execute(&workflow, initial).await;

    // Wait for events to finish printing
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();

    let result = match outcome {
        Ok(result) => result,
        Err(failure) => {
            if !failure.records.is_empty() {
                println!();
                println!("📊 Execution Summary (incomplete):");
                if let Some(execution_id) = failure.execution_id {
                    println!("   Execution ID: {}", execution_id);
                }
                for record in &failure.records {
                    print_record(record, sample_limit);
                }
            }
            return Err(failure.into());
        }
    };

    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", result.execution_id);
    println!("   Order: {}", result.execution_order.join(" -> "));
    for record in &result.records {
        print_record(record, sample_limit);
    }

    if !result.outputs.is_empty() {
        println!();
        println!("📤 Outputs:");
        for node_id in &result.execution_order {
            let Some(outputs) = result.outputs.get(node_id) else {
                continue;
            };
            println!("   Node {}:", node_id);
            for (key, value) in outputs {
                println!("     {}: {}", key, value);
            }
        }
    }

    Ok(())
}

fn print_record(record: &ExecutionRecord, sample_limit: usize) {
    let mark = if record.is_success() { "✅" } else { "❌" };
    println!(
        "   {} {} ({}) {}ms, wrote [{}]",
        mark,
        record.node_id,
        record.node_type,
        record.duration_ms,
        record.keys_written.join(", ")
    );
    if let Some(error) = &record.error {
        println!("      error: {}", error);
    }
    if let Some(batch) = &record.batch {
        println!(
            "      batch: {} items, {} ok, {} failed",
            batch.count, batch.success_count, batch.error_count
        );
        for error in batch.sample_errors(sample_limit) {
            println!("        - {}", error);
        }
        if batch.errors.len() > sample_limit {
            println!("        ... and {} more", batch.errors.len() - sample_limit);
        }
    }
}

fn validate_workflow(file: PathBuf, input: Option<String>) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let workflow = load_workflow(&file)?;
    let initial = parse_input(input)?;
    let runtime = runtime_with_builtins(RuntimeConfig::default());

    let report = runtime.validate(&workflow, &initial);
    if !report.is_valid() {
        println!("❌ Found {} problem(s):", report.errors.len());
        for error in &report.errors {
            println!("   [{}] {}", error.category(), error);
        }
        bail!("workflow '{}' is invalid", workflow.name);
    }

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Edges: {}", workflow.edges.len());
    println!("   Order: {}", report.execution_order.join(" -> "));

    Ok(())
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let mut registry = NodeRegistry::new();
    flownodes::register_all(&mut registry);

    for node_type in registry.list_node_types() {
        let Some(metadata) = registry.get_metadata(&node_type) else {
            println!("  • {}", node_type);
            continue;
        };
        println!("  • {} ({})", node_type, metadata.category);
        println!("    {}", metadata.description);
        for port in &metadata.inputs {
            let marker = if port.required { "*" } else { " " };
            println!("      in {}{}: {} {}", marker, port.name, port.kind, port.description);
        }
        for port in &metadata.outputs {
            println!("      out {}: {} {}", port.name, port.kind, port.description);
        }
    }
}

fn create_example_workflow(output: PathBuf) -> Result<()> {
    let mut workflow = Workflow::new("Example Batch Workflow");
    workflow.description = Some("Fetches each URL in parallel and logs how many succeeded".to_string());

    workflow.add_node(
        NodeSpec::new("fetch", "http.request")
            .with_param("url", "${url}")
            .with_param("method", "GET")
            .with_batch(
                BatchConfig::new("${urls}")
                    .with_alias("url")
                    .parallel(4)
                    .with_retries(2, 0.5)
                    .with_error_handling(ErrorHandling::Continue),
            ),
    );
    workflow.add_node(
        NodeSpec::new("report", "debug.log")
            .with_param("message", "${fetch.success_count} of ${fetch.count} requests succeeded"),
    );
    workflow.connect("fetch", "report");

    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  flow run --file {} --input '{{\"urls\": [\"https://api.github.com/zen\", \"https://example.com\"]}}'",
        output.display()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_takes_file_flag_like_run() {
        let cli = Cli::try_parse_from(["flow", "validate", "--file", "flow.json", "-i", "{}"]).unwrap();
        match cli.command {
            Commands::Validate { file, input } => {
                assert_eq!(file, PathBuf::from("flow.json"));
                assert_eq!(input.as_deref(), Some("{}"));
            }
            _ => panic!("expected validate"),
        }

        assert!(Cli::try_parse_from(["flow", "validate", "-f", "flow.json"]).is_ok());
        assert!(Cli::try_parse_from(["flow", "validate", "flow.json"]).is_err());
    }
}
