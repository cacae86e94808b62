use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use neuropipe::config::Config;
use neuropipe::engine::{ExecutionReport, Executor, ResultCache};
use neuropipe::interfaces::InterfaceRegistry;
use neuropipe::shutdown::ShutdownCoordinator;
use neuropipe::storage::{ExecutionQuery, ExecutionStatus, SqliteStorage};
use neuropipe::workflow::{
    parse_workflow_file, render_dot, render_text, validate_workflow, FlatGraph, GraphKind,
    HashMethod, Workflow,
};

#[derive(Parser)]
#[command(name = "neuropipe")]
#[command(about = "Neuroimaging workflow engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow file
    Run {
        /// Path to workflow YAML file
        file: String,
        /// Root of node working directories
        #[arg(long)]
        base_dir: Option<PathBuf>,
        /// Override a node input (node.field=json)
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String, serde_json::Value)>,
        /// Maximum number of interfaces running at once
        #[arg(short, long)]
        concurrency: Option<usize>,
        /// Re-run every node even if a cached result exists
        #[arg(long)]
        no_cache: bool,
        /// How file inputs are fingerprinted: timestamp|content
        #[arg(long)]
        hash_method: Option<HashMethod>,
        /// Abort the run at the first node failure
        #[arg(long)]
        stop_on_first_crash: bool,
        /// Workflow timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Write Prometheus metrics here after the run
        #[arg(long)]
        metrics_file: Option<PathBuf>,
        /// Print the execution report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate a workflow YAML file
    Validate {
        /// Path to workflow YAML file
        file: String,
    },
    /// Show the node instances a run would execute
    Plan {
        /// Path to workflow YAML file
        file: String,
        #[arg(long)]
        base_dir: Option<PathBuf>,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Draw the workflow graph
    Graph {
        /// Path to workflow YAML file
        file: String,
        /// flat|hierarchical|exec
        #[arg(short, long, default_value = "flat")]
        kind: GraphKind,
        #[arg(short, long, value_enum, default_value = "text")]
        format: GraphFormat,
        /// Output file path (stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Search execution history
    History {
        /// Workflow name
        #[arg(long)]
        workflow: Option<String>,
        /// Status filter: pending|running|completed|failed|cancelled|skipped
        #[arg(long)]
        status: Option<String>,
        /// Search text in workflow name and error
        #[arg(long)]
        search: Option<String>,
        /// Page size
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Offset for pagination
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// Show detailed node trace for an execution
    Trace {
        /// Execution ID
        execution_id: String,
    },
    /// List available interfaces
    Interfaces {
        /// Also list interfaces declared in this workflow file
        file: Option<String>,
    },
    /// Inspect or clear cached node results
    Cache {
        #[command(subcommand)]
        action: CacheActions,
    },
    /// Database maintenance and checks
    Db {
        #[command(subcommand)]
        action: DbActions,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Subcommand)]
enum CacheActions {
    /// Count stored results
    Stats {
        #[arg(long)]
        base_dir: Option<PathBuf>,
    },
    /// Delete the working directory tree
    Clear {
        #[arg(long)]
        base_dir: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum DbActions {
    /// Run integrity and foreign-key health checks
    Check,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum GraphFormat {
    Text,
    Dot,
}

/// Parse `node.field=json`; values that are not JSON are taken as strings.
fn parse_param(s: &str) -> std::result::Result<(String, String, serde_json::Value), String> {
    let (target, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid parameter '{}'. Expected node.field=value", s))?;
    let (node, field) = target
        .rsplit_once('.')
        .filter(|(node, field)| !node.is_empty() && !field.is_empty())
        .ok_or_else(|| format!("Invalid parameter target '{}'. Expected node.field", target))?;
    let value = serde_json::from_str(raw)
        .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
    Ok((node.to_string(), field.to_string(), value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "neuropipe=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            base_dir,
            params,
            concurrency,
            no_cache,
            hash_method,
            stop_on_first_crash,
            timeout,
            metrics_file,
            json,
        } => {
            let options = RunOptions {
                base_dir,
                concurrency,
                no_cache,
                hash_method,
                stop_on_first_crash,
                timeout,
                metrics_file,
                json,
            };
            cmd_run(&file, &params, options).await?
        }
        Commands::Validate { file } => cmd_validate(&file)?,
        Commands::Plan {
            file,
            base_dir,
            json,
        } => cmd_plan(&file, base_dir, json)?,
        Commands::Graph {
            file,
            kind,
            format,
            output,
        } => cmd_graph(&file, kind, format, output.as_deref())?,
        Commands::History {
            workflow,
            status,
            search,
            limit,
            offset,
        } => cmd_history(workflow, status.as_deref(), search, limit, offset).await?,
        Commands::Trace { execution_id } => cmd_trace(&execution_id).await?,
        Commands::Interfaces { file } => cmd_interfaces(file.as_deref())?,
        Commands::Cache { action } => match action {
            CacheActions::Stats { base_dir } => cmd_cache_stats(base_dir).await?,
            CacheActions::Clear { base_dir } => cmd_cache_clear(base_dir).await?,
        },
        Commands::Db { action } => match action {
            DbActions::Check => cmd_db_check().await?,
        },
        Commands::Completions { shell } => {
            cmd_completions(shell)?;
        }
    }

    Ok(())
}

/// Shell completion variants
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

impl From<CompletionShell> for Shell {
    fn from(shell: CompletionShell) -> Self {
        match shell {
            CompletionShell::Bash => Shell::Bash,
            CompletionShell::Zsh => Shell::Zsh,
            CompletionShell::Fish => Shell::Fish,
            CompletionShell::PowerShell => Shell::PowerShell,
            CompletionShell::Elvish => Shell::Elvish,
        }
    }
}

/// Generate shell completions
fn cmd_completions(shell: CompletionShell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    let shell: Shell = shell.into();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
    Ok(())
}

// ============================================================================
// Workflow Commands
// ============================================================================

struct RunOptions {
    base_dir: Option<PathBuf>,
    concurrency: Option<usize>,
    no_cache: bool,
    hash_method: Option<HashMethod>,
    stop_on_first_crash: bool,
    timeout: Option<u64>,
    metrics_file: Option<PathBuf>,
    json: bool,
}

fn load_workflow(file: &str) -> anyhow::Result<Workflow> {
    let path = Path::new(file);
    if !path.exists() {
        anyhow::bail!("File not found: {}", file);
    }
    Ok(parse_workflow_file(path)?)
}

async fn cmd_run(
    file: &str,
    params: &[(String, String, serde_json::Value)],
    options: RunOptions,
) -> anyhow::Result<()> {
    let mut workflow = load_workflow(file)?;
    for (node, field, value) in params {
        workflow.set_input(node, field, value.clone())?;
    }

    if options.metrics_file.is_some() {
        neuropipe::metrics::init_metrics()?;
    }

    let config = Config::load();
    let shutdown = Arc::new(ShutdownCoordinator::new());
    shutdown.listen_for_signals();

    let mut executor = Executor::new(InterfaceRegistry::new(), get_storage(&config)?)
        .with_defaults(config.execution.clone())
        .with_shutdown(shutdown);
    if let Some(base_dir) = options.base_dir {
        executor = executor.with_base_dir(base_dir);
    }
    if let Some(concurrency) = options.concurrency {
        executor = executor.with_max_concurrency(concurrency);
    }
    if let Some(method) = options.hash_method {
        executor = executor.with_hash_method(method);
    }
    if options.stop_on_first_crash {
        executor = executor.with_stop_on_first_crash(true);
    }
    if let Some(timeout) = options.timeout {
        executor = executor.with_timeout_override(timeout);
    }
    if options.no_cache {
        executor = executor.without_cache();
    }

    if !options.json {
        println!("Running workflow '{}'...", workflow.name);
    }
    let report = executor.execute(&workflow).await?;

    if let Some(path) = &options.metrics_file {
        std::fs::write(path, neuropipe::metrics::render_metrics())?;
    }

    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if !report.is_success() {
        anyhow::bail!("Workflow '{}' finished with status {}", workflow.name, report.execution.status);
    }
    Ok(())
}

fn print_report(report: &ExecutionReport) {
    println!();
    println!("Execution ID: {}", report.execution.id);
    println!("Status: {}", report.execution.status);
    println!("Working directory: {}", report.execution.base_dir);
    println!(
        "Nodes: {} run, {} cached, {} failed, {} skipped",
        report.summary.nodes_completed,
        report.summary.nodes_cached,
        report.summary.nodes_failed,
        report.summary.nodes_skipped
    );
    println!("Duration: {}ms", report.summary.duration_ms);

    for node in report.failed_nodes() {
        println!();
        println!("✗ {}", node.node_id);
        if let Some(error) = &node.error {
            println!("  {}", error);
        }
        if let Some(dir) = &node.node_dir {
            println!("  working directory: {}", dir);
        }
    }
}

fn cmd_validate(file: &str) -> anyhow::Result<()> {
    let workflow = load_workflow(file)?;
    let registry = InterfaceRegistry::new();
    validate_workflow(&workflow, &registry)?;
    let graph = FlatGraph::from_workflow(&workflow)?;

    println!("✓ Workflow '{}' is valid", workflow.name);
    println!();
    println!("  Nodes: {}", graph.len());
    println!("  Connections: {}", graph.edges.len());
    println!("  Declared interfaces: {}", graph.interfaces.len());

    let iterables = graph.nodes().iter().filter(|n| n.node.is_iterable()).count();
    if iterables > 0 {
        println!("  Iterable nodes: {}", iterables);
    }

    Ok(())
}

fn cmd_plan(file: &str, base_dir: Option<PathBuf>, json: bool) -> anyhow::Result<()> {
    let workflow = load_workflow(file)?;
    let config = Config::load();
    let registry = InterfaceRegistry::new();
    let base_dir = base_dir.unwrap_or_else(|| config.base_dir());
    let plan = neuropipe::engine::ExecutionPlan::build(&workflow, &registry, &base_dir)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan.to_json())?);
        return Ok(());
    }

    println!("Workflow: {}", plan.graph.name);
    println!("Base directory: {}", plan.base_dir.display());
    println!();
    println!("{:<40} {:<16} DEPENDS ON", "INSTANCE", "INTERFACE");
    println!("{}", "-".repeat(80));
    for instance in plan.instances() {
        println!(
            "{:<40} {:<16} {}",
            instance.id,
            instance.interface,
            instance.depends_on.join(", ")
        );
    }
    println!();
    println!("{} instance(s)", plan.expanded.len());

    Ok(())
}

fn cmd_graph(
    file: &str,
    kind: GraphKind,
    format: GraphFormat,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let workflow = load_workflow(file)?;
    validate_workflow(&workflow, &InterfaceRegistry::new())?;
    let graph = FlatGraph::from_workflow(&workflow)?;

    let rendered = match format {
        GraphFormat::Text => render_text(&graph),
        GraphFormat::Dot => render_dot(&graph, kind)?,
    };

    match output {
        Some(path) => {
            std::fs::write(path, rendered)?;
            println!("✓ Graph written to {}", path.display());
        }
        None => print!("{}", rendered),
    }
    Ok(())
}

async fn cmd_history(
    workflow: Option<String>,
    status: Option<&str>,
    search: Option<String>,
    limit: usize,
    offset: usize,
) -> anyhow::Result<()> {
    let storage = get_storage(&Config::load())?;

    let status_filter = match status {
        Some(status) => Some(status.parse::<ExecutionStatus>().map_err(|_| {
            anyhow::anyhow!(
                "Invalid status '{}'. Expected pending|running|completed|failed|cancelled|skipped",
                status
            )
        })?),
        None => None,
    };

    let query = ExecutionQuery {
        workflow_name: workflow,
        status: status_filter,
        search,
        limit,
        offset,
        ..ExecutionQuery::default()
    };

    let executions = storage.query_executions(&query).await?;
    if executions.is_empty() {
        println!("No executions found.");
        return Ok(());
    }

    println!(
        "{:<36} {:<20} {:<10} {:<8} {:<20}",
        "EXECUTION ID", "WORKFLOW", "STATUS", "NODES", "STARTED"
    );
    println!("{}", "-".repeat(98));

    for exec in executions {
        println!(
            "{:<36} {:<20} {:<10} {:<8} {:<20}",
            exec.id,
            exec.workflow_name,
            exec.status.to_string(),
            exec.node_count,
            exec.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

async fn cmd_trace(execution_id: &str) -> anyhow::Result<()> {
    let storage = get_storage(&Config::load())?;
    let trace = storage
        .get_execution_trace(execution_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Execution not found: {}", execution_id))?;

    println!("Execution: {}", trace.execution.id);
    println!("Workflow: {}", trace.execution.workflow_name);
    println!("Status: {}", trace.execution.status);
    if let Some(error) = &trace.execution.error {
        println!("Error: {}", error);
    }
    println!();

    for node in trace.nodes {
        let duration = node
            .finished_at
            .map(|f| (f - node.started_at).num_milliseconds())
            .unwrap_or(0);
        let cached = if node.cached { " (cached)" } else { "" };

        println!("- {} [{}]{} {}ms", node.node_id, node.status, cached, duration);
        if let Some(dir) = node.node_dir {
            println!("  dir: {}", dir);
        }
        if let Some(error) = node.error {
            println!("  error: {}", error);
        }
    }

    Ok(())
}

fn cmd_interfaces(file: Option<&str>) -> anyhow::Result<()> {
    let mut registry = InterfaceRegistry::new();
    if let Some(file) = file {
        let workflow = load_workflow(file)?;
        let graph = FlatGraph::from_workflow(&workflow)?;
        registry = registry.with_declared(&graph.interfaces)?;
    }

    println!("{:<20} DESCRIPTION", "INTERFACE");
    println!("{}", "-".repeat(72));
    for (name, description) in registry.descriptions() {
        println!("{:<20} {}", name, description);
    }
    Ok(())
}

// ============================================================================
// Cache Commands
// ============================================================================

async fn cmd_cache_stats(base_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let base_dir = base_dir.unwrap_or_else(|| Config::load().base_dir());
    let stats = ResultCache::new().stats(&base_dir).await?;

    println!("Base directory: {}", base_dir.display());
    println!("Stored results: {}", stats.result_count);
    println!("Disk usage: {} bytes", stats.total_bytes);
    Ok(())
}

async fn cmd_cache_clear(base_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let base_dir = base_dir.unwrap_or_else(|| Config::load().base_dir());
    let removed = ResultCache::new().clear(&base_dir).await?;
    println!("✓ Removed {} cached result(s) from {}", removed, base_dir.display());
    Ok(())
}

async fn cmd_db_check() -> anyhow::Result<()> {
    let storage = get_storage(&Config::load())?;
    let health = storage.check_health().await?;

    println!(
        "Foreign keys: {}",
        if health.foreign_keys_enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!("Integrity check: {}", health.integrity_check);
    println!("Journal mode: {}", health.journal_mode);
    println!("Orphaned node executions: {}", health.orphaned_node_executions);

    let healthy = health.foreign_keys_enabled
        && health.integrity_check.eq_ignore_ascii_case("ok")
        && health.orphaned_node_executions == 0;

    if healthy {
        println!("✓ Database health check passed");
        Ok(())
    } else {
        anyhow::bail!("Database health check failed")
    }
}

fn get_storage(config: &Config) -> anyhow::Result<SqliteStorage> {
    Ok(SqliteStorage::open(&config.database_path())?)
}
