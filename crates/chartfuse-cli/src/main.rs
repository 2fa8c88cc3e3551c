//! chartfuse command-line interface
//!
//! Runs chart specs through the pre-transform pipeline against an in-memory
//! connection, with local files standing in for `table://NAME` datasets.
//!
//! ## Commands
//!
//! - `pre-transform`: evaluate the server half and print the client spec
//! - `extract`: like `pre-transform`, with large datasets returned separately
//! - `plan`: print the client spec, server spec and comm plan

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

use chartfuse_core::{
    init_tracing_with_level, ChartSpec, ExtractFormat, ExtractOptions, PlannerConfig,
    PreTransformOptions, Runtime, RuntimeConfig, SpecPlan, Warning,
};
use chartfuse_data::{MemoryConnection, Table};

#[derive(Parser)]
#[command(name = "chartfuse")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Server-side evaluation of chart specifications", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Maximum number of cached node values
    #[arg(long, global = true, env = "CHARTFUSE_CACHE_CAPACITY")]
    cache_capacity: Option<usize>,

    /// Maximum estimated bytes held by the cache
    #[arg(long, global = true, env = "CHARTFUSE_MEMORY_LIMIT")]
    memory_limit: Option<usize>,

    /// Node computations allowed to run at once
    #[arg(long, global = true, env = "CHARTFUSE_WORKER_THREADS")]
    worker_threads: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate the server half of a spec and print the client spec
    PreTransform {
        #[command(flatten)]
        transform: TransformArgs,

        /// Write the result here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Pre-transform, returning large datasets next to the spec
    Extract {
        #[command(flatten)]
        transform: TransformArgs,

        /// Datasets with at least this many rows are extracted
        #[arg(long, default_value = "20")]
        threshold: usize,

        /// inline-table, ipc-bytes or ipc-base64
        #[arg(long, default_value = "ipc-base64")]
        format: ExtractFormat,

        /// Write the result here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Print the client spec, server spec and comm plan
    Plan {
        /// Path to the chart spec (JSON)
        spec: PathBuf,

        /// Pre-evaluate interactive parts too
        #[arg(long)]
        no_preserve_interactivity: bool,
    },
}

#[derive(Args)]
struct TransformArgs {
    /// Path to the chart spec (JSON)
    spec: PathBuf,

    /// Inline dataset as NAME=PATH, read as CSV when PATH ends in .csv and
    /// as a JSON array of rows otherwise
    #[arg(long = "inline", value_name = "NAME=PATH")]
    inline: Vec<String>,

    /// Maximum rows in any returned dataset
    #[arg(long)]
    row_limit: Option<usize>,

    /// Pre-evaluate interactive parts too
    #[arg(long)]
    no_preserve_interactivity: bool,

    /// IANA time zone for local date parts
    #[arg(long, default_value = "UTC")]
    local_tz: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing_with_level(cli.json_logs, level);

    let config = runtime_config(cli.cache_capacity, cli.memory_limit, cli.worker_threads);
    let runtime = Runtime::new(config, Arc::new(MemoryConnection::new()))
        .context("Failed to start the chartfuse runtime")?;

    match cli.command {
        Commands::PreTransform { transform, out } => {
            let output = cmd_pre_transform(&runtime, &transform).await?;
            write_output(&output, out.as_deref())
        }
        Commands::Extract {
            transform,
            threshold,
            format,
            out,
        } => {
            let output = cmd_extract(&runtime, &transform, threshold, format).await?;
            write_output(&output, out.as_deref())
        }
        Commands::Plan {
            spec,
            no_preserve_interactivity,
        } => {
            let output = cmd_plan(&spec, !no_preserve_interactivity)?;
            write_output(&output, None)
        }
    }
}

fn runtime_config(
    cache_capacity: Option<usize>,
    memory_limit: Option<usize>,
    worker_threads: Option<usize>,
) -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    if cache_capacity.is_some() {
        config = config.with_cache_capacity(cache_capacity);
    }
    if memory_limit.is_some() {
        config = config.with_memory_limit(memory_limit);
    }
    if let Some(n) = worker_threads {
        config = config.with_worker_threads(n);
    }
    config
}

/// Pre-transform the spec and render the client spec as pretty JSON
async fn cmd_pre_transform(runtime: &Runtime, args: &TransformArgs) -> Result<String> {
    let spec = read_spec(&args.spec)?;
    let opts = transform_options(args)?;
    let out = runtime
        .pre_transform_spec(&spec, &opts)
        .await
        .with_context(|| format!("Failed to pre-transform {}", args.spec.display()))?;
    report_warnings(&out.warnings);
    info!(datasets = out.spec.data.len(), "pre-transform complete");
    Ok(serde_json::to_string_pretty(&out.spec)?)
}

async fn cmd_extract(
    runtime: &Runtime,
    args: &TransformArgs,
    threshold: usize,
    format: ExtractFormat,
) -> Result<String> {
    let spec = read_spec(&args.spec)?;
    let opts = ExtractOptions::new(transform_options(args)?)
        .with_threshold(threshold)
        .with_format(format);
    let out = runtime
        .pre_transform_extract(&spec, &opts)
        .await
        .with_context(|| format!("Failed to extract datasets from {}", args.spec.display()))?;
    report_warnings(&out.warnings);
    info!(extracted = out.datasets.len(), "extraction complete");
    Ok(serde_json::to_string_pretty(&out)?)
}

#[derive(Serialize)]
struct PlanOutput<'a> {
    client_spec: &'a ChartSpec,
    server_spec: &'a ChartSpec,
    comm_plan: &'a chartfuse_core::CommPlan,
}

fn cmd_plan(path: &Path, preserve_interactivity: bool) -> Result<String> {
    let spec = read_spec(path)?;
    let plan = SpecPlan::try_new(&spec, &PlannerConfig::pre_transform(preserve_interactivity))
        .with_context(|| format!("Failed to plan {}", path.display()))?;
    report_warnings(&plan.warnings);
    Ok(serde_json::to_string_pretty(&PlanOutput {
        client_spec: &plan.client_spec,
        server_spec: &plan.server_spec,
        comm_plan: &plan.comm_plan,
    })?)
}

fn transform_options(args: &TransformArgs) -> Result<PreTransformOptions> {
    let mut opts = PreTransformOptions::new(args.local_tz.clone())
        .with_preserve_interactivity(!args.no_preserve_interactivity);
    if let Some(limit) = args.row_limit {
        opts = opts.with_row_limit(limit);
    }
    for entry in &args.inline {
        let (name, path) = parse_inline(entry)?;
        let table = read_table(&path)?;
        info!(dataset = name, rows = table.num_rows(), "loaded inline dataset");
        opts = opts.with_inline_dataset(name, table);
    }
    Ok(opts)
}

fn parse_inline(entry: &str) -> Result<(&str, PathBuf)> {
    match entry.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => {
            Ok((name, PathBuf::from(path)))
        }
        _ => bail!("Invalid --inline value '{entry}', expected NAME=PATH"),
    }
}

fn read_spec(path: &Path) -> Result<ChartSpec> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read spec file: {}", path.display()))?;
    ChartSpec::parse(&content).with_context(|| format!("Invalid chart spec in {}", path.display()))
}

fn read_table(path: &Path) -> Result<Table> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read dataset file: {}", path.display()))?;
    let is_csv = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
    if is_csv {
        return Table::from_csv_str(&content)
            .with_context(|| format!("Invalid CSV in {}", path.display()));
    }
    let rows: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Invalid JSON in {}", path.display()))?;
    Table::from_json(&rows).with_context(|| format!("Expected an array of rows in {}", path.display()))
}

fn report_warnings(warnings: &[Warning]) {
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
}

fn write_output(output: &str, out: Option<&Path>) -> Result<()> {
    match out {
        Some(path) => {
            std::fs::write(path, output)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), "wrote result");
        }
        None => println!("{output}"),
    }
    Ok(())
}
