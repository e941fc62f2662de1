//! testqueue - local test-run queue
//!
//! Queue runs of an external test runner, drain them with background
//! workers and keep a bounded, persistent history with metrics.
//!
//! ## Usage
//!
//! ```bash
//! # Run the keyword-selected tests once
//! testqueue run -k metrics
//!
//! # Queue five runs and drain them with two workers
//! testqueue batch -n 5 --workers 2 --module queue
//!
//! # Recent failures as JSON
//! testqueue --format json history --status failed,error
//!
//! # Aggregate metrics and persistence health
//! testqueue metrics --limit 50
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use testqueue::cli::{self, Args, Command};
use testqueue::config::{print_env_help, EnvConfig, QueueConfig};
use testqueue::output::{OutputFormat, RunFormatter};
use testqueue::results::{export_runs, ExportFormat};
use testqueue::utils::{init_logger, LogLevel};
use testqueue::{RunStatus, TestQueue, WorkerPool};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(LogLevel::from_verbosity(args.verbose));

    let format = OutputFormat::from_str(&args.format).unwrap_or(OutputFormat::Table);
    let formatter = RunFormatter::new(format);

    let explicit = args.config.as_deref();
    match args.command {
        Command::Config(config_args) => manage_config(config_args, explicit, format),
        Command::Run(run_args) => {
            run_once(run_args, QueueConfig::resolve(explicit)?, &formatter).await
        }
        Command::Batch(batch_args) => {
            run_batch(batch_args, QueueConfig::resolve(explicit)?, &formatter).await
        }
        Command::History(history_args) => {
            show_history(history_args, &QueueConfig::resolve(explicit)?, &formatter)
        }
        Command::Output { run_id } => {
            show_output(&run_id, &QueueConfig::resolve(explicit)?, &formatter)
        }
        Command::Retry { run_id } => {
            retry_run(&run_id, &QueueConfig::resolve(explicit)?, &formatter).await
        }
        Command::Metrics { limit } => {
            show_metrics(limit, &QueueConfig::resolve(explicit)?, &formatter)
        }
        Command::Export(export_args) => {
            export_history(export_args, &QueueConfig::resolve(explicit)?)
        }
    }
}

async fn run_once(args: cli::RunArgs, config: QueueConfig, formatter: &RunFormatter) -> Result<()> {
    let config = match args.timeout {
        Some(secs) => config.with_timeout(secs),
        None => config,
    };
    config.validate()?;

    let queue = TestQueue::from_config(&config);
    let filters = args.filters.to_filters();
    info!("Running tests ({filters})");

    let run = queue
        .run_immediate(filters)
        .await
        .context("Run disappeared before finishing")?;
    println!("{}", formatter.format_run(&run));
    report_persistence(&queue);

    if run.status != RunStatus::Passed {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_batch(args: cli::BatchArgs, config: QueueConfig, formatter: &RunFormatter) -> Result<()> {
    let workers = args.workers.unwrap_or_else(|| config.workers.max(1));
    let queue = Arc::new(TestQueue::from_config(&config));
    let pool = WorkerPool::new(Arc::clone(&queue)).with_idle_interval(config.idle_interval());
    pool.ensure_workers(workers);

    let filters = args.filters.to_filters();
    let ids: Vec<String> = (0..args.count)
        .map(|_| queue.submit(filters.clone()))
        .collect();
    info!("Queued {} runs for {} workers", ids.len(), workers);

    if workers == 0 {
        while queue.process_next().await.is_some() {}
    } else if !queue.wait_idle(Duration::from_secs(args.wait)).await {
        warn!("Gave up waiting after {}s, {} runs unfinished", args.wait, queue.active_count());
    }
    pool.join().await;

    let runs: Vec<_> = ids.iter().filter_map(|id| queue.get_status(id)).collect();
    println!("{}", formatter.format_runs(&runs));
    println!(
        "{}",
        formatter.format_metrics(&queue.aggregate_metrics(ids.len()), &queue.persistence_stats())
    );
    report_persistence(&queue);
    Ok(())
}

fn show_history(args: cli::HistoryArgs, config: &QueueConfig, formatter: &RunFormatter) -> Result<()> {
    let queue = TestQueue::from_config(config);

    if let Some(run_id) = &args.run {
        let run = queue
            .get_status(run_id)
            .with_context(|| format!("Unknown run: {run_id}"))?;
        println!("{}", formatter.format_run(&run));
        return Ok(());
    }

    let statuses = args.statuses()?;
    queue.restore_history();
    let runs = queue.list_runs(args.limit, statuses.as_deref(), !args.memory_only);
    println!("{}", formatter.format_runs(&runs));
    Ok(())
}

fn show_output(run_id: &str, config: &QueueConfig, formatter: &RunFormatter) -> Result<()> {
    let queue = TestQueue::from_config(config);
    let output = queue
        .get_full_output(run_id)
        .with_context(|| format!("Unknown run: {run_id}"))?;
    println!("{}", formatter.format_full_output(&output));
    Ok(())
}

async fn retry_run(run_id: &str, config: &QueueConfig, formatter: &RunFormatter) -> Result<()> {
    let queue = TestQueue::from_config(config);
    let new_id = queue
        .retry(run_id)
        .with_context(|| format!("Unknown run: {run_id}"))?;
    while queue.process_next().await.is_some() {}

    let run = queue
        .get_status(&new_id)
        .with_context(|| format!("Retried run {new_id} not found"))?;
    println!("{}", formatter.format_run(&run));
    report_persistence(&queue);
    Ok(())
}

fn show_metrics(limit: usize, config: &QueueConfig, formatter: &RunFormatter) -> Result<()> {
    let queue = TestQueue::from_config(config);
    let restored = queue.restore_history();
    info!("Loaded {restored} runs from {}", queue.log().path().display());

    let metrics = queue.aggregate_metrics(limit);
    println!("{}", formatter.format_metrics(&metrics, &queue.persistence_stats()));
    Ok(())
}

fn export_history(args: cli::ExportArgs, config: &QueueConfig) -> Result<()> {
    let format = match &args.export_format {
        Some(name) => ExportFormat::from_str(name)
            .with_context(|| format!("Unknown export format: {name}"))?,
        None => ExportFormat::from_extension(&args.output).unwrap_or(ExportFormat::Json),
    };

    let queue = TestQueue::from_config(config);
    let runs = queue.log().load_recent(args.limit);
    export_runs(&runs, &args.output, format)?;
    println!("✓ Exported {} runs to {}", runs.len(), args.output.display());
    Ok(())
}

fn manage_config(args: cli::ConfigArgs, explicit: Option<&Path>, format: OutputFormat) -> Result<()> {
    match args.action {
        cli::ConfigAction::Init { output, force } => {
            if output.exists() && !force {
                anyhow::bail!(
                    "Configuration file already exists: {}. Use --force to overwrite.",
                    output.display()
                );
            }
            QueueConfig::default().save(&output)?;
            println!("✓ Configuration file created: {}", output.display());
        }

        cli::ConfigAction::Show { env } => {
            if env {
                EnvConfig::load().print_summary();
            } else {
                let config = QueueConfig::resolve(explicit)?;
                let output = match format {
                    OutputFormat::Json | OutputFormat::JsonPretty => {
                        serde_json::to_string_pretty(&config)?
                    }
                    _ => serde_yaml::to_string(&config)?,
                };
                println!("{output}");
            }
        }

        cli::ConfigAction::Validate { file } => {
            let path = file
                .or_else(|| explicit.map(Path::to_path_buf))
                .or_else(testqueue::config::find_config_file)
                .context("No configuration file found")?;

            match QueueConfig::load(&path) {
                Ok(_) => println!("✓ Configuration file is valid: {}", path.display()),
                Err(e) => {
                    println!("✗ Configuration file is invalid: {}", path.display());
                    println!("  Error: {e}");
                    return Err(e);
                }
            }
        }

        cli::ConfigAction::EnvHelp => print_env_help(),
    }
    Ok(())
}

/// Surface swallowed persistence failures once a command is done
fn report_persistence(queue: &TestQueue) {
    let stats = queue.persistence_stats();
    if stats.errors_total > 0 {
        warn!(
            "{} persistence errors writing {} (last: {})",
            stats.errors_total,
            stats.persist_path.display(),
            stats.last_error.as_deref().unwrap_or("unknown")
        );
    }
}
