//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::models::{RunFilters, RunStatus};

/// Local test-run queue with history, metrics and retention
#[derive(Parser, Debug)]
#[command(name = "testqueue")]
#[command(version)]
#[command(about = "Queue, run and track local test runs")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file (YAML or JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format (table, json, json-pretty, csv, summary)
    #[arg(short, long, global = true, default_value = "table")]
    pub format: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run tests once and wait for the result
    Run(RunArgs),

    /// Queue several runs and drain them with background workers
    Batch(BatchArgs),

    /// List recent runs
    History(HistoryArgs),

    /// Show the full output of a run
    Output {
        /// Run id
        run_id: String,
    },

    /// Re-run the filters of an earlier run
    Retry {
        /// Run id to retry
        run_id: String,
    },

    /// Show aggregate metrics and persistence health
    Metrics {
        /// Number of most recent runs to include
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },

    /// Export run history to JSON or CSV
    Export(ExportArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Test selection shared by `run` and `batch`
#[derive(Parser, Debug, Clone, Default)]
pub struct FilterArgs {
    /// Explicit test node ids (override -k and --module)
    #[arg(long = "id", value_name = "NODEID")]
    pub nodeids: Vec<String>,

    /// Keyword expression passed to the runner
    #[arg(short = 'k', long = "keyword")]
    pub keyword: Option<String>,

    /// Module path or name substring
    #[arg(short, long)]
    pub module: Option<String>,
}

impl FilterArgs {
    pub fn to_filters(&self) -> RunFilters {
        let mut filters = RunFilters::new();
        if !self.nodeids.is_empty() {
            filters = filters.nodeids(self.nodeids.iter().cloned());
        }
        if let Some(k) = &self.keyword {
            filters = filters.keyword(k.clone());
        }
        if let Some(m) = &self.module {
            filters = filters.module(m.clone());
        }
        filters
    }
}

/// Arguments for run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub filters: FilterArgs,

    /// Runner timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

/// Arguments for batch command
#[derive(Parser, Debug)]
pub struct BatchArgs {
    #[command(flatten)]
    pub filters: FilterArgs,

    /// Number of runs to queue
    #[arg(short = 'n', long, default_value = "1")]
    pub count: usize,

    /// Background workers (defaults to the configured count, at least 1)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Give up waiting after this many seconds
    #[arg(long, default_value = "600")]
    pub wait: u64,
}

/// Arguments for history command
#[derive(Parser, Debug)]
pub struct HistoryArgs {
    /// Maximum runs to list
    #[arg(short, long, default_value = "20")]
    pub limit: usize,

    /// Only list these statuses (comma-separated)
    #[arg(short, long, value_delimiter = ',')]
    pub status: Vec<String>,

    /// Skip the persisted log
    #[arg(long)]
    pub memory_only: bool,

    /// Show a single run
    #[arg(long)]
    pub run: Option<String>,
}

impl HistoryArgs {
    /// Parse the status filter; unknown names are an error
    pub fn statuses(&self) -> anyhow::Result<Option<Vec<RunStatus>>> {
        if self.status.is_empty() {
            return Ok(None);
        }
        self.status
            .iter()
            .map(|s| {
                RunStatus::from_str(s).ok_or_else(|| anyhow::anyhow!("Unknown status: {s}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()
            .map(Some)
    }
}

/// Arguments for export command
#[derive(Parser, Debug)]
pub struct ExportArgs {
    /// Destination file
    pub output: PathBuf,

    /// Export format (json, csv); inferred from the extension when omitted
    #[arg(long = "as")]
    pub export_format: Option<String>,

    /// Maximum runs to export
    #[arg(short, long, default_value = "1000")]
    pub limit: usize,
}

/// Arguments for config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Write a configuration file with default settings
    Init {
        /// Output path
        #[arg(short, long, default_value = "testqueue.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the effective configuration
    Show {
        /// Show environment variables instead
        #[arg(long)]
        env: bool,
    },

    /// Validate a configuration file
    Validate {
        /// File to validate (defaults to the discovered file)
        file: Option<PathBuf>,
    },

    /// List supported environment variables
    EnvHelp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_parsing() {
        let args = Args::parse_from(["testqueue", "run", "-k", "metrics", "--module", "queue"]);
        match args.command {
            Command::Run(run_args) => {
                let filters = run_args.filters.to_filters();
                assert_eq!(filters.k_expr.as_deref(), Some("metrics"));
                assert_eq!(filters.module_substr.as_deref(), Some("queue"));
                assert!(filters.nodeids.is_none());
            }
            _ => panic!("Expected Run command"),
        }
        assert_eq!(args.verbose, 0);
        assert_eq!(args.format, "table");
    }

    #[test]
    fn test_batch_args() {
        let args = Args::parse_from([
            "testqueue",
            "-vv",
            "--format",
            "json",
            "batch",
            "-n",
            "3",
            "--workers",
            "2",
            "--id",
            "tests/test_a.py::t1",
            "--id",
            "tests/test_a.py::t2",
        ]);
        assert_eq!(args.verbose, 2);
        assert_eq!(args.format, "json");
        match args.command {
            Command::Batch(batch) => {
                assert_eq!(batch.count, 3);
                assert_eq!(batch.workers, Some(2));
                let filters = batch.filters.to_filters();
                assert_eq!(filters.explicit_ids().map(|ids| ids.len()), Some(2));
            }
            _ => panic!("Expected Batch command"),
        }
    }

    #[test]
    fn test_history_statuses() {
        let args = Args::parse_from(["testqueue", "history", "--status", "failed,error"]);
        match args.command {
            Command::History(history) => {
                assert_eq!(
                    history.statuses().unwrap(),
                    Some(vec![RunStatus::Failed, RunStatus::Error])
                );
            }
            _ => panic!("Expected History command"),
        }

        let args = Args::parse_from(["testqueue", "history", "--status", "bogus"]);
        match args.command {
            Command::History(history) => assert!(history.statuses().is_err()),
            _ => panic!("Expected History command"),
        }
    }

    #[test]
    fn test_config_subcommand() {
        let args = Args::parse_from(["testqueue", "config", "init", "--force"]);
        match args.command {
            Command::Config(ConfigArgs {
                action: ConfigAction::Init { output, force },
            }) => {
                assert!(force);
                assert_eq!(output, PathBuf::from("testqueue.yaml"));
            }
            _ => panic!("Expected Config Init command"),
        }
    }
}
