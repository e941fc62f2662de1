//! Test runner collaborator
//!
//! The queue hands a run's filters to a [`TestRunner`] and gets back the exit
//! code and raw output. [`CommandRunner`] drives an external test process.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::RunnerConfig;
use crate::error::ExecutionError;
use crate::models::RunFilters;

/// Raw result of one runner invocation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutcome {
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }
}

/// Executes a filtered test selection
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Run the selection. Spawn failures and timeouts are errors; a clean
    /// exit with any code is an outcome.
    async fn execute(
        &self,
        filters: &RunFilters,
        timeout: Duration,
    ) -> Result<RunOutcome, ExecutionError>;
}

/// Pass/fail counts parsed from runner output
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub passed: u32,
    pub failed: u32,
}

/// Count per-test result lines in verbose runner output.
///
/// `::PASSED` and `::SKIPPED` count as passed, `::FAILED` and `::ERROR` as
/// failed.
pub fn parse_summary(stdout: &str) -> RunSummary {
    let mut summary = RunSummary::default();
    for line in stdout.lines() {
        if line.contains("::PASSED") || line.contains("::SKIPPED") {
            summary.passed += 1;
        } else if line.contains("::FAILED") || line.contains("::ERROR") {
            summary.failed += 1;
        }
    }
    summary
}

/// Runs tests by spawning an external command
#[derive(Clone, Debug)]
pub struct CommandRunner {
    program: String,
    base_args: Vec<String>,
    tests_root: PathBuf,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            tests_root: PathBuf::from("tests"),
        }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            program: config.program.clone(),
            base_args: config.args.clone(),
            tests_root: config.tests_root.clone(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn tests_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.tests_root = root.into();
        self
    }

    /// Build the argument list for a selection.
    ///
    /// Explicit ids win; otherwise the keyword expression and resolved
    /// module paths are passed.
    pub fn build_args(&self, filters: &RunFilters) -> Vec<String> {
        let mut args = self.base_args.clone();
        if let Some(ids) = filters.explicit_ids() {
            args.extend(ids.iter().cloned());
            return args;
        }
        if let Some(expr) = filters.k_expr.as_deref().filter(|k| !k.is_empty()) {
            args.push("-k".to_string());
            args.push(expr.to_string());
        }
        if let Some(substr) = filters.module_substr.as_deref() {
            args.extend(resolve_module_args(&self.tests_root, substr));
        }
        args
    }
}

#[async_trait]
impl TestRunner for CommandRunner {
    async fn execute(
        &self,
        filters: &RunFilters,
        timeout: Duration,
    ) -> Result<RunOutcome, ExecutionError> {
        let args = self.build_args(filters);
        debug!("Spawning {} {}", self.program, args.join(" "));

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutionError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| ExecutionError::Timeout(timeout.as_secs()))??;

        // Killed by a signal: no exit code, report as a failed run
        let exit_code = output.status.code().unwrap_or(-1);
        info!("Test runner exited with code {exit_code}");

        Ok(RunOutcome {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Resolve a module filter into path arguments.
///
/// An existing path is used as is. Otherwise every `test_*.py` file under
/// `tests_root` whose name contains the substring; no match yields nothing
/// and the runner falls back to its default discovery.
pub fn resolve_module_args(tests_root: &Path, substr: &str) -> Vec<String> {
    if substr.is_empty() {
        return Vec::new();
    }
    if Path::new(substr).exists() {
        return vec![substr.to_string()];
    }
    let mut matches = Vec::new();
    collect_test_files(tests_root, substr, &mut matches);
    matches.sort();
    matches
}

fn collect_test_files(dir: &Path, substr: &str, matches: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_test_files(&path, substr, matches);
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with("test_") && name.ends_with(".py") && name.contains(substr) {
            matches.push(path.to_string_lossy().into_owned());
        }
    }
}
