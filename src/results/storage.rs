//! Run history persistence
//!
//! Finished runs are appended as JSON lines to a single log file. After each
//! append a retention policy bounds the log by line count and the side-output
//! directory by total size. Failures are counted, never propagated.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::{debug, info, warn};

use super::output::{STDERR_SUFFIX, STDOUT_SUFFIX};
use crate::error::{PersistenceError, PersistenceResult};
use crate::models::RunRecord;
use crate::utils::lock;

/// File name of the append-only history log
pub const LOG_FILE_NAME: &str = "testqueue_runs.jsonl";

/// Directory name for side-output files
pub const OUTPUT_DIR_NAME: &str = "testqueue_outputs";

const MAX_ERROR_LEN: usize = 500;

/// Size bounds applied after every append
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Keep at most this many lines in the history log
    pub max_runs: Option<usize>,
    /// Keep side-output files below this many bytes
    pub max_bytes: Option<u64>,
}

impl RetentionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero disables the bound
    pub fn max_runs(mut self, n: usize) -> Self {
        self.max_runs = (n > 0).then_some(n);
        self
    }

    /// Zero disables the bound
    pub fn max_bytes(mut self, n: u64) -> Self {
        self.max_bytes = (n > 0).then_some(n);
        self
    }
}

/// Health counters for the persistence layer
#[derive(Clone, Debug, Serialize)]
pub struct PersistenceStats {
    pub errors_total: u64,
    pub last_error: Option<String>,
    pub last_error_ts: Option<DateTime<Utc>>,
    pub persist_path: PathBuf,
}

/// Append-only history log with retention
#[derive(Debug)]
pub struct PersistenceLog {
    path: PathBuf,
    outputs_dir: PathBuf,
    retention: RetentionPolicy,
    /// Serializes appends against retention rewrites
    file_lock: Mutex<()>,
    stats: Mutex<PersistenceStats>,
}

impl PersistenceLog {
    /// Log and side outputs under a common data directory
    pub fn new(data_dir: impl AsRef<Path>, retention: RetentionPolicy) -> Self {
        let data_dir = data_dir.as_ref();
        Self::with_paths(
            data_dir.join(LOG_FILE_NAME),
            data_dir.join(OUTPUT_DIR_NAME),
            retention,
        )
    }

    pub fn with_paths(
        path: impl Into<PathBuf>,
        outputs_dir: impl Into<PathBuf>,
        retention: RetentionPolicy,
    ) -> Self {
        let path = path.into();
        Self {
            stats: Mutex::new(PersistenceStats {
                errors_total: 0,
                last_error: None,
                last_error_ts: None,
                persist_path: path.clone(),
            }),
            path,
            outputs_dir: outputs_dir.into(),
            retention,
            file_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn outputs_dir(&self) -> &Path {
        &self.outputs_dir
    }

    /// Append a finished run and enforce retention.
    ///
    /// Never fails: errors are recorded in the health counters.
    pub fn append(&self, run: &RunRecord) {
        let _guard = lock(&self.file_lock);
        if let Err(e) = self.append_line(run) {
            self.record_failure(e);
            return;
        }
        debug!(run_id = %run.run_id, "Appended run to {}", self.path.display());
        if let Err(e) = self.apply_retention() {
            self.record_failure(e);
        }
    }

    fn append_line(&self, run: &RunRecord) -> PersistenceResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| PersistenceError::io(parent, e))?;
        }
        let mut line = serde_json::to_string(run).map_err(|source| PersistenceError::Serialize {
            run_id: run.run_id.clone(),
            source,
        })?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| PersistenceError::io(&self.path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| PersistenceError::io(&self.path, e))
    }

    /// Run both retention bounds. The byte bound still runs if the count
    /// bound failed; the first error is returned.
    fn apply_retention(&self) -> PersistenceResult<()> {
        let by_count = match self.retention.max_runs {
            Some(n) => self.enforce_max_runs(n).map(|_| ()),
            None => Ok(()),
        };
        let by_bytes = match self.retention.max_bytes {
            Some(n) => self.enforce_max_bytes(n).map(|_| ()),
            None => Ok(()),
        };
        by_count.and(by_bytes)
    }

    /// Keep only the newest `max_runs` lines. Returns the number dropped.
    fn enforce_max_runs(&self, max_runs: usize) -> PersistenceResult<usize> {
        if !self.path.exists() {
            return Ok(0);
        }
        let content =
            fs::read_to_string(&self.path).map_err(|e| PersistenceError::io(&self.path, e))?;
        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.len() <= max_runs {
            return Ok(0);
        }
        let dropped = lines.len() - max_runs;
        let kept = &lines[dropped..];

        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let file = File::create(&tmp).map_err(|e| PersistenceError::io(&tmp, e))?;
            let mut writer = BufWriter::new(file);
            for line in kept {
                writeln!(writer, "{line}").map_err(|e| PersistenceError::io(&tmp, e))?;
            }
            writer.flush().map_err(|e| PersistenceError::io(&tmp, e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| PersistenceError::io(&self.path, e))?;

        debug!("Retention dropped {dropped} runs from {}", self.path.display());
        Ok(dropped)
    }

    /// Delete the oldest side-output pairs until the directory fits the
    /// budget. Returns the number of pairs removed.
    fn enforce_max_bytes(&self, max_bytes: u64) -> PersistenceResult<usize> {
        if !self.outputs_dir.exists() {
            return Ok(0);
        }
        let entries = fs::read_dir(&self.outputs_dir)
            .map_err(|e| PersistenceError::io(&self.outputs_dir, e))?;

        let mut pairs: Vec<OutputPair> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PersistenceError::io(&self.outputs_dir, e))?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(STDOUT_SUFFIX)) else {
                continue;
            };
            let stdout = entry.path();
            let stderr = self.outputs_dir.join(format!("{stem}{STDERR_SUFFIX}"));
            let meta = entry
                .metadata()
                .map_err(|e| PersistenceError::io(&stdout, e))?;
            let stderr_size = fs::metadata(&stderr).map(|m| m.len()).unwrap_or(0);
            pairs.push(OutputPair {
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                size: meta.len() + stderr_size,
                stdout,
                stderr,
            });
        }

        let mut total: u64 = pairs.iter().map(|p| p.size).sum();
        if total <= max_bytes {
            return Ok(0);
        }

        pairs.sort_by(|a, b| a.modified.cmp(&b.modified).then(a.stdout.cmp(&b.stdout)));
        let mut removed = 0;
        let mut first_error = None;
        for pair in pairs {
            if total <= max_bytes {
                break;
            }
            // A pair that cannot be deleted must not block newer ones
            match remove_if_exists(&pair.stdout).and_then(|_| remove_if_exists(&pair.stderr)) {
                Ok(()) => {
                    total = total.saturating_sub(pair.size);
                    removed += 1;
                }
                Err(e) => {
                    warn!("Retention could not remove {}: {e}", pair.stdout.display());
                    first_error.get_or_insert(e);
                }
            }
        }

        debug!("Retention removed {removed} output pairs from {}", self.outputs_dir.display());
        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    /// Count a persistence failure. The single place where persistence
    /// errors stop travelling.
    pub fn record_failure(&self, error: PersistenceError) {
        let message: String = error.to_string().chars().take(MAX_ERROR_LEN).collect();
        warn!("Persistence failure: {message}");
        let mut stats = lock(&self.stats);
        stats.errors_total += 1;
        stats.last_error = Some(message);
        stats.last_error_ts = Some(Utc::now());
    }

    pub fn stats(&self) -> PersistenceStats {
        lock(&self.stats).clone()
    }

    /// Load the newest `limit` runs (oldest first).
    ///
    /// Blank and malformed lines are skipped; a missing or unreadable file
    /// yields an empty list.
    pub fn load_recent(&self, limit: usize) -> Vec<RunRecord> {
        let mut runs = self.load_all();
        if runs.len() > limit {
            runs.drain(..runs.len() - limit);
        }
        runs
    }

    pub fn load_all(&self) -> Vec<RunRecord> {
        let content = {
            let _guard = lock(&self.file_lock);
            match fs::read_to_string(&self.path) {
                Ok(c) => c,
                Err(_) => return Vec::new(),
            }
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str::<RunRecord>(l) {
                Ok(run) => Some(run),
                Err(e) => {
                    debug!("Skipping malformed history line: {e}");
                    None
                }
            })
            .collect()
    }
}

struct OutputPair {
    modified: SystemTime,
    size: u64,
    stdout: PathBuf,
    stderr: PathBuf,
}

fn remove_if_exists(path: &Path) -> PersistenceResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PersistenceError::io(path, e)),
    }
}

/// Export format
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(ExportFormat::Json),
            "csv" => Some(ExportFormat::Csv),
            _ => None,
        }
    }

    pub fn from_extension(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_str)
    }
}

/// Export runs to a JSON array or a CSV table
pub fn export_runs(runs: &[RunRecord], path: &Path, format: ExportFormat) -> Result<()> {
    match format {
        ExportFormat::Json => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create export file: {}", path.display()))?;
            let writer = BufWriter::new(file);
            serde_json::to_writer_pretty(writer, runs).context("Failed to write runs")?;
        }
        ExportFormat::Csv => {
            let mut writer = csv::Writer::from_path(path)
                .with_context(|| format!("Failed to create export file: {}", path.display()))?;

            writer.write_record([
                "run_id",
                "status",
                "passed",
                "failed",
                "queued_at",
                "started_at",
                "finished_at",
                "duration_s",
                "k_expr",
                "module_substr",
                "nodeids",
                "output_saved",
            ])?;

            for run in runs {
                writer.write_record([
                    run.run_id.clone(),
                    run.status.as_str().to_string(),
                    run.passed.to_string(),
                    run.failed.to_string(),
                    run.queued_at.to_rfc3339(),
                    run.started_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                    run.finished_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                    run.duration_s.map(|d| d.to_string()).unwrap_or_default(),
                    run.filters.k_expr.clone().unwrap_or_default(),
                    run.filters.module_substr.clone().unwrap_or_default(),
                    run.filters
                        .nodeids
                        .as_ref()
                        .map(|ids| ids.join(" "))
                        .unwrap_or_default(),
                    run.output_saved.to_string(),
                ])?;
            }
            writer.flush()?;
        }
    }

    info!("Exported {} runs to {}", runs.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunFilters, RunStatus};
    use chrono::Utc;
    use tempfile::TempDir;

    fn finished_run(status: RunStatus) -> RunRecord {
        let mut run = RunRecord::new(RunFilters::new().keyword("metrics"));
        let now = Utc::now();
        run.claim(now);
        run.finish(status, now);
        run
    }

    fn line_count(path: &Path) -> usize {
        fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .count()
    }

    #[test]
    fn test_append_and_load() {
        let dir = TempDir::new().unwrap();
        let log = PersistenceLog::new(dir.path(), RetentionPolicy::new());

        let a = finished_run(RunStatus::Passed);
        let b = finished_run(RunStatus::Failed);
        log.append(&a);
        log.append(&b);

        let runs = log.load_all();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, a.run_id);
        assert_eq!(runs[1].status, RunStatus::Failed);
        assert_eq!(log.stats().errors_total, 0);
    }

    #[test]
    fn test_count_retention_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let log = PersistenceLog::new(dir.path(), RetentionPolicy::new().max_runs(3));

        let ids: Vec<String> = (0..7)
            .map(|_| {
                let run = finished_run(RunStatus::Passed);
                log.append(&run);
                run.run_id
            })
            .collect();

        assert_eq!(line_count(log.path()), 3);
        let kept: Vec<String> = log.load_all().into_iter().map(|r| r.run_id).collect();
        assert_eq!(kept, ids[4..].to_vec());
    }

    #[test]
    fn test_byte_retention_deletes_oldest_pairs() {
        let dir = TempDir::new().unwrap();
        let log = PersistenceLog::new(dir.path(), RetentionPolicy::new().max_bytes(1000));
        fs::create_dir_all(log.outputs_dir()).unwrap();

        for i in 0..4 {
            let out = log.outputs_dir();
            fs::write(out.join(format!("run{i}{STDOUT_SUFFIX}")), "x".repeat(400)).unwrap();
            fs::write(out.join(format!("run{i}{STDERR_SUFFIX}")), "").unwrap();
            std::thread::sleep(std::time::Duration::from_millis(20));
        }

        log.append(&finished_run(RunStatus::Passed));

        let out = log.outputs_dir();
        assert!(!out.join(format!("run0{STDOUT_SUFFIX}")).exists());
        assert!(!out.join(format!("run1{STDOUT_SUFFIX}")).exists());
        assert!(!out.join(format!("run1{STDERR_SUFFIX}")).exists());
        assert!(out.join(format!("run2{STDOUT_SUFFIX}")).exists());
        assert!(out.join(format!("run3{STDOUT_SUFFIX}")).exists());
    }

    #[test]
    fn test_byte_retention_skips_undeletable_pair() {
        let dir = TempDir::new().unwrap();
        let log = PersistenceLog::new(dir.path(), RetentionPolicy::new().max_bytes(500));
        let out = log.outputs_dir().to_path_buf();

        // Oldest "pair" is a non-empty directory, so removing it fails
        let stuck = out.join(format!("run0{STDOUT_SUFFIX}"));
        fs::create_dir_all(&stuck).unwrap();
        fs::write(stuck.join("keep"), "x").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        for i in 1..4 {
            fs::write(out.join(format!("run{i}{STDOUT_SUFFIX}")), "x".repeat(400)).unwrap();
            fs::write(out.join(format!("run{i}{STDERR_SUFFIX}")), "").unwrap();
            std::thread::sleep(std::time::Duration::from_millis(20));
        }

        log.append(&finished_run(RunStatus::Passed));

        assert!(stuck.exists());
        assert!(!out.join(format!("run1{STDOUT_SUFFIX}")).exists());
        assert!(!out.join(format!("run1{STDERR_SUFFIX}")).exists());
        let stats = log.stats();
        assert_eq!(stats.errors_total, 1);
        assert!(stats.last_error.unwrap().contains("run0"));
        // The run itself was still logged
        assert_eq!(log.load_all().len(), 1);
    }

    #[test]
    fn test_count_retention_failure_is_counted() {
        let dir = TempDir::new().unwrap();
        let log = PersistenceLog::new(dir.path(), RetentionPolicy::new().max_runs(1));
        fs::create_dir_all(dir.path().join(format!("{LOG_FILE_NAME}.tmp"))).unwrap();

        let first = finished_run(RunStatus::Passed);
        let second = finished_run(RunStatus::Failed);
        log.append(&first);
        assert_eq!(log.stats().errors_total, 0);
        log.append(&second);

        let stats = log.stats();
        assert_eq!(stats.errors_total, 1);
        assert!(stats.last_error.unwrap().contains(".tmp"));
        // The rewrite failed, so both lines are still there and readable
        let ids: Vec<String> = log.load_all().into_iter().map(|r| r.run_id).collect();
        assert_eq!(ids, vec![first.run_id, second.run_id]);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let log = PersistenceLog::new(dir.path(), RetentionPolicy::new());
        let run = finished_run(RunStatus::Error);
        log.append(&run);

        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        writeln!(file, "{{not json").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "[1,2,3]").unwrap();
        drop(file);
        log.append(&finished_run(RunStatus::Passed));

        let runs = log.load_all();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, run.run_id);
        assert_eq!(log.load_recent(1).len(), 1);
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let log = PersistenceLog::new(dir.path().join("nope"), RetentionPolicy::new());
        assert!(log.load_recent(10).is_empty());
    }

    #[test]
    fn test_append_failure_is_counted() {
        let dir = TempDir::new().unwrap();
        // The log path is a directory, so opening it for append fails
        let log_path = dir.path().join("runs.jsonl");
        fs::create_dir_all(&log_path).unwrap();
        let log = PersistenceLog::with_paths(&log_path, dir.path().join("out"), RetentionPolicy::new());

        log.append(&finished_run(RunStatus::Passed));
        log.append(&finished_run(RunStatus::Passed));

        let stats = log.stats();
        assert_eq!(stats.errors_total, 2);
        assert!(stats.last_error.is_some());
        assert!(stats.last_error_ts.is_some());
        assert_eq!(stats.persist_path, log_path);
    }

    #[test]
    fn test_retention_policy_zero_disables() {
        let policy = RetentionPolicy::new().max_runs(0).max_bytes(0);
        assert_eq!(policy, RetentionPolicy::default());
    }

    #[test]
    fn test_export_csv_and_json() {
        let dir = TempDir::new().unwrap();
        let runs = vec![finished_run(RunStatus::Passed), finished_run(RunStatus::Failed)];

        let csv_path = dir.path().join("runs.csv");
        export_runs(&runs, &csv_path, ExportFormat::Csv).unwrap();
        let csv = fs::read_to_string(&csv_path).unwrap();
        assert!(csv.starts_with("run_id,status"));
        assert_eq!(csv.lines().count(), 3);

        let json_path = dir.path().join("runs.json");
        export_runs(&runs, &json_path, ExportFormat::Json).unwrap();
        let parsed: Vec<RunRecord> =
            serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_export_format() {
        assert_eq!(ExportFormat::from_str("JSON"), Some(ExportFormat::Json));
        assert_eq!(
            ExportFormat::from_extension(Path::new("out/runs.csv")),
            Some(ExportFormat::Csv)
        );
        assert!(ExportFormat::from_str("xml").is_none());
    }
}
