//! Run record models for queued test executions
//!
//! Defines run filters, lifecycle status and the run record itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Lifecycle status of a queued run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Passed,
    Failed,
    Error,
}

impl RunStatus {
    pub fn symbol(&self) -> &'static str {
        match self {
            RunStatus::Queued => "…",
            RunStatus::Running => "▶",
            RunStatus::Passed => "✓",
            RunStatus::Failed => "✗",
            RunStatus::Error => "!",
        }
    }

    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Passed | RunStatus::Failed | RunStatus::Error)
    }

    /// Position in the lifecycle, used to check that transitions only move forward
    pub fn rank(&self) -> u8 {
        match self {
            RunStatus::Queued => 0,
            RunStatus::Running => 1,
            RunStatus::Passed | RunStatus::Failed | RunStatus::Error => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
            RunStatus::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<RunStatus> {
        match s.trim().to_lowercase().as_str() {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "passed" | "pass" => Some(RunStatus::Passed),
            "failed" | "fail" => Some(RunStatus::Failed),
            "error" => Some(RunStatus::Error),
            _ => None,
        }
    }

    /// Map a runner exit code to a terminal status
    pub fn from_exit_code(code: i32) -> RunStatus {
        if code == 0 {
            RunStatus::Passed
        } else {
            RunStatus::Failed
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str().to_uppercase())
    }
}

/// Test selection for a run.
///
/// Explicit node ids take precedence over the keyword and module filters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFilters {
    #[serde(default)]
    pub nodeids: Option<Vec<String>>,
    #[serde(default)]
    pub k_expr: Option<String>,
    #[serde(default)]
    pub module_substr: Option<String>,
}

impl RunFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keyword(mut self, expr: impl Into<String>) -> Self {
        self.k_expr = Some(expr.into());
        self
    }

    pub fn module(mut self, substr: impl Into<String>) -> Self {
        self.module_substr = Some(substr.into());
        self
    }

    pub fn nodeids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        self.nodeids = if ids.is_empty() { None } else { Some(ids) };
        self
    }

    /// Explicit ids, if any were given
    pub fn explicit_ids(&self) -> Option<&[String]> {
        self.nodeids.as_deref().filter(|ids| !ids.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.explicit_ids().is_none()
            && self.k_expr.as_deref().map_or(true, str::is_empty)
            && self.module_substr.as_deref().map_or(true, str::is_empty)
    }
}

impl fmt::Display for RunFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ids) = self.explicit_ids() {
            return write!(f, "ids[{}]", ids.join(","));
        }
        let mut parts = Vec::new();
        if let Some(k) = self.k_expr.as_deref().filter(|k| !k.is_empty()) {
            parts.push(format!("-k {k}"));
        }
        if let Some(m) = self.module_substr.as_deref().filter(|m| !m.is_empty()) {
            parts.push(format!("module {m}"));
        }
        if parts.is_empty() {
            write!(f, "all")
        } else {
            write!(f, "{}", parts.join(" "))
        }
    }
}

/// One requested test execution and its lifecycle.
///
/// Serialized as a single JSON object per persisted line. Result fields
/// default when absent so that older log lines still load.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    #[serde(flatten)]
    pub filters: RunFilters,
    pub status: RunStatus,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub passed: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
    #[serde(default)]
    pub duration_s: Option<f64>,
    #[serde(default)]
    pub output_saved: bool,
}

impl RunRecord {
    /// Create a new queued run with a fresh id
    pub fn new(filters: RunFilters) -> Self {
        Self {
            run_id: generate_run_id(),
            filters,
            status: RunStatus::Queued,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            passed: 0,
            failed: 0,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            duration_s: None,
            output_saved: false,
        }
    }

    /// Claim the run for execution. Returns false if it was not queued.
    pub fn claim(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != RunStatus::Queued || self.started_at.is_some() {
            return false;
        }
        self.status = RunStatus::Running;
        self.started_at = Some(now.max(self.queued_at));
        true
    }

    /// Move a running record into its terminal state and stamp the duration
    pub fn finish(&mut self, status: RunStatus, now: DateTime<Utc>) {
        debug_assert!(status.is_terminal());
        if self.status.is_terminal() {
            return;
        }
        let started = *self.started_at.get_or_insert(now.max(self.queued_at));
        let finished = now.max(started);
        self.finished_at = Some(finished);
        self.status = status;
        let secs = (finished - started).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0;
        self.duration_s = Some(round4(secs));
    }

    pub fn is_truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }

    /// Timestamps are ordered queued <= started <= finished wherever set
    pub fn timestamps_ordered(&self) -> bool {
        let started_ok = self.started_at.map_or(true, |s| self.queued_at <= s);
        let finished_ok = match (self.started_at, self.finished_at) {
            (Some(s), Some(f)) => s <= f,
            (None, Some(_)) => false,
            _ => true,
        };
        started_ok && finished_ok
    }
}

impl fmt::Display for RunRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}] {}",
            self.status.symbol(),
            self.run_id,
            self.status,
            self.filters
        )?;
        if self.status.is_terminal() {
            write!(f, " - {} passed, {} failed", self.passed, self.failed)?;
            if let Some(d) = self.duration_s {
                write!(f, " in {d:.2}s")?;
            }
        }
        Ok(())
    }
}

pub(crate) fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

static RUN_SEQUENCE: AtomicU32 = AtomicU32::new(0);

const RANDOM_MASK: u64 = (1 << 40) - 1;

/// Generate a unique run id.
///
/// Ids are `<UTC timestamp><sequence><random>`. The per-process sequence
/// keeps ids distinct within one process; 40 random bits keep separate
/// processes writing the same log apart.
pub fn generate_run_id() -> String {
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    let seq = RUN_SEQUENCE.fetch_add(1, Ordering::Relaxed) % 0x10000;
    let random = rand::random::<u64>() & RANDOM_MASK;
    format!("{timestamp}{seq:04x}{random:010x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::HashSet;

    #[test]
    fn test_status_terminal() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Passed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Error.is_terminal());
    }

    #[test]
    fn test_status_from_exit_code() {
        assert_eq!(RunStatus::from_exit_code(0), RunStatus::Passed);
        assert_eq!(RunStatus::from_exit_code(1), RunStatus::Failed);
        assert_eq!(RunStatus::from_exit_code(5), RunStatus::Failed);
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&RunStatus::Passed).unwrap();
        assert_eq!(json, "\"passed\"");
        assert_eq!(RunStatus::from_str(" Error "), Some(RunStatus::Error));
        assert_eq!(RunStatus::from_str("unknown"), None);
    }

    #[test]
    fn test_unique_ids() {
        let ids: HashSet<String> = (0..1000).map(|_| generate_run_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_id_random_part_distinct_across_processes() {
        let id = generate_run_id();
        assert_eq!(id.len(), 14 + 4 + 10);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));

        // A fresh process restarts the sequence, so the random suffix alone
        // has to keep ids apart
        let suffixes: HashSet<String> = (0..1000)
            .map(|_| generate_run_id()[18..].to_string())
            .collect();
        assert_eq!(suffixes.len(), 1000);
    }

    #[test]
    fn test_filters_display_prefers_ids() {
        let filters = RunFilters::new()
            .keyword("metrics")
            .nodeids(["tests/test_a.py::test_one"]);
        assert_eq!(filters.to_string(), "ids[tests/test_a.py::test_one]");
        assert_eq!(RunFilters::new().to_string(), "all");
        assert!(RunFilters::new().nodeids(Vec::<String>::new()).is_empty());
    }

    #[test]
    fn test_lifecycle_moves_forward() {
        let mut run = RunRecord::new(RunFilters::new().keyword("x"));
        assert_eq!(run.status, RunStatus::Queued);

        let start = run.queued_at + Duration::milliseconds(5);
        assert!(run.claim(start));
        assert!(!run.claim(start), "second claim must be rejected");
        assert_eq!(run.status, RunStatus::Running);

        run.finish(RunStatus::Passed, start + Duration::milliseconds(250));
        assert_eq!(run.status, RunStatus::Passed);
        assert_eq!(run.duration_s, Some(0.25));
        assert!(run.timestamps_ordered());

        // Terminal states are final
        run.finish(RunStatus::Error, start + Duration::seconds(10));
        assert_eq!(run.status, RunStatus::Passed);
        assert_eq!(run.duration_s, Some(0.25));
    }

    #[test]
    fn test_clock_skew_does_not_break_ordering() {
        let mut run = RunRecord::new(RunFilters::new());
        let earlier = run.queued_at - Duration::seconds(3);
        run.claim(earlier);
        run.finish(RunStatus::Failed, earlier);
        assert!(run.timestamps_ordered());
        assert_eq!(run.duration_s, Some(0.0));
    }

    #[test]
    fn test_record_tolerates_unknown_fields() {
        let line = r#"{"run_id":"abc","k_expr":"metrics","status":"failed",
            "queued_at":"2024-01-01T00:00:00Z","reviewer":"someone","failed":2}"#;
        let run: RunRecord = serde_json::from_str(line).unwrap();
        assert_eq!(run.run_id, "abc");
        assert_eq!(run.filters.k_expr.as_deref(), Some("metrics"));
        assert_eq!(run.failed, 2);
        assert_eq!(run.passed, 0);
        assert!(run.started_at.is_none());
    }
}
