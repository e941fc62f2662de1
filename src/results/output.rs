//! Output truncation and full-output recovery
//!
//! Large stdout/stderr is capped for in-memory display. The untruncated text
//! goes to a pair of side files named after the run id.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{PersistenceError, PersistenceResult};
use crate::models::RunRecord;

pub const STDOUT_SUFFIX: &str = "_stdout.out";
pub const STDERR_SUFFIX: &str = "_stderr.out";

/// Note attached to a recovered output
pub const NOTE_COMPLETE: &str = "complete";
pub const NOTE_RECOVERED: &str = "full output recovered from file";
pub const NOTE_MISSING: &str = "truncated (raw file missing)";

/// Cap `text` at `max_len` characters.
///
/// Returns the (possibly annotated) copy and whether anything was cut.
pub fn truncate(text: &str, max_len: usize) -> (String, bool) {
    let total = text.chars().count();
    if total <= max_len {
        return (text.to_string(), false);
    }
    let cut = text
        .char_indices()
        .nth(max_len)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    let omitted = total - max_len;
    (
        format!("{}\n... <truncated {omitted} chars>", &text[..cut]),
        true,
    )
}

/// Full output of a run as returned to readers
#[derive(Clone, Debug, Serialize)]
pub struct FullOutput {
    pub run_id: String,
    pub stdout: String,
    pub stderr: String,
    pub truncated_stdout: bool,
    pub truncated_stderr: bool,
    pub note: String,
}

/// Side-file storage for untruncated outputs
#[derive(Clone, Debug)]
pub struct OutputStore {
    dir: PathBuf,
    max_len: usize,
}

impl OutputStore {
    pub fn new(dir: impl Into<PathBuf>, max_len: usize) -> Self {
        Self {
            dir: dir.into(),
            max_len,
        }
    }

    pub fn stdout_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}{STDOUT_SUFFIX}"))
    }

    pub fn stderr_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}{STDERR_SUFFIX}"))
    }

    /// Truncate both streams into the record.
    ///
    /// When anything was truncated the full text is written to side files;
    /// `output_saved` is set only when both writes succeed. A write failure
    /// is returned so the caller can count it, the record stays usable.
    pub fn apply(
        &self,
        run: &mut RunRecord,
        full_stdout: &str,
        full_stderr: &str,
    ) -> PersistenceResult<()> {
        let (stdout, stdout_truncated) = truncate(full_stdout, self.max_len);
        let (stderr, stderr_truncated) = truncate(full_stderr, self.max_len);
        run.stdout = stdout;
        run.stderr = stderr;
        run.stdout_truncated = stdout_truncated;
        run.stderr_truncated = stderr_truncated;
        run.output_saved = false;

        if stdout_truncated || stderr_truncated {
            self.save(&run.run_id, full_stdout, full_stderr)?;
            run.output_saved = true;
            debug!(run_id = %run.run_id, "Saved full output to {}", self.dir.display());
        }
        Ok(())
    }

    fn save(&self, run_id: &str, stdout: &str, stderr: &str) -> PersistenceResult<()> {
        fs::create_dir_all(&self.dir).map_err(|e| PersistenceError::io(&self.dir, e))?;
        let stdout_path = self.stdout_path(run_id);
        fs::write(&stdout_path, stdout).map_err(|e| PersistenceError::io(&stdout_path, e))?;
        let stderr_path = self.stderr_path(run_id);
        fs::write(&stderr_path, stderr).map_err(|e| PersistenceError::io(&stderr_path, e))?;
        Ok(())
    }

    /// Recover the full output of a run, falling back to the stored text
    pub fn full_output(&self, run: &RunRecord) -> FullOutput {
        let stdout_path = self.stdout_path(&run.run_id);
        let stderr_path = self.stderr_path(&run.run_id);
        let stdout_file = read_lossy(&stdout_path);
        let stderr_file = read_lossy(&stderr_path);

        let note = if !run.is_truncated() {
            NOTE_COMPLETE
        } else if stdout_file.is_some() || stderr_file.is_some() {
            NOTE_RECOVERED
        } else {
            NOTE_MISSING
        };

        FullOutput {
            run_id: run.run_id.clone(),
            stdout: stdout_file.unwrap_or_else(|| run.stdout.clone()),
            stderr: stderr_file.unwrap_or_else(|| run.stderr.clone()),
            truncated_stdout: run.stdout_truncated,
            truncated_stderr: run.stderr_truncated,
            note: note.to_string(),
        }
    }
}

fn read_lossy(path: &Path) -> Option<String> {
    fs::read(path)
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}
