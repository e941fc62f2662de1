//! Error types for the run queue
//!
//! Execution failures end up as a run's `error` status; persistence
//! failures end up in the persistence health counters. Neither reaches the
//! caller that submitted the run.

use std::path::PathBuf;
use thiserror::Error;

/// The external test runner could not produce a result
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to spawn test runner `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Test runner timed out after {0} seconds")]
    Timeout(u64),

    #[error("Test runner I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Test runner panicked: {0}")]
    Panicked(String),
}

/// Writing the history log, side files or applying retention failed
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize run {run_id}: {source}")]
    Serialize {
        run_id: String,
        #[source]
        source: serde_json::Error,
    },
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;
