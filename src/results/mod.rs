//! Results persistence
//!
//! Output truncation with side files, the append-only run log with
//! retention, and export of run history.

pub mod output;
pub mod storage;

pub use output::{truncate, FullOutput, OutputStore};
pub use storage::{
    export_runs, ExportFormat, PersistenceLog, PersistenceStats, RetentionPolicy,
};
