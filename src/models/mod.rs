//! Data models for queued test runs

mod run;

pub(crate) use run::round4;
pub use run::{generate_run_id, RunFilters, RunRecord, RunStatus};
