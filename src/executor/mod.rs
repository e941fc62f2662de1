//! Test execution
//!
//! The external runner abstraction and the background worker pool.

mod pool;
mod runner;

pub use pool::WorkerPool;
pub use runner::{
    parse_summary, resolve_module_args, CommandRunner, RunOutcome, RunSummary, TestRunner,
};
