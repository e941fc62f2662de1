//! testqueue -- local test-run queue with history, metrics and retention.
//!
//! Requests to run a filtered subset of an external test suite are queued,
//! executed by background workers or in poll mode, tracked through their
//! lifecycle and persisted to an append-only JSON-lines log.
//!
//! ```no_run
//! use std::sync::Arc;
//! use testqueue::{QueueConfig, RunFilters, TestQueue, WorkerPool};
//!
//! # async fn demo() {
//! let config = QueueConfig::default();
//! let queue = Arc::new(TestQueue::from_config(&config));
//! let pool = WorkerPool::new(Arc::clone(&queue));
//! pool.ensure_workers(2);
//!
//! let run_id = queue.submit(RunFilters::new().keyword("metrics"));
//! queue.wait_idle(config.timeout()).await;
//! println!("{:?}", queue.get_status(&run_id));
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod models;
pub mod output;
pub mod queue;
pub mod results;
pub mod utils;

pub use config::{QueueConfig, RunnerConfig};
pub use error::{ExecutionError, PersistenceError};
pub use executor::{CommandRunner, RunOutcome, TestRunner, WorkerPool};
pub use models::{RunFilters, RunRecord, RunStatus};
pub use queue::{AggregateMetrics, TestQueue};
pub use results::{FullOutput, PersistenceLog, PersistenceStats, RetentionPolicy};
