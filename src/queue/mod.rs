//! In-process test-run queue
//!
//! Runs are submitted into a FIFO queue, claimed one at a time by
//! [`TestQueue::process_next`] (called by background workers or by the
//! caller in poll mode), executed through a [`TestRunner`], and moved into
//! a bounded in-memory history and the persistent log once finished.
//!
//! Queue and history share one mutex. It is held only for short in-memory
//! updates, never across the runner call or file I/O.

mod metrics;

pub use metrics::AggregateMetrics;

use chrono::Utc;
use futures::FutureExt;
use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::{ExecutionError, PersistenceError};
use crate::executor::{parse_summary, CommandRunner, TestRunner};
use crate::models::{RunFilters, RunRecord, RunStatus};
use crate::utils::lock;
use crate::results::{FullOutput, OutputStore, PersistenceLog, PersistenceStats};
use crate::utils::Timer;

#[derive(Debug, Default)]
struct QueueState {
    /// Queued and running records in submission order
    active: Vec<RunRecord>,
    /// Finished records, oldest first
    history: VecDeque<RunRecord>,
}

/// Test-run queue with history and persistence
pub struct TestQueue {
    state: Mutex<QueueState>,
    runner: Arc<dyn TestRunner>,
    outputs: OutputStore,
    log: Arc<PersistenceLog>,
    timeout: Duration,
    history_capacity: usize,
    /// Raised on submit so idle workers pick up new work
    work_available: Notify,
    /// Raised whenever a run finishes
    run_finished: Notify,
}

impl TestQueue {
    /// Create a queue using the configured external command runner
    pub fn from_config(config: &QueueConfig) -> Self {
        let runner = Arc::new(CommandRunner::from_config(&config.runner));
        Self::new(config, runner)
    }

    /// Create a queue with a custom runner
    pub fn new(config: &QueueConfig, runner: Arc<dyn TestRunner>) -> Self {
        let log = Arc::new(PersistenceLog::new(&config.data_dir, config.retention()));
        let outputs = OutputStore::new(log.outputs_dir(), config.max_output);
        Self {
            state: Mutex::new(QueueState::default()),
            runner,
            outputs,
            log,
            timeout: config.timeout(),
            history_capacity: config.history_capacity.max(1),
            work_available: Notify::new(),
            run_finished: Notify::new(),
        }
    }

    /// Queue a new run and return its id immediately
    pub fn submit(&self, filters: RunFilters) -> String {
        let run = RunRecord::new(filters);
        let run_id = run.run_id.clone();
        info!(run_id = %run_id, "Queued run ({})", run.filters);
        lock(&self.state).active.push(run);
        self.work_available.notify_one();
        run_id
    }

    /// Claim and execute the oldest queued run.
    ///
    /// Returns the processed id, or `None` if nothing was pending.
    pub async fn process_next(&self) -> Option<String> {
        let claimed = self.claim_next()?;
        let run_id = claimed.run_id.clone();

        let finished = self.execute(claimed).await;
        self.finalize(finished).await;
        Some(run_id)
    }

    /// Atomically mark the first queued run as running and return a copy.
    ///
    /// The status flip happens under the same lock as the scan, so a record
    /// is claimed at most once.
    fn claim_next(&self) -> Option<RunRecord> {
        let mut state = lock(&self.state);
        let run = state
            .active
            .iter_mut()
            .find(|r| r.status == RunStatus::Queued)?;
        if !run.claim(Utc::now()) {
            return None;
        }
        debug!(run_id = %run.run_id, "Claimed run");
        Some(run.clone())
    }

    async fn execute(&self, mut run: RunRecord) -> RunRecord {
        let timer = Timer::start(format!("run {}", run.run_id));
        let call = tokio::time::timeout(self.timeout, self.runner.execute(&run.filters, self.timeout));

        let result = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ExecutionError::Timeout(self.timeout.as_secs())),
            Err(panic) => Err(ExecutionError::Panicked(panic_message(panic.as_ref()))),
        };

        let status = match result {
            Ok(outcome) => {
                let summary = parse_summary(&outcome.stdout);
                run.passed = summary.passed;
                run.failed = summary.failed;
                if let Err(e) = self.outputs.apply(&mut run, &outcome.stdout, &outcome.stderr) {
                    self.log.record_failure(e);
                }
                RunStatus::from_exit_code(outcome.exit_code)
            }
            Err(e) => {
                warn!(run_id = %run.run_id, "Run failed to execute: {e}");
                run.stdout.clear();
                run.stderr = e.to_string();
                RunStatus::Error
            }
        };

        run.finish(status, Utc::now());
        timer.stop();
        info!(
            run_id = %run.run_id,
            "Run finished: {} ({} passed, {} failed)",
            run.status,
            run.passed,
            run.failed
        );
        run
    }

    /// Move a finished run from the queue into history, then persist it.
    ///
    /// The append and its retention pass run on the blocking pool.
    async fn finalize(&self, run: RunRecord) {
        {
            let mut state = lock(&self.state);
            state.active.retain(|r| r.run_id != run.run_id);
            state.history.push_back(run.clone());
            while state.history.len() > self.history_capacity {
                state.history.pop_front();
            }
        }
        let log = Arc::clone(&self.log);
        if let Err(e) = tokio::task::spawn_blocking(move || log.append(&run)).await {
            let err = std::io::Error::new(std::io::ErrorKind::Other, e.to_string());
            self.log.record_failure(PersistenceError::io(self.log.path(), err));
        }
        self.run_finished.notify_waiters();
    }

    /// Submit a run and drive the queue until it has finished
    pub async fn run_immediate(&self, filters: RunFilters) -> Option<RunRecord> {
        let run_id = self.submit(filters);
        loop {
            let finished = self.run_finished.notified();
            if let Some(run) = self.get_status(&run_id) {
                if run.status.is_terminal() {
                    return Some(run);
                }
            } else {
                return None;
            }
            if self.process_next().await.is_none() {
                // Claimed by a worker; wait for it to finish
                tokio::select! {
                    _ = finished => {}
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                }
            }
        }
    }

    /// Look up a run: active queue, then in-memory history, then the log
    pub fn get_status(&self, run_id: &str) -> Option<RunRecord> {
        {
            let state = lock(&self.state);
            let found = state
                .active
                .iter()
                .chain(state.history.iter().rev())
                .find(|r| r.run_id == run_id);
            if let Some(run) = found {
                return Some(run.clone());
            }
        }
        self.log
            .load_all()
            .into_iter()
            .rev()
            .find(|r| r.run_id == run_id)
    }

    /// Re-submit the filters of an existing run under a new id
    pub fn retry(&self, run_id: &str) -> Option<String> {
        let original = self.get_status(run_id)?;
        let new_id = self.submit(original.filters);
        info!(run_id = %run_id, new_run_id = %new_id, "Retrying run");
        Some(new_id)
    }

    /// List runs: active first, then in-memory history newest first, then
    /// optionally persisted history newest first. De-duplicated by id with
    /// that priority, filtered by status, capped at `limit`.
    pub fn list_runs(
        &self,
        limit: usize,
        statuses: Option<&[RunStatus]>,
        include_persisted: bool,
    ) -> Vec<RunRecord> {
        let mut combined: Vec<RunRecord> = {
            let state = lock(&self.state);
            state
                .active
                .iter()
                .cloned()
                .chain(state.history.iter().rev().cloned())
                .collect()
        };
        if include_persisted {
            let persisted = self.log.load_recent(limit.saturating_mul(2));
            combined.extend(persisted.into_iter().rev());
        }

        let mut seen = HashSet::new();
        combined
            .into_iter()
            .filter(|r| statuses.map_or(true, |s| s.contains(&r.status)))
            .filter(|r| seen.insert(r.run_id.clone()))
            .take(limit)
            .collect()
    }

    /// Full output of a run, recovered from side files when truncated
    pub fn get_full_output(&self, run_id: &str) -> Option<FullOutput> {
        let run = self.get_status(run_id)?;
        Some(self.outputs.full_output(&run))
    }

    /// Metrics over the newest `limit` finished runs held in memory
    pub fn aggregate_metrics(&self, limit: usize) -> AggregateMetrics {
        let recent: Vec<RunRecord> = {
            let state = lock(&self.state);
            let skip = state.history.len().saturating_sub(limit);
            state.history.iter().skip(skip).cloned().collect()
        };
        AggregateMetrics::from_runs(&recent)
    }

    pub fn persistence_stats(&self) -> PersistenceStats {
        self.log.stats()
    }

    /// Load the newest persisted runs into the in-memory history.
    /// Returns the number of runs restored.
    pub fn restore_history(&self) -> usize {
        let persisted = self.log.load_recent(self.history_capacity);
        let mut state = lock(&self.state);
        let known: HashSet<String> = state.history.iter().map(|r| r.run_id.clone()).collect();
        let mut restored = 0;
        for run in persisted.into_iter().filter(|r| !known.contains(&r.run_id)) {
            state.history.push_back(run);
            restored += 1;
        }
        state
            .history
            .make_contiguous()
            .sort_by(|a, b| a.finished_at.cmp(&b.finished_at));
        while state.history.len() > self.history_capacity {
            state.history.pop_front();
        }
        restored
    }

    /// Number of queued runs not yet claimed
    pub fn pending_count(&self) -> usize {
        lock(&self.state)
            .active
            .iter()
            .filter(|r| r.status == RunStatus::Queued)
            .count()
    }

    /// Number of queued or running runs
    pub fn active_count(&self) -> usize {
        lock(&self.state).active.len()
    }

    pub fn history_len(&self) -> usize {
        lock(&self.state).history.len()
    }

    pub fn log(&self) -> &PersistenceLog {
        &self.log
    }

    /// Wait until a new run is submitted (or a stray notification arrives)
    pub(crate) async fn work_available(&self) {
        self.work_available.notified().await;
    }

    /// Wake every idle worker, used on shutdown
    pub(crate) fn wake_all(&self) {
        self.work_available.notify_waiters();
    }

    /// Wait until no run is queued or running, or the deadline passes.
    /// Returns true if the queue drained.
    pub async fn wait_idle(&self, deadline: Duration) -> bool {
        let wait = async {
            loop {
                let finished = self.run_finished.notified();
                if self.active_count() == 0 {
                    return;
                }
                tokio::select! {
                    _ = finished => {}
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                }
            }
        };
        tokio::time::timeout(deadline, wait).await.is_ok()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
