//! Background worker pool
//!
//! Workers are tokio tasks looping on [`TestQueue::process_next`]. An idle
//! worker waits for a submit notification, re-checking the queue at a fixed
//! interval as a fallback. Shutdown is cooperative: the stop flag is seen at
//! the next loop boundary and in-flight runs finish on their own.

use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::queue::TestQueue;
use crate::utils::lock;

/// Pool of background workers draining a [`TestQueue`]
pub struct WorkerPool {
    queue: Arc<TestQueue>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
    idle_interval: Duration,
}

impl WorkerPool {
    pub fn new(queue: Arc<TestQueue>) -> Self {
        Self {
            queue,
            workers: Mutex::new(Vec::new()),
            stop: Arc::new(AtomicBool::new(false)),
            idle_interval: Duration::from_millis(500),
        }
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn queue(&self) -> &Arc<TestQueue> {
        &self.queue
    }

    /// Start workers until `target` are running. Idempotent; `0` starts
    /// nothing and leaves the queue in poll mode. Returns the worker count.
    ///
    /// Must be called from within a tokio runtime.
    pub fn ensure_workers(&self, target: usize) -> usize {
        let mut workers = lock(&self.workers);
        if self.stop.load(Ordering::Acquire) {
            return workers.len();
        }
        while workers.len() < target {
            let id = workers.len() + 1;
            let queue = Arc::clone(&self.queue);
            let stop = Arc::clone(&self.stop);
            let idle = self.idle_interval;
            workers.push(tokio::spawn(worker_loop(id, queue, stop, idle)));
        }
        if target > 0 {
            info!("Worker pool running {} workers", workers.len());
        }
        workers.len()
    }

    pub fn worker_count(&self) -> usize {
        lock(&self.workers).len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Ask all workers to stop after their current iteration
    pub fn shutdown(&self) {
        if !self.stop.swap(true, Ordering::AcqRel) {
            info!("Stopping worker pool");
        }
        self.queue.wake_all();
    }

    /// Stop and wait for every worker task to exit
    pub async fn join(&self) {
        self.shutdown();
        let handles: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        join_all(handles).await;
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.queue.wake_all();
    }
}

async fn worker_loop(id: usize, queue: Arc<TestQueue>, stop: Arc<AtomicBool>, idle: Duration) {
    debug!("Worker {id} started");
    while !stop.load(Ordering::Acquire) {
        if let Some(run_id) = queue.process_next().await {
            debug!("Worker {id} processed {run_id}");
            continue;
        }
        tokio::select! {
            _ = queue.work_available() => {}
            _ = tokio::time::sleep(idle) => {}
        }
    }
    debug!("Worker {id} stopped");
}
