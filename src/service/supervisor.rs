use crate::common::{FaceLockError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed,
    Failed(String),
    Panicked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub name: String,
    pub outcome: WorkerOutcome,
}

struct Worker {
    name: String,
    handle: JoinHandle<Result<()>>,
}

/// Owns the background worker threads and the flag that stops them.
///
/// Workers receive the shared shutdown flag and are expected to return soon
/// after it is raised. A worker that exits early is reported, never restarted.
pub struct Supervisor {
    shutdown: Arc<AtomicBool>,
    workers: Vec<Worker>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::with_flag(Arc::new(AtomicBool::new(false)))
    }

    pub fn with_flag(shutdown: Arc<AtomicBool>) -> Self {
        Self {
            shutdown,
            workers: Vec::new(),
        }
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn spawn<F>(&mut self, name: &str, work: F) -> Result<()>
    where
        F: FnOnce(Arc<AtomicBool>) -> Result<()> + Send + 'static,
    {
        let flag = Arc::clone(&self.shutdown);
        let worker_name = name.to_string();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let result = work(flag);
                if let Err(e) = &result {
                    tracing::error!("Worker {} failed: {}", worker_name, e);
                }
                result
            })
            .map_err(|e| FaceLockError::Other(anyhow::anyhow!("failed to spawn {}: {}", name, e)))?;

        tracing::info!("Started worker {}", name);
        self.workers.push(Worker {
            name: name.to_string(),
            handle,
        });
        Ok(())
    }

    pub fn running(&self) -> usize {
        self.workers.len()
    }

    /// Collects workers that have already exited, without blocking.
    pub fn poll_failures(&mut self) -> Vec<WorkerReport> {
        let (finished, running): (Vec<Worker>, Vec<Worker>) = self
            .workers
            .drain(..)
            .partition(|worker| worker.handle.is_finished());
        self.workers = running;

        finished
            .into_iter()
            .map(|worker| {
                let report = join_worker(worker);
                if !self.shutdown.load(Ordering::SeqCst) {
                    tracing::error!("Worker {} exited unexpectedly: {:?}", report.name, report.outcome);
                }
                report
            })
            .collect()
    }

    /// Raises the shutdown flag and joins every worker.
    pub fn shutdown(&mut self) -> Vec<WorkerReport> {
        self.shutdown.store(true, Ordering::SeqCst);
        let reports: Vec<WorkerReport> = self.workers.drain(..).map(join_worker).collect();
        for report in &reports {
            match &report.outcome {
                WorkerOutcome::Completed => tracing::info!("Worker {} stopped", report.name),
                other => tracing::warn!("Worker {} stopped with {:?}", report.name, other),
            }
        }
        reports
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown();
        }
    }
}

fn join_worker(worker: Worker) -> WorkerReport {
    let outcome = match worker.handle.join() {
        Ok(Ok(())) => WorkerOutcome::Completed,
        Ok(Err(e)) => WorkerOutcome::Failed(e.to_string()),
        Err(_) => WorkerOutcome::Panicked,
    };
    WorkerReport {
        name: worker.name,
        outcome,
    }
}
