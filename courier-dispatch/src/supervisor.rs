use std::sync::Arc;

use ahash::AHashMap;
use courier_common::internal;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{SupervisorError, WorkerError},
    mailer::Connector,
    worker::{Runtime, Worker},
};

/// How one worker ended.
#[derive(Debug)]
pub struct WorkerReport {
    pub worker: String,
    pub result: Result<(), WorkerError>,
}

/// Owns a set of workers and the token that stops them.
///
/// Each worker runs as its own task. A worker that fails at startup is
/// reported and not restarted; the others keep running.
pub struct Supervisor<C> {
    runtime: Arc<Runtime<C>>,
    workers: Vec<Worker>,
    tasks: JoinSet<WorkerReport>,
    names: AHashMap<Id, String>,
    token: CancellationToken,
}

impl<C: Connector> Supervisor<C> {
    pub fn new(runtime: Runtime<C>) -> Self {
        Self {
            runtime: Arc::new(runtime),
            workers: Vec::new(),
            tasks: JoinSet::new(),
            names: AHashMap::new(),
            token: CancellationToken::new(),
        }
    }

    /// Queue `worker` to be started by [`Supervisor::run`].
    pub fn add_worker(&mut self, worker: Worker) -> &mut Self {
        self.workers.push(worker);
        self
    }

    /// The token every worker watches. Cancelling it has the same effect as
    /// [`Supervisor::stop`] without waiting.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Start every queued worker.
    pub fn run(&mut self) -> Result<(), SupervisorError> {
        if self.workers.is_empty() && self.tasks.is_empty() {
            return Err(SupervisorError::NoWorkers);
        }

        for worker in self.workers.drain(..) {
            let name = worker.name().to_string();
            let runtime = Arc::clone(&self.runtime);
            let token = self.token.child_token();

            internal!(level = INFO, worker = %name, "Starting worker {worker}");
            let task = self.tasks.spawn({
                let name = name.clone();
                async move {
                    let result = worker.run(runtime, token).await;
                    WorkerReport {
                        worker: name,
                        result,
                    }
                }
            });
            self.names.insert(task.id(), name);
        }

        Ok(())
    }

    /// Number of started workers that have not finished.
    #[must_use]
    pub fn running(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every started worker to finish.
    ///
    /// A worker task that panicked is reported as [`WorkerError::Panicked`].
    pub async fn wait(&mut self) -> Vec<WorkerReport> {
        let mut reports = Vec::with_capacity(self.tasks.len());

        while let Some(joined) = self.tasks.join_next_with_id().await {
            let report = match joined {
                Ok((id, report)) => {
                    self.names.remove(&id);
                    report
                }
                Err(err) => WorkerReport {
                    worker: self
                        .names
                        .remove(&err.id())
                        .unwrap_or_else(|| "unknown".to_string()),
                    result: Err(WorkerError::Panicked(err.to_string())),
                },
            };

            match &report.result {
                Ok(()) => internal!(level = INFO, worker = %report.worker, "Worker stopped"),
                Err(err) => {
                    internal!(level = ERROR, worker = %report.worker, "Worker failed: {err}");
                }
            }

            reports.push(report);
        }

        reports
    }

    /// Ask every worker to shut down and wait for them.
    pub async fn stop(&mut self) -> Vec<WorkerReport> {
        let mut names: Vec<&str> = self.names.values().map(String::as_str).collect();
        names.sort_unstable();
        internal!(level = INFO, "Stopping {} worker(s): {}", names.len(), names.join(", "));
        self.token.cancel();
        self.wait().await
    }
}
