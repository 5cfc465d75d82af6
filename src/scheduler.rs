//! Dispatcher facade over the three workers.
//!
//! Routing is static: every task kind maps to exactly one worker. The
//! scheduler keeps no task state of its own.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::config::{ConfigStore, WorkerKind, WorkerSettings};
use crate::device::Hardware;
use crate::error::SubmitError;
use crate::task::{Task, TaskId, TaskKind, TaskRequest, TaskState};
use crate::worker::{ImageWorker, LlmWorker, TtsWorker, Worker, WorkerStats};

/// What happened to one worker during `Scheduler::initialize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum InitOutcome {
    Started,
    /// Disabled in configuration.
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InitReport {
    pub workers: BTreeMap<WorkerKind, InitOutcome>,
}

impl InitReport {
    pub fn all_started(&self) -> bool {
        self.workers
            .values()
            .all(|outcome| *outcome == InitOutcome::Started)
    }

    pub fn started(&self) -> Vec<WorkerKind> {
        self.with_outcome(|outcome| *outcome == InitOutcome::Started)
    }

    pub fn failed(&self) -> Vec<WorkerKind> {
        self.with_outcome(|outcome| matches!(outcome, InitOutcome::Failed(_)))
    }

    pub fn outcome(&self, kind: WorkerKind) -> Option<&InitOutcome> {
        self.workers.get(&kind)
    }

    fn with_outcome(&self, f: impl Fn(&InitOutcome) -> bool) -> Vec<WorkerKind> {
        self.workers
            .iter()
            .filter(|(_, outcome)| f(outcome))
            .map(|(kind, _)| *kind)
            .collect()
    }
}

/// Totals across all workers plus the per-worker snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub workers: Vec<WorkerStats>,
    pub running_workers: usize,
    pub busy_workers: usize,
    pub queued_tasks: usize,
    pub active_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub cancelled_tasks: u64,
    pub slow_tasks: u64,
}

impl SchedulerStats {
    fn from_workers(workers: Vec<WorkerStats>) -> Self {
        Self {
            running_workers: workers.iter().filter(|w| w.running).count(),
            busy_workers: workers.iter().filter(|w| w.busy).count(),
            queued_tasks: workers.iter().map(|w| w.queued_tasks).sum(),
            active_tasks: workers.iter().map(|w| w.active_tasks).sum(),
            completed_tasks: workers.iter().map(|w| w.completed_tasks).sum(),
            failed_tasks: workers.iter().map(|w| w.failed_tasks).sum(),
            cancelled_tasks: workers.iter().map(|w| w.cancelled_tasks).sum(),
            slow_tasks: workers.iter().map(|w| w.slow_tasks).sum(),
            workers,
        }
    }
}

pub struct Scheduler {
    config: Arc<ConfigStore>,
    workers: BTreeMap<WorkerKind, Arc<dyn Worker>>,
}

impl Scheduler {
    /// Build the three standard workers from configuration.
    pub fn new(config: Arc<ConfigStore>) -> Self {
        let hardware = Hardware::from_config(&config);
        tracing::debug!(hardware = ?hardware, "Building workers");
        let workers: Vec<Arc<dyn Worker>> = vec![
            Arc::new(LlmWorker::new(Arc::clone(&config), hardware.clone())),
            Arc::new(TtsWorker::new(Arc::clone(&config), hardware.clone())),
            Arc::new(ImageWorker::new(Arc::clone(&config), hardware)),
        ];
        Self::with_workers(config, workers)
    }

    /// Use caller-supplied workers. A later worker of the same kind replaces
    /// an earlier one.
    pub fn with_workers(config: Arc<ConfigStore>, workers: Vec<Arc<dyn Worker>>) -> Self {
        let mut by_kind = BTreeMap::new();
        for worker in workers {
            if let Some(previous) = by_kind.insert(worker.kind(), worker) {
                tracing::warn!(worker = previous.name(), "Replacing worker of the same kind");
            }
        }
        Self {
            config,
            workers: by_kind,
        }
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn worker(&self, kind: WorkerKind) -> Option<&Arc<dyn Worker>> {
        self.workers.get(&kind)
    }

    /// Start every enabled worker. One failure never stops the others.
    pub fn initialize(&self) -> InitReport {
        let mut report = InitReport::default();
        for (kind, worker) in &self.workers {
            let outcome = if !WorkerSettings::from_store(&self.config, *kind).enabled {
                tracing::info!(worker = worker.name(), "Worker disabled, skipping");
                InitOutcome::Skipped
            } else {
                match worker.initialize() {
                    Ok(()) => InitOutcome::Started,
                    Err(e) => {
                        tracing::error!(worker = worker.name(), error = %e, "Worker failed to start");
                        InitOutcome::Failed(e.to_string())
                    }
                }
            };
            report.workers.insert(*kind, outcome);
        }

        tracing::info!(
            started = report.started().len(),
            failed = report.failed().len(),
            "Scheduler initialized"
        );
        report
    }

    /// Stop every worker. Queued tasks are reported as cancelled.
    pub fn shutdown(&self) {
        for worker in self.workers.values() {
            worker.shutdown();
        }
        tracing::info!("Scheduler stopped");
    }

    pub fn submit(&self, request: TaskRequest) -> Result<TaskId, SubmitError> {
        self.submit_task(Task::from_request(request))
    }

    /// Route an already-built pending task to its worker.
    pub fn submit_task(&self, task: Task) -> Result<TaskId, SubmitError> {
        let kind = task.kind.worker_kind();
        let worker = self
            .workers
            .get(&kind)
            .ok_or_else(|| SubmitError::NotInitialized {
                worker: kind.key().to_string(),
            })?;
        worker.submit_task(task)
    }

    pub fn cancel(&self, kind: TaskKind, task_id: &str) -> bool {
        self.workers
            .get(&kind.worker_kind())
            .is_some_and(|worker| worker.cancel_task(task_id))
    }

    /// State of a task that is still queued or executing.
    pub fn task_state(&self, task_id: &str) -> Option<TaskState> {
        self.workers
            .values()
            .find_map(|worker| worker.task_state(task_id))
    }

    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        self.workers.values().map(|worker| worker.stats()).collect()
    }

    pub fn aggregate_stats(&self) -> SchedulerStats {
        SchedulerStats::from_workers(self.worker_stats())
    }

    /// Fan out to every worker. Called once per task on the owning worker's
    /// thread.
    pub fn set_task_completed_callback<F>(&self, callback: F)
    where
        F: Fn(&Task) + Send + Sync + 'static,
    {
        let callback: Arc<dyn Fn(&Task) + Send + Sync> = Arc::new(callback);
        for worker in self.workers.values() {
            worker.set_task_completed_callback(Arc::clone(&callback));
        }
    }

    /// `(task_id, fraction)` from the image worker.
    pub fn set_progress_callback<F>(&self, callback: F)
    where
        F: Fn(&str, f32) + Send + Sync + 'static,
    {
        if let Some(worker) = self.workers.get(&WorkerKind::GpuImage) {
            worker.set_progress_callback(Arc::new(callback));
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for worker in self.workers.values() {
            worker.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ImageParams, LlmParams, TaskPayload, TtsParams};
    use std::sync::mpsc;
    use std::time::Duration;

    fn config(dir: &std::path::Path) -> Arc<ConfigStore> {
        let store = ConfigStore::new();
        store.initialize(None).unwrap();
        store.set_global_config("output_dir", dir.to_string_lossy().to_string());
        Arc::new(store)
    }

    #[test]
    fn routes_each_kind_to_its_worker() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::new(config(dir.path()));
        assert!(scheduler.initialize().all_started());

        let (tx, rx) = mpsc::channel();
        scheduler.set_task_completed_callback(move |task: &Task| {
            let _ = tx.send((task.kind, task.state));
        });

        scheduler
            .submit(TaskRequest::new(TaskPayload::Llm(LlmParams::new("hi"))))
            .unwrap();
        scheduler
            .submit(TaskRequest::new(TaskPayload::Tts(TtsParams::new("hi"))))
            .unwrap();
        let mut image = ImageParams::new("hi");
        image.use_turbo_mode = true;
        image.width = Some(8);
        image.height = Some(8);
        scheduler
            .submit(TaskRequest::new(TaskPayload::Image(image)))
            .unwrap();

        let done: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(10)).unwrap())
            .collect();
        assert!(done.iter().all(|(_, state)| *state == TaskState::Completed));

        let stats = scheduler.aggregate_stats();
        assert_eq!(stats.completed_tasks, 3);
        assert_eq!(stats.running_workers, 3);
        assert_eq!(stats.workers.len(), 3);
        scheduler.shutdown();
    }

    #[test]
    fn disabled_worker_skipped_and_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        config.set_worker_config(WorkerKind::CpuTts, "enabled", false);
        let scheduler = Scheduler::new(config);

        let report = scheduler.initialize();
        assert_eq!(
            report.outcome(WorkerKind::CpuTts),
            Some(&InitOutcome::Skipped)
        );
        assert_eq!(report.started().len(), 2);
        assert!(matches!(
            scheduler.submit(TaskRequest::new(TaskPayload::Tts(TtsParams::new("x")))),
            Err(SubmitError::NotInitialized { .. })
        ));
    }

    #[test]
    fn one_failing_worker_leaves_others_running() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        config.set_worker_config(WorkerKind::GpuLlm, "backend", "nonexistent");
        let scheduler = Scheduler::new(config);

        let report = scheduler.initialize();
        assert_eq!(report.failed(), vec![WorkerKind::GpuLlm]);
        assert!(!report.all_started());
        assert!(
            scheduler
                .submit(TaskRequest::new(TaskPayload::Tts(TtsParams::new("ok"))))
                .is_ok()
        );
    }

    #[test]
    fn cancel_unknown_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::new(config(dir.path()));
        scheduler.initialize();
        assert!(!scheduler.cancel(TaskKind::LlmInference, "missing"));
        assert_eq!(scheduler.task_state("missing"), None);
    }
}
