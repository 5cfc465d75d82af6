//! Periodic resource monitor.
//!
//! Samples every worker's stats on a fixed interval, logs a snapshot and
//! raises threshold alerts. Alerts are logged once when they start and once
//! when they clear.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

use serde::Serialize;

use crate::config::MonitoringSettings;
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::worker::WorkerStats;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "alert", rename_all = "snake_case")]
pub enum Alert {
    GpuUtilization {
        worker: String,
        device: String,
        utilization: f64,
        threshold: f64,
    },
    Memory {
        worker: String,
        device: String,
        memory_mb: u64,
        threshold_mb: u64,
    },
    QueueDepth {
        worker: String,
        depth: usize,
        threshold: usize,
    },
}

impl Alert {
    pub fn worker(&self) -> &str {
        match self {
            Self::GpuUtilization { worker, .. }
            | Self::Memory { worker, .. }
            | Self::QueueDepth { worker, .. } => worker,
        }
    }

    fn key(&self) -> (&'static str, &str) {
        let kind = match self {
            Self::GpuUtilization { .. } => "gpu_utilization",
            Self::Memory { .. } => "memory",
            Self::QueueDepth { .. } => "queue_depth",
        };
        (kind, self.worker())
    }
}

impl std::fmt::Display for Alert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GpuUtilization {
                worker,
                device,
                utilization,
                threshold,
            } => write!(
                f,
                "{worker} on {device} at {:.0}% utilization (threshold {:.0}%)",
                utilization * 100.0,
                threshold * 100.0
            ),
            Self::Memory {
                worker,
                device,
                memory_mb,
                threshold_mb,
            } => write!(
                f,
                "{worker} on {device} using {memory_mb} MB (threshold {threshold_mb} MB)"
            ),
            Self::QueueDepth {
                worker,
                depth,
                threshold,
            } => write!(f, "{worker} has {depth} queued tasks (threshold {threshold})"),
        }
    }
}

/// Threshold checks over one round of worker stats. Stopped workers are
/// ignored; a zero threshold disables that check.
pub fn evaluate_alerts(settings: &MonitoringSettings, stats: &[WorkerStats]) -> Vec<Alert> {
    let mut alerts = Vec::new();
    for worker in stats.iter().filter(|w| w.running) {
        let on_gpu = worker.device.starts_with("gpu");

        if settings.collect_gpu
            && on_gpu
            && settings.alert_gpu_utilization > 0.0
            && worker.device_utilization >= settings.alert_gpu_utilization
        {
            alerts.push(Alert::GpuUtilization {
                worker: worker.worker.clone(),
                device: worker.device.clone(),
                utilization: worker.device_utilization,
                threshold: settings.alert_gpu_utilization,
            });
        }

        if settings.collect_memory
            && settings.alert_memory_mb > 0
            && worker.device_memory_mb >= settings.alert_memory_mb
        {
            alerts.push(Alert::Memory {
                worker: worker.worker.clone(),
                device: worker.device.clone(),
                memory_mb: worker.device_memory_mb,
                threshold_mb: settings.alert_memory_mb,
            });
        }

        if settings.alert_queue_depth > 0 && worker.queued_tasks >= settings.alert_queue_depth {
            alerts.push(Alert::QueueDepth {
                worker: worker.worker.clone(),
                depth: worker.queued_tasks,
                threshold: settings.alert_queue_depth,
            });
        }
    }
    alerts
}

#[derive(Default)]
struct Latest {
    alerts: Vec<Alert>,
    snapshot: Option<SchedulerStats>,
}

/// Background sampling thread. Stops on drop.
pub struct ResourceMonitor {
    stop: Arc<(Mutex<bool>, Condvar)>,
    latest: Arc<Mutex<Latest>>,
    thread: Option<JoinHandle<()>>,
}

impl ResourceMonitor {
    pub fn spawn(
        scheduler: Arc<Scheduler>,
        settings: MonitoringSettings,
    ) -> std::io::Result<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let latest = Arc::new(Mutex::new(Latest::default()));

        let thread_stop = Arc::clone(&stop);
        let thread_latest = Arc::clone(&latest);
        let thread = std::thread::Builder::new()
            .name("resource-monitor".into())
            .spawn(move || run(scheduler, settings, thread_stop, thread_latest))?;

        Ok(Self {
            stop,
            latest,
            thread: Some(thread),
        })
    }

    /// Alerts active as of the last sample.
    pub fn alerts(&self) -> Vec<Alert> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .alerts
            .clone()
    }

    pub fn last_snapshot(&self) -> Option<SchedulerStats> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot
            .clone()
    }

    pub fn stop(&mut self) {
        let (flag, wake) = &*self.stop;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        wake.notify_all();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!("Resource monitor thread panicked");
        }
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    scheduler: Arc<Scheduler>,
    settings: MonitoringSettings,
    stop: Arc<(Mutex<bool>, Condvar)>,
    latest: Arc<Mutex<Latest>>,
) {
    tracing::info!(
        interval_ms = settings.collection_interval.as_millis() as u64,
        "Resource monitor started"
    );
    let (flag, wake) = &*stop;

    loop {
        let snapshot = scheduler.aggregate_stats();
        let alerts = evaluate_alerts(&settings, &snapshot.workers);

        tracing::debug!(
            queued = snapshot.queued_tasks,
            active = snapshot.active_tasks,
            completed = snapshot.completed_tasks,
            failed = snapshot.failed_tasks,
            "Resource snapshot"
        );
        for worker in &snapshot.workers {
            tracing::trace!(
                worker = %worker.worker,
                device = %worker.device,
                utilization = worker.device_utilization,
                memory_mb = worker.device_memory_mb,
                queued = worker.queued_tasks,
                "Worker sample"
            );
        }

        {
            let mut latest = latest.lock().unwrap_or_else(PoisonError::into_inner);
            for alert in &alerts {
                if !latest.alerts.iter().any(|a| a.key() == alert.key()) {
                    tracing::warn!(worker = alert.worker(), "Resource alert: {alert}");
                }
            }
            for cleared in latest
                .alerts
                .iter()
                .filter(|a| !alerts.iter().any(|b| b.key() == a.key()))
            {
                tracing::info!(worker = cleared.worker(), "Resource alert cleared: {cleared}");
            }
            latest.alerts = alerts;
            latest.snapshot = Some(snapshot);
        }

        let stopped = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (stopped, _) = wake
            .wait_timeout_while(stopped, settings.collection_interval, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        if *stopped {
            break;
        }
    }
    tracing::info!("Resource monitor stopped");
}
