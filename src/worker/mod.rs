//! Workers: one per hardware lane.
//!
//! Core components:
//! - `lane` — shared machinery (queue, execution thread, registry, stats)
//! - `llm` — GPU text generation
//! - `tts` — CPU speech synthesis
//! - `image` — GPU image generation, single-flight

pub mod image;
pub mod lane;
pub mod llm;
pub mod tts;

pub use image::{ImageExecutor, ImageWorker};
pub use lane::{ExecutionContext, Lane, LaneExecutor, LaneOptions};
pub use llm::{LlmExecutor, LlmWorker};
pub use tts::{TtsExecutor, TtsWorker};

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::backends::ModelSpec;
use crate::config::{ConfigStore, GlobalSettings, WorkerKind, WorkerSettings};
use crate::device::{Device, DeviceLease, Hardware};
use crate::error::{SubmitError, WorkerError};
use crate::task::{Task, TaskId, TaskState};

/// Invoked exactly once per task when it reaches a terminal state, on the
/// worker's execution thread.
pub type TaskCallback = Arc<dyn Fn(&Task) + Send + Sync>;

/// `(task_id, fraction)` progress notifications.
pub type ProgressCallback = Arc<dyn Fn(&str, f32) + Send + Sync>;

/// Lifecycle status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Uninitialized,
    Stopped,
    /// Running with nothing executing.
    Ready,
    /// Running and executing a task.
    Busy,
}

impl WorkerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Stopped => "stopped",
            Self::Ready => "ready",
            Self::Busy => "busy",
        };
        write!(f, "{}", s)
    }
}

/// Point-in-time snapshot of a worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStats {
    pub worker: String,
    pub kind: WorkerKind,
    pub device: String,
    pub initialized: bool,
    pub running: bool,
    pub busy: bool,
    pub queued_tasks: usize,
    pub active_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub cancelled_tasks: u64,
    /// Tasks that ran past the soft deadline.
    pub slow_tasks: u64,
    /// 0.0 to 1.0.
    pub device_utilization: f64,
    pub device_memory_mb: u64,
    pub total_processing_ms: u64,
    pub avg_processing_ms: f64,
}

/// Common contract of every worker.
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> WorkerKind;

    /// Bind the device, load the model and start the execution thread.
    fn initialize(&self) -> Result<(), WorkerError>;

    /// Stop accepting work, finish the running task, report everything still
    /// queued as cancelled and release the device.
    fn shutdown(&self);

    /// Queue a pending task. Returns immediately.
    fn submit_task(&self, task: Task) -> Result<TaskId, SubmitError>;

    /// Cancel a queued task. False once it has started or finished.
    fn cancel_task(&self, task_id: &str) -> bool;

    /// State of a task still owned by this worker.
    fn task_state(&self, task_id: &str) -> Option<TaskState>;

    fn status(&self) -> WorkerStatus;

    fn stats(&self) -> WorkerStats;

    fn set_task_completed_callback(&self, callback: TaskCallback);

    /// Only workers that report progress use this.
    fn set_progress_callback(&self, _callback: ProgressCallback) {}
}

/// Claim the GPU a worker is configured for. A negative id is a
/// configuration error for GPU-bound kinds.
pub(crate) fn claim_gpu(
    hardware: &Hardware,
    settings: &WorkerSettings,
) -> Result<DeviceLease, WorkerError> {
    let worker = settings.kind.key();
    let index = settings
        .gpu_device()
        .ok_or_else(|| WorkerError::InvalidDevice {
            worker: worker.to_string(),
            device_id: settings.device_id,
        })?;
    hardware.devices.claim(Device::Gpu(index), worker)
}

pub(crate) fn model_spec(config: &ConfigStore, settings: &WorkerSettings, device: Device) -> ModelSpec {
    let global = GlobalSettings::from_store(config);
    ModelSpec {
        max_memory_mb: settings.max_memory_mb,
        ..ModelSpec::new(global.resolve_model_path(&settings.model_path), device)
    }
}

/// `{output_dir}/{worker}`, created if missing.
pub(crate) async fn artifact_dir(config: &ConfigStore, kind: WorkerKind) -> Result<PathBuf, WorkerError> {
    let dir = GlobalSettings::from_store(config).output_dir.join(kind.key());
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| WorkerError::BackendInit {
            worker: kind.key().to_string(),
            reason: format!("cannot create {}: {e}", dir.display()),
        })?;
    Ok(dir)
}
