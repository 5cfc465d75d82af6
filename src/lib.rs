//! AI Lanes: resource-isolated scheduling for local AI workloads.
//!
//! Each task kind runs on its own hardware lane (GPU LLM, CPU TTS, GPU image)
//! with a dedicated thread, queue and device, so a slow diffusion job never
//! delays speech synthesis.

pub mod backends;
pub mod config;
pub mod device;
pub mod error;
pub mod monitor;
pub mod queue;
pub mod scheduler;
pub mod task;
pub mod telemetry;
pub mod worker;

pub use config::{ConfigStore, WorkerKind};
pub use error::{Error, Result};
pub use scheduler::{InitOutcome, InitReport, Scheduler, SchedulerStats};
pub use task::{Priority, Task, TaskId, TaskKind, TaskOutput, TaskPayload, TaskRequest, TaskState};
pub use worker::{Worker, WorkerStats, WorkerStatus};
