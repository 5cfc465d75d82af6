//! Error types for the lane scheduler.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Submission rejected: {0}")]
    Submit(#[from] SubmitError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration store already initialized")]
    AlreadyInitialized,

    #[error("No configuration file associated with this store")]
    NoSource,

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Failed to watch configuration file: {0}")]
    Watch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from the bounded priority queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is full ({capacity} items waiting)")]
    Full { capacity: usize },

    #[error("Queue is shut down")]
    Closed,
}

/// Synchronous rejection of a task submission. Never panics, never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("Worker {worker} is not initialized")]
    NotInitialized { worker: String },

    #[error("Worker {worker} is not running")]
    NotRunning { worker: String },

    #[error("Worker {worker} does not accept {kind} tasks")]
    WrongKind { worker: String, kind: String },

    #[error("Task {id} is in state {state}, only pending tasks can be submitted")]
    InvalidState { id: String, state: String },

    #[error("Worker {worker} queue is full ({capacity} tasks waiting)")]
    QueueFull { worker: String, capacity: usize },
}

/// Worker lifecycle errors. Fatal to the affected worker only.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker {worker} is already running")]
    AlreadyRunning { worker: String },

    #[error("Worker {worker} requires a GPU device id, got {device_id}")]
    InvalidDevice { worker: String, device_id: i64 },

    #[error("GPU device {device_id} is already owned by {owner}")]
    DeviceBusy { device_id: i64, owner: String },

    #[error("Worker {worker} backend setup failed: {reason}")]
    BackendInit { worker: String, reason: String },

    #[error("Worker {worker} failed to load model: {reason}")]
    ModelLoad { worker: String, reason: String },

    #[error("Worker {worker} warm-up failed: {reason}")]
    Warmup { worker: String, reason: String },

    #[error("Worker {worker} failed to start its execution thread: {reason}")]
    Thread { worker: String, reason: String },
}

/// Errors raised by inference, synthesis and image backends.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Unknown {what} backend: {name}")]
    UnknownBackend { what: String, name: String },

    #[error("Backend {backend} has no model loaded")]
    NotLoaded { backend: String },

    #[error("Backend {backend} request failed: {reason}")]
    RequestFailed { backend: String, reason: String },

    #[error("Invalid response from {backend}: {reason}")]
    InvalidResponse { backend: String, reason: String },

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Backend {backend} timed out after {timeout:?}")]
    Timeout { backend: String, timeout: Duration },

    #[error("Backend panicked: {0}")]
    Panicked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Task state machine errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: String,
        state: String,
        target: String,
    },
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
