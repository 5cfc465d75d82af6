//! Task model shared by every worker.
//!
//! - `state` — lifecycle state machine (Pending → Queued → Executing → Completed/Failed)
//! - kind-specific payloads for LLM inference, TTS synthesis and image generation
//! - `TaskOutput` — the result attached to a completed task

pub mod state;

pub use state::{StateTransition, TaskState};

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::WorkerKind;
use crate::error::TaskError;

/// Task identifier, assigned by the dispatcher.
pub type TaskId = String;

/// Cap on the recorded transition history of a single task.
const MAX_TRANSITIONS: usize = 64;

/// The dimension along which hardware isolation is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    LlmInference,
    TtsSynthesis,
    ImageGeneration,
}

impl TaskKind {
    /// The worker that owns tasks of this kind. Static, never load-balanced.
    pub fn worker_kind(&self) -> WorkerKind {
        match self {
            Self::LlmInference => WorkerKind::GpuLlm,
            Self::TtsSynthesis => WorkerKind::CpuTts,
            Self::ImageGeneration => WorkerKind::GpuImage,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::LlmInference => "llm_inference",
            Self::TtsSynthesis => "tts_synthesis",
            Self::ImageGeneration => "image_generation",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "llm_inference" | "llm" => Ok(Self::LlmInference),
            "tts_synthesis" | "tts" => Ok(Self::TtsSynthesis),
            "image_generation" | "image" => Ok(Self::ImageGeneration),
            other => Err(format!("unknown task kind: {other}")),
        }
    }
}

/// Task priority. Higher values are dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    pub const LOW: Priority = Priority(0);
    pub const NORMAL: Priority = Priority(5);
    pub const HIGH: Priority = Priority(10);
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

/// Text generation parameters. Unset sampling fields fall back to the
/// worker's configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmParams {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub top_k: Option<u32>,
    pub top_p: Option<f32>,
    pub repetition_penalty: Option<f32>,
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stop: Vec<String>,
}

impl LlmParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

/// Audio container written by the TTS worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Wav,
    /// Headerless 16-bit little-endian mono PCM.
    Pcm,
}

impl AudioFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Pcm => "pcm",
        }
    }
}

impl std::str::FromStr for AudioFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wav" => Ok(Self::Wav),
            "pcm" | "raw" => Ok(Self::Pcm),
            other => Err(format!("unsupported audio format: {other}")),
        }
    }
}

fn unit_scale() -> f32 {
    1.0
}

/// Speech synthesis parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtsParams {
    pub text: String,
    pub voice: Option<String>,
    #[serde(default = "unit_scale")]
    pub speed: f32,
    #[serde(default = "unit_scale")]
    pub pitch: f32,
    #[serde(default = "unit_scale")]
    pub volume: f32,
    pub output_format: Option<AudioFormat>,
}

impl TtsParams {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice: None,
            speed: 1.0,
            pitch: 1.0,
            volume: 1.0,
            output_format: None,
        }
    }
}

/// Image generation parameters. Unset fields fall back to configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageParams {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub guidance_scale: Option<f32>,
    pub num_inference_steps: Option<u32>,
    pub seed: Option<u64>,
    /// Collapse the step count for low-latency draft generation.
    #[serde(default)]
    pub use_turbo_mode: bool,
}

impl ImageParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

/// Kind-specific payload. The task kind is derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "params", rename_all = "snake_case")]
pub enum TaskPayload {
    #[serde(rename = "llm_inference")]
    Llm(LlmParams),
    #[serde(rename = "tts_synthesis")]
    Tts(TtsParams),
    #[serde(rename = "image_generation")]
    Image(ImageParams),
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Llm(_) => TaskKind::LlmInference,
            Self::Tts(_) => TaskKind::TtsSynthesis,
            Self::Image(_) => TaskKind::ImageGeneration,
        }
    }
}

/// A task descriptor as submitted across the request boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    #[serde(default)]
    pub priority: Priority,
    pub payload: TaskPayload,
}

impl TaskRequest {
    pub fn new(payload: TaskPayload) -> Self {
        Self {
            priority: Priority::default(),
            payload,
        }
    }

    pub fn with_priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = priority.into();
        self
    }
}

/// Result attached to a completed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskOutput {
    Text {
        text: String,
        tokens: u32,
        inference_ms: u64,
    },
    Audio {
        path: PathBuf,
        /// Raw artifact bytes. Not serialized; the path is the durable handle.
        #[serde(skip)]
        audio: Vec<u8>,
        audio_bytes: usize,
        duration_ms: u64,
    },
    Image {
        path: PathBuf,
        width: u32,
        height: u32,
        seed: u64,
        steps: u32,
    },
}

/// A unit of work owned by exactly one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task ID.
    pub id: TaskId,
    /// Derived from the payload.
    pub kind: TaskKind,
    pub priority: Priority,
    pub state: TaskState,
    pub payload: TaskPayload,
    /// Set when the task completes.
    pub output: Option<TaskOutput>,
    /// Captured backend error when the task fails.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// State transition history.
    pub transitions: Vec<StateTransition>,
}

impl Task {
    /// Create a pending task with a fresh ID.
    pub fn new(payload: TaskPayload, priority: impl Into<Priority>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: payload.kind(),
            priority: priority.into(),
            state: TaskState::Pending,
            payload,
            output: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            transitions: Vec::new(),
        }
    }

    pub fn from_request(request: TaskRequest) -> Self {
        Self::new(request.payload, request.priority)
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: TaskState,
        reason: Option<String>,
    ) -> Result<(), TaskError> {
        if !self.state.can_transition_to(new_state) {
            return Err(TaskError::InvalidTransition {
                id: self.id.clone(),
                state: self.state.to_string(),
                target: new_state.to_string(),
            });
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.state = new_state;

        match new_state {
            TaskState::Executing => self.started_at = Some(Utc::now()),
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }

        Ok(())
    }

    /// Mark the task completed with its output.
    pub fn complete(&mut self, output: TaskOutput) -> Result<(), TaskError> {
        self.transition_to(TaskState::Completed, None)?;
        self.output = Some(output);
        Ok(())
    }

    /// Mark the task failed, capturing the backend message.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TaskError> {
        let message = message.into();
        self.transition_to(TaskState::Failed, Some(message.clone()))?;
        self.error = Some(message);
        Ok(())
    }

    /// Cancel a task that has not started executing.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), TaskError> {
        self.transition_to(TaskState::Cancelled, Some(reason.into()))
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Time spent executing, or executing so far.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|start| {
            let end = self.completed_at.unwrap_or_else(Utc::now);
            end.signed_duration_since(start)
                .to_std()
                .unwrap_or_default()
        })
    }
}
