//! CPU speech synthesis worker. Never claims a GPU.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::lane::{ExecutionContext, Lane, LaneExecutor, LaneOptions};
use super::{artifact_dir, model_spec};
use crate::backends::tts::DEFAULT_VOICE;
use crate::backends::{SynthesisBackend, SynthesisParams, create_synthesis_backend};
use crate::config::{ConfigStore, TtsSettings, WorkerKind, WorkerSettings};
use crate::device::{Device, Hardware};
use crate::error::{BackendError, WorkerError};
use crate::task::{AudioFormat, Task, TaskOutput, TaskPayload};

const KIND: WorkerKind = WorkerKind::CpuTts;

pub type TtsWorker = Lane<TtsExecutor>;

pub struct TtsExecutor {
    config: Arc<ConfigStore>,
    backend: Option<Box<dyn SynthesisBackend>>,
    settings: TtsSettings,
    default_format: AudioFormat,
    output_dir: PathBuf,
}

impl TtsExecutor {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        let settings = TtsSettings::from_store(&config);
        Self {
            config,
            backend: None,
            settings,
            default_format: AudioFormat::Wav,
            output_dir: PathBuf::new(),
        }
    }

    /// Use this engine instead of the one named by `backend`.
    pub fn with_backend(mut self, backend: Box<dyn SynthesisBackend>) -> Self {
        self.backend = Some(backend);
        self
    }
}

impl Lane<TtsExecutor> {
    pub fn new(config: Arc<ConfigStore>, hardware: Hardware) -> Self {
        Lane::with_executor(KIND.key(), KIND, TtsExecutor::new(config), hardware.telemetry)
    }

    pub fn with_backend(
        config: Arc<ConfigStore>,
        hardware: Hardware,
        backend: Box<dyn SynthesisBackend>,
    ) -> Self {
        let executor = TtsExecutor::new(config).with_backend(backend);
        Lane::with_executor(KIND.key(), KIND, executor, hardware.telemetry)
    }
}

#[async_trait]
impl LaneExecutor for TtsExecutor {
    fn options(&self) -> LaneOptions {
        let settings = WorkerSettings::from_store(&self.config, KIND);
        LaneOptions {
            max_concurrent: 1,
            max_queued: settings.max_queue_size,
            soft_deadline: settings.soft_deadline,
            device: Device::Cpu,
        }
    }

    async fn prepare(&mut self) -> Result<(), WorkerError> {
        let settings = TtsSettings::from_store(&self.config);
        let worker = KIND.key().to_string();

        let default_format = settings.output_format.parse().unwrap_or_else(|e| {
            tracing::warn!(worker = %worker, error = %e, "Falling back to wav output");
            AudioFormat::Wav
        });

        let mut backend = match self.backend.take() {
            Some(backend) => backend,
            None => create_synthesis_backend(&settings).map_err(|e| WorkerError::BackendInit {
                worker: worker.clone(),
                reason: e.to_string(),
            })?,
        };
        backend.set_num_threads(settings.num_threads);
        let backend = self.backend.insert(backend);

        let spec = model_spec(&self.config, &settings.worker, Device::Cpu);
        tracing::info!(
            worker = %worker,
            backend = backend.name(),
            model = %spec.path.display(),
            threads = settings.num_threads,
            "Loading voice model"
        );
        backend
            .initialize(&spec.path)
            .await
            .map_err(|e| WorkerError::ModelLoad {
                worker: worker.clone(),
                reason: e.to_string(),
            })?;

        self.output_dir = artifact_dir(&self.config, KIND).await?;
        self.default_format = default_format;
        self.settings = settings;
        Ok(())
    }

    async fn execute(
        &mut self,
        task: &Task,
        _ctx: &ExecutionContext,
    ) -> Result<TaskOutput, BackendError> {
        let TaskPayload::Tts(params) = &task.payload else {
            return Err(BackendError::InvalidParameters(format!(
                "{} task sent to the TTS worker",
                task.kind
            )));
        };
        if params.text.trim().is_empty() {
            return Err(BackendError::InvalidParameters("text is empty".into()));
        }
        let backend = self.backend.as_mut().ok_or_else(|| BackendError::NotLoaded {
            backend: KIND.key().to_string(),
        })?;

        let voice = params
            .voice
            .clone()
            .unwrap_or_else(|| self.settings.default_voice.clone());
        let voices = backend.available_voices();
        if voice != DEFAULT_VOICE && !voices.is_empty() && !voices.contains(&voice) {
            return Err(BackendError::InvalidParameters(format!(
                "unknown voice {voice}, available: {}",
                voices.join(", ")
            )));
        }

        let format = params.output_format.unwrap_or(self.default_format);
        let output_path = self
            .output_dir
            .join(format!("{}.{}", task.id, format.extension()));
        let request = SynthesisParams {
            text: params.text.clone(),
            voice,
            speed: params.speed,
            pitch: params.pitch,
            volume: params.volume,
            format,
            sample_rate: self.settings.sample_rate,
            output_path: output_path.clone(),
        };

        match backend.synthesize(&request).await {
            Ok(output) => Ok(TaskOutput::Audio {
                path: output.path,
                audio_bytes: output.audio.len(),
                audio: output.audio,
                duration_ms: output.duration_ms,
            }),
            Err(e) => {
                let _ = tokio::fs::remove_file(&output_path).await;
                Err(e)
            }
        }
    }

    async fn teardown(&mut self) {
        if let Some(backend) = self.backend.as_mut()
            && backend.is_ready()
        {
            backend.shutdown().await;
        }
    }
}
