//! GPU text generation worker.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use super::lane::{ExecutionContext, Lane, LaneExecutor, LaneOptions};
use super::{claim_gpu, model_spec};
use crate::backends::{GenerationRequest, InferenceBackend, ModelSpec, create_inference_backend};
use crate::config::{ConfigStore, LlmSettings, WorkerKind, WorkerSettings};
use crate::device::{Device, DeviceLease, Hardware};
use crate::error::{BackendError, WorkerError};
use crate::task::{LlmParams, Task, TaskOutput, TaskPayload};

const KIND: WorkerKind = WorkerKind::GpuLlm;

pub type LlmWorker = Lane<LlmExecutor>;

pub struct LlmExecutor {
    config: Arc<ConfigStore>,
    hardware: Hardware,
    backend: Option<Box<dyn InferenceBackend>>,
    settings: LlmSettings,
    lease: Option<DeviceLease>,
}

impl LlmExecutor {
    pub fn new(config: Arc<ConfigStore>, hardware: Hardware) -> Self {
        let settings = LlmSettings::from_store(&config);
        Self {
            config,
            hardware,
            backend: None,
            settings,
            lease: None,
        }
    }

    /// Use this runtime instead of the one named by `backend`.
    pub fn with_backend(mut self, backend: Box<dyn InferenceBackend>) -> Self {
        self.backend = Some(backend);
        self
    }
}

impl Lane<LlmExecutor> {
    pub fn new(config: Arc<ConfigStore>, hardware: Hardware) -> Self {
        let telemetry = Arc::clone(&hardware.telemetry);
        Lane::with_executor(KIND.key(), KIND, LlmExecutor::new(config, hardware), telemetry)
    }

    pub fn with_backend(
        config: Arc<ConfigStore>,
        hardware: Hardware,
        backend: Box<dyn InferenceBackend>,
    ) -> Self {
        let telemetry = Arc::clone(&hardware.telemetry);
        let executor = LlmExecutor::new(config, hardware).with_backend(backend);
        Lane::with_executor(KIND.key(), KIND, executor, telemetry)
    }
}

#[async_trait]
impl LaneExecutor for LlmExecutor {
    fn options(&self) -> LaneOptions {
        let settings = WorkerSettings::from_store(&self.config, KIND);
        LaneOptions {
            max_concurrent: 1,
            max_queued: settings.max_queue_size,
            soft_deadline: settings.soft_deadline,
            device: Device::from_id(settings.device_id),
        }
    }

    async fn prepare(&mut self) -> Result<(), WorkerError> {
        let settings = LlmSettings::from_store(&self.config);
        let worker = KIND.key().to_string();
        let lease = claim_gpu(&self.hardware, &settings.worker)?;
        let device = lease.device();

        let backend = match self.backend.take() {
            Some(backend) => backend,
            None => create_inference_backend(&settings).map_err(|e| WorkerError::BackendInit {
                worker: worker.clone(),
                reason: e.to_string(),
            })?,
        };
        let backend = self.backend.insert(backend);

        let spec = ModelSpec {
            context_length: settings.context_length,
            ..model_spec(&self.config, &settings.worker, device)
        };
        tracing::info!(
            worker = %worker,
            backend = backend.name(),
            model = %spec.path.display(),
            device = %device,
            "Loading model"
        );
        backend.load(&spec).await.map_err(|e| WorkerError::ModelLoad {
            worker: worker.clone(),
            reason: e.to_string(),
        })?;

        if let Some(prompt) = &settings.warmup_prompt {
            let mut request = GenerationRequest::resolve(&LlmParams::new(prompt.clone()), &settings);
            request.max_tokens = 1;
            let started = Instant::now();
            if let Err(e) = backend.generate(&request).await {
                backend.unload().await;
                return Err(WorkerError::Warmup {
                    worker,
                    reason: e.to_string(),
                });
            }
            tracing::debug!(
                worker = %worker,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Warm-up complete"
            );
        }

        self.hardware
            .telemetry
            .record_memory(device, settings.worker.max_memory_mb);
        self.settings = settings;
        self.lease = Some(lease);
        Ok(())
    }

    async fn execute(
        &mut self,
        task: &Task,
        _ctx: &ExecutionContext,
    ) -> Result<TaskOutput, BackendError> {
        let TaskPayload::Llm(params) = &task.payload else {
            return Err(BackendError::InvalidParameters(format!(
                "{} task sent to the LLM worker",
                task.kind
            )));
        };
        let backend = self.backend.as_mut().ok_or_else(|| BackendError::NotLoaded {
            backend: KIND.key().to_string(),
        })?;

        let request = GenerationRequest::resolve(params, &self.settings);
        let started = Instant::now();
        let generation = backend.generate(&request).await?;
        let inference_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        tracing::debug!(
            task_id = %task.id,
            tokens = generation.tokens,
            inference_ms,
            "Generation finished"
        );
        Ok(TaskOutput::Text {
            text: generation.text,
            tokens: generation.tokens,
            inference_ms,
        })
    }

    async fn teardown(&mut self) {
        if let Some(backend) = self.backend.as_mut()
            && backend.is_loaded()
        {
            backend.unload().await;
        }
        if let Some(lease) = self.lease.take() {
            self.hardware.telemetry.record_memory(lease.device(), 0);
        }
    }
}
