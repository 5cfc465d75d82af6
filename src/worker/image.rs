//! GPU image generation worker.
//!
//! Diffusion saturates the device, so the lane never runs more than one
//! generation at a time regardless of configuration. Progress fractions are
//! forwarded strictly increasing and always end at 1.0 on success.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use super::lane::{ExecutionContext, Lane, LaneExecutor, LaneOptions};
use super::{artifact_dir, claim_gpu, model_spec};
use crate::backends::{ImageBackend, ImageRequest, create_image_backend};
use crate::config::{ConfigStore, ImageSettings, WorkerKind, WorkerSettings};
use crate::device::{Device, DeviceLease, Hardware};
use crate::error::{BackendError, WorkerError};
use crate::task::{ImageParams, Task, TaskOutput, TaskPayload};

const KIND: WorkerKind = WorkerKind::GpuImage;

pub type ImageWorker = Lane<ImageExecutor>;

pub struct ImageExecutor {
    config: Arc<ConfigStore>,
    hardware: Hardware,
    backend: Option<Box<dyn ImageBackend>>,
    settings: ImageSettings,
    lease: Option<DeviceLease>,
    output_dir: PathBuf,
}

impl ImageExecutor {
    pub fn new(config: Arc<ConfigStore>, hardware: Hardware) -> Self {
        let settings = ImageSettings::from_store(&config);
        Self {
            config,
            hardware,
            backend: None,
            settings,
            lease: None,
            output_dir: PathBuf::new(),
        }
    }

    /// Use this runtime instead of the one named by `backend`.
    pub fn with_backend(mut self, backend: Box<dyn ImageBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    fn steps_for(&self, params: &ImageParams) -> u32 {
        if params.use_turbo_mode {
            self.settings.turbo_steps
        } else {
            params
                .num_inference_steps
                .filter(|steps| *steps > 0)
                .unwrap_or(self.settings.default_steps)
        }
    }
}

impl Lane<ImageExecutor> {
    pub fn new(config: Arc<ConfigStore>, hardware: Hardware) -> Self {
        let telemetry = Arc::clone(&hardware.telemetry);
        Lane::with_executor(KIND.key(), KIND, ImageExecutor::new(config, hardware), telemetry)
    }

    pub fn with_backend(
        config: Arc<ConfigStore>,
        hardware: Hardware,
        backend: Box<dyn ImageBackend>,
    ) -> Self {
        let telemetry = Arc::clone(&hardware.telemetry);
        let executor = ImageExecutor::new(config, hardware).with_backend(backend);
        Lane::with_executor(KIND.key(), KIND, executor, telemetry)
    }
}

/// Drops non-increasing fractions.
struct MonotonicProgress<'a> {
    ctx: &'a ExecutionContext,
    last: Mutex<f32>,
}

impl<'a> MonotonicProgress<'a> {
    fn new(ctx: &'a ExecutionContext) -> Self {
        Self {
            ctx,
            last: Mutex::new(0.0),
        }
    }

    fn report(&self, fraction: f32) {
        if !fraction.is_finite() {
            return;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if fraction > *last {
            *last = fraction;
            drop(last);
            self.ctx.report_progress(fraction);
        }
    }

    fn finish(&self) {
        self.report(1.0);
    }
}

#[async_trait]
impl LaneExecutor for ImageExecutor {
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
        let settings = ImageSettings::from_store(&self.config);
        let worker = KIND.key().to_string();
        if settings.max_concurrent != 1 {
            tracing::warn!(
                worker = %worker,
                configured = settings.max_concurrent,
                "Image generation is single-flight, ignoring max_concurrent"
            );
        }
        let lease = claim_gpu(&self.hardware, &settings.worker)?;
        let device = lease.device();

        let backend = match self.backend.take() {
            Some(backend) => backend,
            None => create_image_backend(&settings).map_err(|e| WorkerError::BackendInit {
                worker: worker.clone(),
                reason: e.to_string(),
            })?,
        };
        let backend = self.backend.insert(backend);

        let spec = model_spec(&self.config, &settings.worker, device);
        tracing::info!(
            worker = %worker,
            backend = backend.name(),
            model = %spec.path.display(),
            device = %device,
            "Loading diffusion model"
        );
        backend.load(&spec).await.map_err(|e| WorkerError::ModelLoad {
            worker: worker.clone(),
            reason: e.to_string(),
        })?;

        self.output_dir = artifact_dir(&self.config, KIND).await?;
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
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput, BackendError> {
        let TaskPayload::Image(params) = &task.payload else {
            return Err(BackendError::InvalidParameters(format!(
                "{} task sent to the image worker",
                task.kind
            )));
        };
        if params.prompt.trim().is_empty() {
            return Err(BackendError::InvalidParameters("prompt is empty".into()));
        }

        let steps = self.steps_for(params);
        let seed = params.seed.unwrap_or_else(rand::random);
        let backend = self.backend.as_mut().ok_or_else(|| BackendError::NotLoaded {
            backend: KIND.key().to_string(),
        })?;
        let request = ImageRequest {
            prompt: params.prompt.clone(),
            negative_prompt: params.negative_prompt.clone(),
            width: params.width.unwrap_or(self.settings.width),
            height: params.height.unwrap_or(self.settings.height),
            guidance_scale: params.guidance_scale.unwrap_or(self.settings.guidance_scale),
            steps,
            seed,
            output_path: self
                .output_dir
                .join(format!("{}.{}", task.id, backend.file_extension())),
        };
        tracing::debug!(
            task_id = %task.id,
            steps,
            seed,
            turbo = params.use_turbo_mode,
            "Generating image"
        );

        let progress = MonotonicProgress::new(ctx);
        let image = backend
            .generate(&request, &|fraction: f32| progress.report(fraction))
            .await;
        let image = match image {
            Ok(image) => image,
            Err(e) => {
                let _ = tokio::fs::remove_file(&request.output_path).await;
                return Err(e);
            }
        };
        progress.finish();

        Ok(TaskOutput::Image {
            path: image.path,
            width: image.width,
            height: image.height,
            seed: image.seed,
            steps: image.steps,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskState;
    use crate::worker::Worker;
    use crate::worker::testing::{completions, next, store};

    fn image_task(params: ImageParams) -> Task {
        Task::new(TaskPayload::Image(params), 5)
    }

    #[test]
    fn turbo_mode_collapses_steps() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ImageExecutor::new(store(dir.path()), Hardware::default());

        let mut params = ImageParams::new("cat");
        params.num_inference_steps = Some(50);
        assert_eq!(executor.steps_for(&params), 50);
        params.use_turbo_mode = true;
        assert_eq!(executor.steps_for(&params), 4);
        assert_eq!(executor.steps_for(&ImageParams::new("cat")), 30);
    }

    #[test]
    fn generates_and_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let config = store(dir.path());
        config.set_worker_config(KIND, "width", 16);
        config.set_worker_config(KIND, "height", 8);
        let worker = ImageWorker::new(config, Hardware::default());
        let rx = completions(&worker);

        let fractions = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fractions);
        worker.set_progress_callback(Arc::new(move |_id: &str, fraction: f32| {
            sink.lock().unwrap().push(fraction);
        }));
        worker.initialize().unwrap();

        let mut params = ImageParams::new("lighthouse");
        params.use_turbo_mode = true;
        params.seed = Some(7);
        let id = worker.submit_task(image_task(params)).unwrap();

        let task = next(&rx);
        assert_eq!(task.state, TaskState::Completed);
        let Some(TaskOutput::Image {
            path,
            width,
            height,
            seed,
            steps,
        }) = task.output
        else {
            panic!("expected image output");
        };
        assert_eq!((width, height, seed, steps), (16, 8, 7, 4));
        assert_eq!(path, dir.path().join("gpu_image").join(format!("{id}.ppm")));
        assert!(path.exists());

        let fractions = fractions.lock().unwrap().clone();
        assert_eq!(fractions, vec![0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn progress_filter_is_monotonic() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let ctx = ExecutionContext::new(
            "t",
            Some(Arc::new(move |_: &str, f: f32| sink.lock().unwrap().push(f))),
        );
        let progress = MonotonicProgress::new(&ctx);
        for f in [0.1, 0.05, 0.4, 0.4, f32::NAN, 2.0, 0.9] {
            progress.report(f);
        }
        progress.finish();
        assert_eq!(*seen.lock().unwrap(), vec![0.1, 0.4, 1.0]);
    }

    #[test]
    fn shares_nothing_with_llm_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let hardware = Hardware::default();
        let worker = ImageWorker::new(store(dir.path()), hardware.clone());
        worker.initialize().unwrap();
        assert_eq!(hardware.devices.owners(1), vec!["gpu_image".to_string()]);
        assert_eq!(worker.stats().device, "gpu:1");
    }
}
