//! Diffusion runtimes.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{ModelSpec, endpoint_url};
use crate::config::ImageSettings;
use crate::error::BackendError;

const PROGRESS_POLL: Duration = Duration::from_millis(250);

/// Fully resolved image request.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: u32,
    pub height: u32,
    pub guidance_scale: f32,
    pub steps: u32,
    pub seed: u64,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub seed: u64,
    pub steps: u32,
}

/// A GPU image generator.
#[async_trait]
pub trait ImageBackend: Send {
    fn name(&self) -> &'static str;

    /// Extension of the files this backend writes.
    fn file_extension(&self) -> &'static str;

    async fn load(&mut self, spec: &ModelSpec) -> Result<(), BackendError>;

    async fn unload(&mut self);

    fn is_loaded(&self) -> bool;

    /// Generate one image. `progress` receives fractions in `[0, 1]`.
    async fn generate(
        &mut self,
        request: &ImageRequest,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<GeneratedImage, BackendError>;
}

pub fn create_image_backend(
    settings: &ImageSettings,
) -> Result<Box<dyn ImageBackend>, BackendError> {
    let worker = &settings.worker;
    match worker.backend.as_str() {
        "http" => {
            let endpoint = worker.endpoint.clone().ok_or_else(|| {
                BackendError::InvalidParameters("http backend requires an endpoint".into())
            })?;
            Ok(Box::new(HttpDiffusion::new(endpoint, worker.request_timeout)?))
        }
        "mock" => Ok(Box::new(MockDiffusion::new(worker.mock_latency))),
        other => Err(BackendError::UnknownBackend {
            what: "image".into(),
            name: other.to_string(),
        }),
    }
}

/// Automatic1111-compatible web API.
pub struct HttpDiffusion {
    client: reqwest::Client,
    endpoint: String,
    loaded: bool,
}

#[derive(Serialize)]
struct Txt2ImgBody<'a> {
    prompt: &'a str,
    negative_prompt: &'a str,
    width: u32,
    height: u32,
    cfg_scale: f32,
    steps: u32,
    seed: i64,
}

#[derive(Deserialize)]
struct Txt2ImgReply {
    images: Vec<String>,
}

#[derive(Deserialize)]
struct ProgressReply {
    progress: f32,
}

#[derive(Deserialize)]
struct SdModel {
    title: String,
    model_name: String,
}

impl HttpDiffusion {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            endpoint: endpoint.into(),
            loaded: false,
        })
    }

    fn url(&self, path: &str) -> String {
        endpoint_url(&self.endpoint, path)
    }

    async fn poll_progress(&self) -> Option<f32> {
        let resp = self
            .client
            .get(self.url("sdapi/v1/progress?skip_current_image=true"))
            .send()
            .await
            .ok()?;
        let reply: ProgressReply = resp.json().await.ok()?;
        Some(reply.progress.clamp(0.0, 1.0))
    }
}

#[async_trait]
impl ImageBackend for HttpDiffusion {
    fn name(&self) -> &'static str {
        "http"
    }

    fn file_extension(&self) -> &'static str {
        "png"
    }

    async fn load(&mut self, spec: &ModelSpec) -> Result<(), BackendError> {
        let resp = self
            .client
            .get(self.url("sdapi/v1/sd-models"))
            .send()
            .await
            .map_err(|e| BackendError::RequestFailed {
                backend: "http".into(),
                reason: format!("{}: {e}", self.endpoint),
            })?;
        if !resp.status().is_success() {
            return Err(BackendError::RequestFailed {
                backend: "http".into(),
                reason: format!("model listing returned {}", resp.status()),
            });
        }

        let models: Vec<SdModel> = resp.json().await?;
        let wanted = spec.model_name();
        match models.iter().find(|m| m.model_name == wanted) {
            Some(model) => {
                self.client
                    .post(self.url("sdapi/v1/options"))
                    .json(&serde_json::json!({ "sd_model_checkpoint": model.title }))
                    .send()
                    .await?
                    .error_for_status()?;
                tracing::info!(model = %model.title, device = %spec.device, "Diffusion checkpoint selected");
            }
            None => {
                tracing::warn!(
                    model = %wanted,
                    available = models.len(),
                    "Configured checkpoint not offered by server, using its current model"
                );
            }
        }

        self.loaded = true;
        Ok(())
    }

    async fn unload(&mut self) {
        self.loaded = false;
    }

    fn is_loaded(&self) -> bool {
        self.loaded
    }

    async fn generate(
        &mut self,
        request: &ImageRequest,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<GeneratedImage, BackendError> {
        if !self.loaded {
            return Err(BackendError::NotLoaded {
                backend: "http".into(),
            });
        }

        let body = Txt2ImgBody {
            prompt: &request.prompt,
            negative_prompt: request.negative_prompt.as_deref().unwrap_or(""),
            width: request.width,
            height: request.height,
            cfg_scale: request.guidance_scale,
            steps: request.steps,
            seed: i64::try_from(request.seed).unwrap_or(i64::MAX),
        };

        let this = &*self;
        let generation = this
            .client
            .post(this.url("sdapi/v1/txt2img"))
            .json(&body)
            .send();
        tokio::pin!(generation);

        let mut ticker = tokio::time::interval(PROGRESS_POLL);
        ticker.tick().await;
        let resp = loop {
            tokio::select! {
                resp = &mut generation => break resp?,
                _ = ticker.tick() => {
                    if let Some(fraction) = this.poll_progress().await {
                        progress(fraction);
                    }
                }
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(BackendError::RequestFailed {
                backend: "http".into(),
                reason: format!("HTTP {status}: {detail}"),
            });
        }

        let reply: Txt2ImgReply = resp.json().await?;
        let encoded = reply
            .images
            .first()
            .ok_or_else(|| BackendError::InvalidResponse {
                backend: "http".into(),
                reason: "no images in reply".into(),
            })?;
        let png = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| BackendError::InvalidResponse {
                backend: "http".into(),
                reason: format!("image is not base64: {e}"),
            })?;
        tokio::fs::write(&request.output_path, png).await?;

        Ok(GeneratedImage {
            path: request.output_path.clone(),
            width: request.width,
            height: request.height,
            seed: request.seed,
            steps: request.steps,
        })
    }
}

/// Deterministic renderer writing binary PPM files.
pub struct MockDiffusion {
    latency: Duration,
    loaded: bool,
}

impl MockDiffusion {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            loaded: false,
        }
    }
}

#[async_trait]
impl ImageBackend for MockDiffusion {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn file_extension(&self) -> &'static str {
        "ppm"
    }

    async fn load(&mut self, _spec: &ModelSpec) -> Result<(), BackendError> {
        self.loaded = true;
        Ok(())
    }

    async fn unload(&mut self) {
        self.loaded = false;
    }

    fn is_loaded(&self) -> bool {
        self.loaded
    }

    async fn generate(
        &mut self,
        request: &ImageRequest,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<GeneratedImage, BackendError> {
        if !self.loaded {
            return Err(BackendError::NotLoaded {
                backend: "mock".into(),
            });
        }
        if request.width == 0 || request.height == 0 || request.steps == 0 {
            return Err(BackendError::InvalidParameters(format!(
                "{}x{} with {} steps",
                request.width, request.height, request.steps
            )));
        }

        let step_delay = self.latency / request.steps;
        for step in 1..=request.steps {
            if !step_delay.is_zero() {
                tokio::time::sleep(step_delay).await;
            }
            progress(step as f32 / request.steps as f32);
        }

        let ppm = render_ppm(request);
        tokio::fs::write(&request.output_path, ppm).await?;

        Ok(GeneratedImage {
            path: request.output_path.clone(),
            width: request.width,
            height: request.height,
            seed: request.seed,
            steps: request.steps,
        })
    }
}

/// Gradient tinted by prompt, with seeded noise.
fn render_ppm(request: &ImageRequest) -> Vec<u8> {
    let tint = request
        .prompt
        .bytes()
        .fold(0u8, |acc, b| acc.wrapping_mul(31).wrapping_add(b));
    let mut rng = StdRng::seed_from_u64(request.seed);

    let (width, height) = (request.width as usize, request.height as usize);
    let mut out = format!("P6\n{width} {height}\n255\n").into_bytes();
    out.reserve(width * height * 3);
    for y in 0..height {
        for x in 0..width {
            let noise: u8 = rng.gen_range(0..32);
            out.push(((x * 255 / width) as u8).wrapping_add(noise));
            out.push(((y * 255 / height) as u8).wrapping_add(noise));
            out.push(tint.wrapping_add(noise));
        }
    }
    out
}
