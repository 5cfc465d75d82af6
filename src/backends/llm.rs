//! Text generation runtimes.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::process::{JsonLineProcess, path_arg};
use super::{ModelSpec, endpoint_url};
use crate::config::LlmSettings;
use crate::error::BackendError;
use crate::task::LlmParams;

/// Prompt that makes the mock backend fail, for exercising error paths.
pub const MOCK_FAILURE_TRIGGER: &str = "__fail__";

/// Fully resolved generation request: task overrides merged over the
/// configured sampling defaults.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub max_tokens: u32,
    pub stop: Vec<String>,
}

impl GenerationRequest {
    pub fn resolve(params: &LlmParams, defaults: &LlmSettings) -> Self {
        Self {
            prompt: params.prompt.clone(),
            system_prompt: params.system_prompt.clone(),
            temperature: params.temperature.unwrap_or(defaults.temperature),
            top_k: params.top_k.unwrap_or(defaults.top_k),
            top_p: params.top_p.unwrap_or(defaults.top_p),
            repetition_penalty: params
                .repetition_penalty
                .unwrap_or(defaults.repetition_penalty),
            max_tokens: params.max_tokens.unwrap_or(defaults.max_tokens),
            stop: params.stop.clone(),
        }
    }

    /// Prompt with the system prompt prepended, for runtimes that take a
    /// single raw prompt.
    pub fn full_prompt(&self) -> String {
        match &self.system_prompt {
            Some(system) if !system.is_empty() => format!("{system}\n\n{}", self.prompt),
            _ => self.prompt.clone(),
        }
    }
}

/// Generated text.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Generation {
    pub text: String,
    pub tokens: u32,
}

/// A model runtime that turns prompts into text.
#[async_trait]
pub trait InferenceBackend: Send {
    fn name(&self) -> &'static str;

    async fn load(&mut self, spec: &ModelSpec) -> Result<(), BackendError>;

    async fn unload(&mut self);

    fn is_loaded(&self) -> bool;

    async fn generate(&mut self, request: &GenerationRequest) -> Result<Generation, BackendError>;
}

/// Build the backend named by `backend` in the worker settings.
pub fn create_inference_backend(
    settings: &LlmSettings,
) -> Result<Box<dyn InferenceBackend>, BackendError> {
    let worker = &settings.worker;
    match worker.backend.as_str() {
        "rpc" => {
            let endpoint = worker.endpoint.clone().ok_or_else(|| {
                BackendError::InvalidParameters("rpc backend requires an endpoint".into())
            })?;
            Ok(Box::new(RpcInference::new(
                endpoint,
                settings.api_key.clone().map(SecretString::from),
                worker.request_timeout,
            )?))
        }
        "process" => {
            let executable = worker.executable.clone().ok_or_else(|| {
                BackendError::InvalidParameters("process backend requires an executable".into())
            })?;
            Ok(Box::new(ProcessInference::new(executable, worker.request_timeout)))
        }
        "mock" => Ok(Box::new(MockInference::new(worker.mock_latency))),
        other => Err(BackendError::UnknownBackend {
            what: "inference".into(),
            name: other.to_string(),
        }),
    }
}

/// Out-of-process runtime speaking the llama.cpp server protocol.
pub struct RpcInference {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
    loaded: bool,
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    prompt: String,
    n_predict: u32,
    temperature: f32,
    top_k: u32,
    top_p: f32,
    repeat_penalty: f32,
    stop: &'a [String],
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionReply {
    content: String,
    #[serde(default)]
    tokens_predicted: Option<u32>,
}

impl RpcInference {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
            loaded: false,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, endpoint_url(&self.endpoint, path));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key.expose_secret()),
            None => builder,
        }
    }
}

#[async_trait]
impl InferenceBackend for RpcInference {
    fn name(&self) -> &'static str {
        "rpc"
    }

    async fn load(&mut self, spec: &ModelSpec) -> Result<(), BackendError> {
        // The remote runtime owns the weights; confirm it is up and serving.
        let resp = self
            .request(reqwest::Method::GET, "health")
            .send()
            .await
            .map_err(|e| BackendError::RequestFailed {
                backend: "rpc".into(),
                reason: format!("{}: {e}", self.endpoint),
            })?;

        if !resp.status().is_success() {
            return Err(BackendError::RequestFailed {
                backend: "rpc".into(),
                reason: format!("health check returned {}", resp.status()),
            });
        }

        tracing::info!(
            endpoint = %self.endpoint,
            model = %spec.model_name(),
            device = %spec.device,
            "Connected to inference runtime"
        );
        self.loaded = true;
        Ok(())
    }

    async fn unload(&mut self) {
        self.loaded = false;
    }

    fn is_loaded(&self) -> bool {
        self.loaded
    }

    async fn generate(&mut self, request: &GenerationRequest) -> Result<Generation, BackendError> {
        if !self.loaded {
            return Err(BackendError::NotLoaded {
                backend: "rpc".into(),
            });
        }

        let body = CompletionBody {
            prompt: request.full_prompt(),
            n_predict: request.max_tokens,
            temperature: request.temperature,
            top_k: request.top_k,
            top_p: request.top_p,
            repeat_penalty: request.repetition_penalty,
            stop: &request.stop,
            stream: false,
        };

        let resp = self
            .request(reqwest::Method::POST, "completion")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(BackendError::RequestFailed {
                backend: "rpc".into(),
                reason: format!("HTTP {status}: {detail}"),
            });
        }

        let reply: CompletionReply = resp.json().await?;
        let tokens = reply
            .tokens_predicted
            .unwrap_or_else(|| approximate_tokens(&reply.content));
        Ok(Generation {
            text: reply.content,
            tokens,
        })
    }
}

/// A local runtime executable. Started on `load` with `--model` and
/// `--device`, it answers one JSON line per request line. A failed request
/// stops the child; the next request starts a fresh one for the same model.
pub struct ProcessInference {
    executable: String,
    timeout: Duration,
    model: Option<ModelSpec>,
    process: Option<JsonLineProcess>,
}

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ProcessRequest<'a> {
    Ping,
    Generate(&'a GenerationRequest),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ProcessReply {
    Error { error: String },
    Generation(Generation),
    Ack {},
}

impl ProcessInference {
    pub fn new(executable: impl Into<String>, timeout: Duration) -> Self {
        Self {
            executable: executable.into(),
            timeout,
            model: None,
            process: None,
        }
    }

    async fn start(&self, spec: &ModelSpec) -> Result<JsonLineProcess, BackendError> {
        let mut args: Vec<String> = path_arg("--model", &spec.path).into();
        args.extend(["--device".to_string(), spec.device.id().to_string()]);
        if spec.context_length > 0 {
            args.extend(["--ctx-size".to_string(), spec.context_length.to_string()]);
        }

        let mut process = JsonLineProcess::spawn(&self.executable, &args, &[])?;
        // Model loading happens before the first reply; allow it the full timeout.
        let reply = match process.request(&ProcessRequest::Ping, self.timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                process.shutdown().await;
                return Err(e);
            }
        };
        match reply {
            ProcessReply::Error { error } => {
                process.shutdown().await;
                Err(self.runtime_error(error))
            }
            _ => {
                tracing::info!(
                    executable = %self.executable,
                    model = %spec.model_name(),
                    device = %spec.device,
                    "Inference runtime process ready"
                );
                Ok(process)
            }
        }
    }

    fn runtime_error(&self, reason: String) -> BackendError {
        BackendError::RequestFailed {
            backend: self.executable.clone(),
            reason,
        }
    }
}

#[async_trait]
impl InferenceBackend for ProcessInference {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn load(&mut self, spec: &ModelSpec) -> Result<(), BackendError> {
        self.unload().await;
        let process = self.start(spec).await?;
        self.process = Some(process);
        self.model = Some(spec.clone());
        Ok(())
    }

    async fn unload(&mut self) {
        self.model = None;
        if let Some(process) = self.process.take() {
            process.shutdown().await;
        }
    }

    fn is_loaded(&self) -> bool {
        self.process.is_some()
    }

    async fn generate(&mut self, request: &GenerationRequest) -> Result<Generation, BackendError> {
        let mut process = match self.process.take() {
            Some(process) => process,
            None => {
                let spec = self.model.as_ref().ok_or_else(|| BackendError::NotLoaded {
                    backend: "process".into(),
                })?;
                tracing::info!(
                    executable = %self.executable,
                    "Restarting inference runtime process"
                );
                self.start(spec).await?
            }
        };

        let reply = process
            .request(&ProcessRequest::Generate(request), self.timeout)
            .await;
        if process.is_in_sync() {
            self.process = Some(process);
        } else {
            tracing::warn!(
                executable = %self.executable,
                "Stopping inference runtime process after a failed request"
            );
            process.shutdown().await;
        }

        match reply? {
            ProcessReply::Generation(generation) => Ok(generation),
            ProcessReply::Error { error } => Err(self.runtime_error(error)),
            ProcessReply::Ack {} => Err(BackendError::InvalidResponse {
                backend: self.executable.clone(),
                reason: "reply carried no text".into(),
            }),
        }
    }
}

/// Deterministic echo runtime for tests and hardware-free deployments.
pub struct MockInference {
    latency: Duration,
    model: Option<String>,
}

impl MockInference {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            model: None,
        }
    }
}

#[async_trait]
impl InferenceBackend for MockInference {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn load(&mut self, spec: &ModelSpec) -> Result<(), BackendError> {
        self.model = Some(spec.model_name());
        Ok(())
    }

    async fn unload(&mut self) {
        self.model = None;
    }

    fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    async fn generate(&mut self, request: &GenerationRequest) -> Result<Generation, BackendError> {
        let model = self.model.as_deref().ok_or_else(|| BackendError::NotLoaded {
            backend: "mock".into(),
        })?;

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if request.prompt.contains(MOCK_FAILURE_TRIGGER) {
            return Err(BackendError::RequestFailed {
                backend: "mock".into(),
                reason: "failure requested by prompt".into(),
            });
        }

        let words: Vec<&str> = request
            .prompt
            .split_whitespace()
            .take(request.max_tokens as usize)
            .collect();
        let text = format!("[{model}] {}", words.join(" "));
        Ok(Generation {
            tokens: words.len() as u32,
            text,
        })
    }
}

/// Rough token count (about four characters per token) for runtimes that do
/// not report one.
fn approximate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
}
