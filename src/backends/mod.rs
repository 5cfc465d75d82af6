//! Model runtimes behind the workers.
//!
//! Each worker talks to its runtime through a trait so the engine can be
//! swapped by configuration (`backend` key):
//!
//! - **LLM** (`InferenceBackend`): `rpc`, `process`, `mock`
//! - **TTS** (`SynthesisBackend`): `neural`, `process`, `mock`
//! - **Image** (`ImageBackend`): `http`, `mock`

pub mod image;
pub mod llm;
pub mod process;
pub mod tts;

pub use image::{GeneratedImage, ImageBackend, ImageRequest, create_image_backend};
pub use llm::{Generation, GenerationRequest, InferenceBackend, create_inference_backend};
pub use tts::{SynthesisBackend, SynthesisOutput, SynthesisParams, create_synthesis_backend};

use std::path::PathBuf;

use crate::device::Device;

/// What a backend is asked to load.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub path: PathBuf,
    pub device: Device,
    pub context_length: u32,
    pub max_memory_mb: u64,
}

impl ModelSpec {
    pub fn new(path: impl Into<PathBuf>, device: Device) -> Self {
        Self {
            path: path.into(),
            device,
            context_length: 0,
            max_memory_mb: 0,
        }
    }

    /// File stem, used as the model name in logs and remote APIs.
    pub fn model_name(&self) -> String {
        self.path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string())
    }
}

/// Join an endpoint base URL and a path without doubling slashes.
pub(crate) fn endpoint_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joining() {
        assert_eq!(
            endpoint_url("http://127.0.0.1:8080/", "/completion"),
            "http://127.0.0.1:8080/completion"
        );
        assert_eq!(endpoint_url("http://h:1", "health"), "http://h:1/health");
    }

    #[test]
    fn model_name_from_path() {
        let spec = ModelSpec::new("models/llm/mistral-7b.Q4_K_M.gguf", Device::Gpu(0));
        assert_eq!(spec.model_name(), "mistral-7b.Q4_K_M");
    }
}
