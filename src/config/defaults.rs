//! Hard-coded defaults seeded by `ConfigStore::initialize` and
//! `ConfigStore::reset_to_defaults`.

use super::store::Section;
use super::{ConfigSection, ConfigValue, WorkerKind};

fn section<const N: usize>(entries: [(&str, ConfigValue); N]) -> Section {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// Keys shared by every worker kind.
fn common_worker(kind: WorkerKind) -> Section {
    let (device_id, max_memory_mb, model_path, soft_deadline_ms) = match kind {
        WorkerKind::GpuLlm => (0, 8192, "models/llm/model.gguf", 60_000),
        WorkerKind::CpuTts => (-1, 1024, "models/tts/voice.onnx", 15_000),
        WorkerKind::GpuImage => (1, 10_240, "models/image/sd-turbo", 90_000),
    };

    section([
        ("enabled", true.into()),
        ("min_threads", 1.into()),
        ("max_threads", 1.into()),
        ("max_queue_size", 256.into()),
        ("batch_size", 1.into()),
        ("batch_timeout_ms", 50.into()),
        ("device_id", device_id.into()),
        ("max_memory_mb", max_memory_mb.into()),
        ("model_path", model_path.into()),
        ("backend", "mock".into()),
        ("endpoint", "".into()),
        ("executable", "".into()),
        ("request_timeout_ms", 120_000.into()),
        ("soft_deadline_ms", soft_deadline_ms.into()),
        ("mock_latency_ms", 20.into()),
    ])
}

pub fn worker(kind: WorkerKind) -> Section {
    let mut defaults = common_worker(kind);
    let specific = match kind {
        WorkerKind::GpuLlm => section([
            ("endpoint", "http://127.0.0.1:8080".into()),
            ("executable", "llm-bridge".into()),
            ("temperature", 0.7.into()),
            ("top_k", 40.into()),
            ("top_p", 0.9.into()),
            ("repetition_penalty", 1.1.into()),
            ("max_tokens", 512.into()),
            ("context_length", 4096.into()),
            ("warmup_prompt", "Hello".into()),
            ("api_key", "".into()),
        ]),
        WorkerKind::CpuTts => section([
            ("endpoint", "http://127.0.0.1:5002".into()),
            ("executable", "piper".into()),
            ("num_threads", 4.into()),
            ("default_voice", "default".into()),
            ("sample_rate", 22_050.into()),
            ("output_format", "wav".into()),
        ]),
        WorkerKind::GpuImage => section([
            ("endpoint", "http://127.0.0.1:7860".into()),
            ("max_concurrent", 1.into()),
            ("default_steps", 30.into()),
            ("turbo_steps", 4.into()),
            ("width", 512.into()),
            ("height", 512.into()),
            ("guidance_scale", 7.5.into()),
        ]),
    };
    defaults.extend(specific);
    defaults
}

pub fn api_server() -> Section {
    section([
        ("enabled", true.into()),
        ("host", "127.0.0.1".into()),
        ("port", 8000.into()),
        ("tls_enabled", false.into()),
        ("tls_cert_path", "".into()),
        ("tls_key_path", "".into()),
        ("rate_limit_enabled", true.into()),
        ("rate_limit_per_minute", 120.into()),
        ("max_connections", 100.into()),
        ("connection_timeout_ms", 30_000.into()),
    ])
}

pub fn monitoring() -> Section {
    section([
        ("enabled", true.into()),
        ("collection_interval_ms", 1000.into()),
        ("collect_gpu", true.into()),
        ("collect_cpu", true.into()),
        ("collect_memory", true.into()),
        ("alert_gpu_utilization", 0.95.into()),
        ("alert_memory_mb", 22_528.into()),
        ("alert_queue_depth", 100.into()),
        ("telemetry", "auto".into()),
    ])
}

pub fn optimization() -> Section {
    section([
        ("strategy", "balanced".into()),
        ("auto_tune_batch_size", false.into()),
        ("auto_tune_threads", false.into()),
        ("auto_scale_enabled", false.into()),
    ])
}

pub fn global() -> Section {
    section([
        ("log_level", "info".into()),
        ("log_dir", "logs".into()),
        ("temp_dir", "tmp".into()),
        ("model_dir", "models".into()),
        ("output_dir", "output".into()),
        ("allow_shared_gpu", false.into()),
    ])
}

/// Defaults for any section.
pub fn for_section(section: ConfigSection) -> Section {
    match section {
        ConfigSection::Worker(kind) => worker(kind),
        ConfigSection::ApiServer => api_server(),
        ConfigSection::Monitoring => monitoring(),
        ConfigSection::Optimization => optimization(),
        ConfigSection::Global => global(),
    }
}
