//! Typed views over the store. Components read a snapshot at construction or
//! initialize time so the hot path never touches the store lock.

use std::path::PathBuf;
use std::time::Duration;

use super::{ConfigSection, ConfigStore, WorkerKind};

fn millis(value: i64) -> Option<Duration> {
    u64::try_from(value).ok().filter(|ms| *ms > 0).map(Duration::from_millis)
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Keys every worker section carries.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub kind: WorkerKind,
    pub enabled: bool,
    pub min_threads: usize,
    pub max_threads: usize,
    /// 0 = unbounded.
    pub max_queue_size: usize,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    /// -1 = CPU.
    pub device_id: i64,
    pub max_memory_mb: u64,
    pub model_path: PathBuf,
    pub backend: String,
    pub endpoint: Option<String>,
    pub executable: Option<String>,
    pub request_timeout: Duration,
    pub soft_deadline: Option<Duration>,
    pub mock_latency: Duration,
}

impl WorkerSettings {
    pub fn from_store(store: &ConfigStore, kind: WorkerKind) -> Self {
        let section = ConfigSection::Worker(kind);
        let int = |key: &str, default: i64| store.get_int(section, key, default);
        let string = |key: &str| store.get_string(section, key, "");

        let min_threads = usize::try_from(int("min_threads", 1)).unwrap_or(1).max(1);
        Self {
            kind,
            enabled: store.get_bool(section, "enabled", true),
            min_threads,
            max_threads: usize::try_from(int("max_threads", 1))
                .unwrap_or(1)
                .max(min_threads),
            max_queue_size: usize::try_from(int("max_queue_size", 0)).unwrap_or(0),
            batch_size: usize::try_from(int("batch_size", 1)).unwrap_or(1).max(1),
            batch_timeout: Duration::from_millis(u64::try_from(int("batch_timeout_ms", 50)).unwrap_or(50)),
            device_id: int("device_id", -1),
            max_memory_mb: u64::try_from(int("max_memory_mb", 0)).unwrap_or(0),
            model_path: PathBuf::from(string("model_path")),
            backend: non_empty(string("backend")).unwrap_or_else(|| "mock".to_string()),
            endpoint: non_empty(string("endpoint")),
            executable: non_empty(string("executable")),
            request_timeout: millis(int("request_timeout_ms", 120_000))
                .unwrap_or(Duration::from_secs(120)),
            soft_deadline: millis(int("soft_deadline_ms", 0)),
            mock_latency: Duration::from_millis(u64::try_from(int("mock_latency_ms", 0)).unwrap_or(0)),
        }
    }

    /// Device index when the worker is bound to a GPU.
    pub fn gpu_device(&self) -> Option<u32> {
        u32::try_from(self.device_id).ok()
    }
}

/// LLM sampling defaults applied when a request leaves a field unset.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmSettings {
    pub worker: WorkerSettings,
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub max_tokens: u32,
    pub context_length: u32,
    pub warmup_prompt: Option<String>,
    pub api_key: Option<String>,
}

impl LlmSettings {
    pub fn from_store(store: &ConfigStore) -> Self {
        let kind = WorkerKind::GpuLlm;
        let section = ConfigSection::Worker(kind);
        Self {
            worker: WorkerSettings::from_store(store, kind),
            temperature: store.get_float(section, "temperature", 0.7) as f32,
            top_k: u32::try_from(store.get_int(section, "top_k", 40)).unwrap_or(40),
            top_p: store.get_float(section, "top_p", 0.9) as f32,
            repetition_penalty: store.get_float(section, "repetition_penalty", 1.1) as f32,
            max_tokens: u32::try_from(store.get_int(section, "max_tokens", 512)).unwrap_or(512),
            context_length: u32::try_from(store.get_int(section, "context_length", 4096))
                .unwrap_or(4096),
            warmup_prompt: non_empty(store.get_string(section, "warmup_prompt", "")),
            api_key: non_empty(store.get_string(section, "api_key", "")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TtsSettings {
    pub worker: WorkerSettings,
    pub num_threads: usize,
    pub default_voice: String,
    pub sample_rate: u32,
    pub output_format: String,
}

impl TtsSettings {
    pub fn from_store(store: &ConfigStore) -> Self {
        let kind = WorkerKind::CpuTts;
        let section = ConfigSection::Worker(kind);
        Self {
            worker: WorkerSettings::from_store(store, kind),
            num_threads: usize::try_from(store.get_int(section, "num_threads", 4))
                .unwrap_or(4)
                .max(1),
            default_voice: store.get_string(section, "default_voice", "default"),
            sample_rate: u32::try_from(store.get_int(section, "sample_rate", 22_050))
                .unwrap_or(22_050),
            output_format: store.get_string(section, "output_format", "wav"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageSettings {
    pub worker: WorkerSettings,
    pub max_concurrent: usize,
    pub default_steps: u32,
    pub turbo_steps: u32,
    pub width: u32,
    pub height: u32,
    pub guidance_scale: f32,
}

impl ImageSettings {
    pub fn from_store(store: &ConfigStore) -> Self {
        let kind = WorkerKind::GpuImage;
        let section = ConfigSection::Worker(kind);
        let dim = |key: &str| u32::try_from(store.get_int(section, key, 512)).unwrap_or(512);
        Self {
            worker: WorkerSettings::from_store(store, kind),
            max_concurrent: usize::try_from(store.get_int(section, "max_concurrent", 1))
                .unwrap_or(1)
                .max(1),
            default_steps: u32::try_from(store.get_int(section, "default_steps", 30))
                .unwrap_or(30)
                .max(1),
            turbo_steps: u32::try_from(store.get_int(section, "turbo_steps", 4))
                .unwrap_or(4)
                .max(1),
            width: dim("width"),
            height: dim("height"),
            guidance_scale: store.get_float(section, "guidance_scale", 7.5) as f32,
        }
    }
}

/// Settings for the front-end that sits in front of the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiServerSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub tls_enabled: bool,
    pub rate_limit_enabled: bool,
    pub rate_limit_per_minute: u32,
    pub max_connections: usize,
    pub connection_timeout: Duration,
}

impl ApiServerSettings {
    pub fn from_store(store: &ConfigStore) -> Self {
        let section = ConfigSection::ApiServer;
        Self {
            enabled: store.get_bool(section, "enabled", true),
            host: store.get_string(section, "host", "127.0.0.1"),
            port: u16::try_from(store.get_int(section, "port", 8000)).unwrap_or(8000),
            tls_enabled: store.get_bool(section, "tls_enabled", false),
            rate_limit_enabled: store.get_bool(section, "rate_limit_enabled", true),
            rate_limit_per_minute: u32::try_from(store.get_int(section, "rate_limit_per_minute", 120))
                .unwrap_or(120),
            max_connections: usize::try_from(store.get_int(section, "max_connections", 100))
                .unwrap_or(100),
            connection_timeout: millis(store.get_int(section, "connection_timeout_ms", 30_000))
                .unwrap_or(Duration::from_secs(30)),
        }
    }
}

/// Which utilization source the monitor uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetrySource {
    /// Probe `nvidia-smi`, fall back to estimates.
    Auto,
    NvidiaSmi,
    Estimated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitoringSettings {
    pub enabled: bool,
    pub collection_interval: Duration,
    pub collect_gpu: bool,
    pub collect_cpu: bool,
    pub collect_memory: bool,
    pub alert_gpu_utilization: f64,
    pub alert_memory_mb: u64,
    pub alert_queue_depth: usize,
    pub telemetry: TelemetrySource,
}

impl MonitoringSettings {
    pub fn from_store(store: &ConfigStore) -> Self {
        let section = ConfigSection::Monitoring;
        let telemetry = match store.get_string(section, "telemetry", "auto").as_str() {
            "nvidia-smi" | "nvidia_smi" => TelemetrySource::NvidiaSmi,
            "estimate" | "estimated" | "off" => TelemetrySource::Estimated,
            _ => TelemetrySource::Auto,
        };
        Self {
            enabled: store.get_bool(section, "enabled", true),
            collection_interval: Duration::from_millis(
                u64::try_from(store.get_int(section, "collection_interval_ms", 1000))
                    .unwrap_or(1000)
                    .max(100),
            ),
            collect_gpu: store.get_bool(section, "collect_gpu", true),
            collect_cpu: store.get_bool(section, "collect_cpu", true),
            collect_memory: store.get_bool(section, "collect_memory", true),
            alert_gpu_utilization: store.get_float(section, "alert_gpu_utilization", 0.95),
            alert_memory_mb: u64::try_from(store.get_int(section, "alert_memory_mb", 22_528))
                .unwrap_or(22_528),
            alert_queue_depth: usize::try_from(store.get_int(section, "alert_queue_depth", 100))
                .unwrap_or(100),
            telemetry,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalSettings {
    pub log_level: String,
    pub log_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub model_dir: PathBuf,
    pub output_dir: PathBuf,
    pub allow_shared_gpu: bool,
}

impl GlobalSettings {
    pub fn from_store(store: &ConfigStore) -> Self {
        let section = ConfigSection::Global;
        let path = |key: &str, default: &str| PathBuf::from(store.get_string(section, key, default));
        Self {
            log_level: store.get_string(section, "log_level", "info"),
            log_dir: path("log_dir", "logs"),
            temp_dir: path("temp_dir", "tmp"),
            model_dir: path("model_dir", "models"),
            output_dir: path("output_dir", "output"),
            allow_shared_gpu: store.get_bool(section, "allow_shared_gpu", false),
        }
    }

    /// Resolve a model path against `model_dir` unless it is absolute or
    /// already exists relative to the working directory.
    pub fn resolve_model_path(&self, path: &std::path::Path) -> PathBuf {
        if path.is_absolute() || path.exists() || path.as_os_str().is_empty() {
            path.to_path_buf()
        } else {
            match path.strip_prefix("models") {
                Ok(rest) => self.model_dir.join(rest),
                Err(_) => self.model_dir.join(path),
            }
        }
    }
}
