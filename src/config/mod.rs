//! Typed, hierarchical, hot-reloadable configuration.
//!
//! - `value` — `ConfigValue`, the tagged scalar stored under every key
//! - `defaults` — hard-coded defaults seeded on initialize/reset
//! - `store` — `ConfigStore`, the shared locked store with change listeners
//! - `settings` — typed views read out of the store by each component
//! - `watcher` — file watcher that drives `ConfigStore::reload`

pub mod defaults;
pub mod settings;
pub mod store;
pub mod value;
pub mod watcher;

pub use settings::{
    ApiServerSettings, GlobalSettings, ImageSettings, LlmSettings, MonitoringSettings,
    TtsSettings, WorkerSettings,
};
pub use store::{ConfigChange, ConfigListener, ConfigStore, ListenerId};
pub use value::ConfigValue;
pub use watcher::ConfigWatcher;

use serde::{Deserialize, Serialize};

/// Worker kinds, each owning one hardware lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    GpuLlm,
    CpuTts,
    GpuImage,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 3] = [WorkerKind::GpuLlm, WorkerKind::CpuTts, WorkerKind::GpuImage];

    /// Key used in the `workers` section of the JSON document.
    pub fn key(&self) -> &'static str {
        match self {
            Self::GpuLlm => "gpu_llm",
            Self::CpuTts => "cpu_tts",
            Self::GpuImage => "gpu_image",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.key() == key)
    }

    /// GPU-bound kinds must be configured with a non-negative device id.
    pub fn is_gpu_bound(&self) -> bool {
        matches!(self, Self::GpuLlm | Self::GpuImage)
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Top-level configuration domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigSection {
    Worker(WorkerKind),
    ApiServer,
    Monitoring,
    Optimization,
    Global,
}

impl ConfigSection {
    pub const FLAT: [ConfigSection; 4] = [
        ConfigSection::ApiServer,
        ConfigSection::Monitoring,
        ConfigSection::Optimization,
        ConfigSection::Global,
    ];

    /// Every section, worker sections first.
    pub fn all() -> impl Iterator<Item = ConfigSection> {
        WorkerKind::ALL
            .into_iter()
            .map(ConfigSection::Worker)
            .chain(Self::FLAT)
    }

    /// Top-level JSON key (worker sections live under `workers`).
    pub fn key(&self) -> &'static str {
        match self {
            Self::Worker(kind) => kind.key(),
            Self::ApiServer => "api_server",
            Self::Monitoring => "monitoring",
            Self::Optimization => "optimization",
            Self::Global => "global",
        }
    }
}

impl std::fmt::Display for ConfigSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Worker(kind) => write!(f, "workers.{}", kind.key()),
            other => write!(f, "{}", other.key()),
        }
    }
}
