//! Shared configuration store.
//!
//! One `ConfigStore` is constructed at startup and handed to the scheduler and
//! every worker behind an `Arc`. Reads and writes are synchronized internally;
//! listeners are notified synchronously after each successful mutation.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde_json::{Map, Value};

use super::{ConfigSection, ConfigValue, WorkerKind, defaults};
use crate::error::ConfigError;

/// Key/value map for one section.
pub type Section = BTreeMap<String, ConfigValue>;

/// Change notification delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigChange {
    pub section: ConfigSection,
    pub key: String,
    pub old: ConfigValue,
    pub new: ConfigValue,
}

pub type ConfigListener = Arc<dyn Fn(&ConfigChange) + Send + Sync>;

/// Handle returned by `register_config_change_listener`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, Default, PartialEq)]
struct ConfigData {
    workers: BTreeMap<WorkerKind, Section>,
    api_server: Section,
    monitoring: Section,
    optimization: Section,
    global: Section,
}

impl ConfigData {
    fn seeded() -> Self {
        let mut data = Self::default();
        for section in ConfigSection::all() {
            *data.section_mut(section) = defaults::for_section(section);
        }
        data
    }

    fn section(&self, section: ConfigSection) -> Option<&Section> {
        match section {
            ConfigSection::Worker(kind) => self.workers.get(&kind),
            ConfigSection::ApiServer => Some(&self.api_server),
            ConfigSection::Monitoring => Some(&self.monitoring),
            ConfigSection::Optimization => Some(&self.optimization),
            ConfigSection::Global => Some(&self.global),
        }
    }

    fn section_mut(&mut self, section: ConfigSection) -> &mut Section {
        match section {
            ConfigSection::Worker(kind) => self.workers.entry(kind).or_default(),
            ConfigSection::ApiServer => &mut self.api_server,
            ConfigSection::Monitoring => &mut self.monitoring,
            ConfigSection::Optimization => &mut self.optimization,
            ConfigSection::Global => &mut self.global,
        }
    }

    fn get(&self, section: ConfigSection, key: &str) -> Option<&ConfigValue> {
        self.section(section).and_then(|s| s.get(key))
    }

    fn to_json(&self) -> Value {
        fn section_json(section: &Section) -> Value {
            Value::Object(
                section
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            )
        }

        let workers: Map<String, Value> = self
            .workers
            .iter()
            .map(|(kind, section)| (kind.key().to_string(), section_json(section)))
            .collect();

        let mut root = Map::new();
        root.insert("workers".to_string(), Value::Object(workers));
        for section in ConfigSection::FLAT {
            if let Some(values) = self.section(section) {
                root.insert(section.key().to_string(), section_json(values));
            }
        }
        Value::Object(root)
    }

    /// Merge a JSON document into this data. Unknown sections are skipped with
    /// a warning; malformed sections are an error and leave `self` untouched.
    fn overlay(&mut self, doc: &Value) -> Result<usize, ConfigError> {
        let root = doc
            .as_object()
            .ok_or_else(|| ConfigError::ParseError("document root must be an object".into()))?;

        let mut staged: Vec<(ConfigSection, String, ConfigValue)> = Vec::new();
        for (name, body) in root {
            if name == "workers" {
                let workers = body.as_object().ok_or_else(|| {
                    ConfigError::ParseError("`workers` must be an object".into())
                })?;
                for (worker_key, worker_body) in workers {
                    match WorkerKind::from_key(worker_key) {
                        Some(kind) => stage_section(
                            &mut staged,
                            ConfigSection::Worker(kind),
                            worker_body,
                        )?,
                        None => {
                            tracing::warn!(worker = %worker_key, "Ignoring unknown worker section")
                        }
                    }
                }
                continue;
            }

            match ConfigSection::FLAT.into_iter().find(|s| s.key() == name) {
                Some(section) => stage_section(&mut staged, section, body)?,
                None => tracing::warn!(section = %name, "Ignoring unknown configuration section"),
            }
        }

        let count = staged.len();
        for (section, key, value) in staged {
            self.section_mut(section).insert(key, value);
        }
        Ok(count)
    }

    /// Keys whose value differs between `self` and `other`.
    fn diff(&self, other: &ConfigData) -> Vec<ConfigChange> {
        let mut changes = Vec::new();
        for section in ConfigSection::all() {
            let empty = Section::new();
            let before = self.section(section).unwrap_or(&empty);
            let after = other.section(section).unwrap_or(&empty);

            for (key, old) in before {
                let new = after.get(key).cloned().unwrap_or_default();
                if *old != new {
                    changes.push(ConfigChange {
                        section,
                        key: key.clone(),
                        old: old.clone(),
                        new,
                    });
                }
            }
            for (key, new) in after {
                if !before.contains_key(key) {
                    changes.push(ConfigChange {
                        section,
                        key: key.clone(),
                        old: ConfigValue::Absent,
                        new: new.clone(),
                    });
                }
            }
        }
        changes
    }
}

fn stage_section(
    staged: &mut Vec<(ConfigSection, String, ConfigValue)>,
    section: ConfigSection,
    body: &Value,
) -> Result<(), ConfigError> {
    let entries = body
        .as_object()
        .ok_or_else(|| ConfigError::ParseError(format!("section `{section}` must be an object")))?;

    for (key, raw) in entries {
        let value = ConfigValue::from_json(raw).ok_or_else(|| ConfigError::InvalidValue {
            key: format!("{section}.{key}"),
            message: "nested values are not supported".to_string(),
        })?;
        staged.push((section, key.clone(), value));
    }
    Ok(())
}

/// Semantic checks that cannot be expressed in the types. Collects every
/// violation.
fn validate_data(data: &ConfigData) -> Vec<String> {
    let mut errors = Vec::new();
    let get = |section, key: &str| data.get(section, key).cloned().unwrap_or_default();

    if get(ConfigSection::ApiServer, "enabled").bool_or(false) {
        let port = get(ConfigSection::ApiServer, "port").int_or(0);
        if !(1..=65_535).contains(&port) {
            errors.push(format!("api_server.port must be in [1, 65535], got {port}"));
        }
    }

    for kind in WorkerKind::ALL {
        let section = ConfigSection::Worker(kind);
        if !get(section, "enabled").bool_or(false) {
            continue;
        }

        let min_threads = get(section, "min_threads").int_or(0);
        let max_threads = get(section, "max_threads").int_or(0);
        if min_threads < 1 {
            errors.push(format!("{section}.min_threads must be >= 1, got {min_threads}"));
        }
        if max_threads < min_threads {
            errors.push(format!(
                "{section}.max_threads ({max_threads}) must be >= min_threads ({min_threads})"
            ));
        }

        if kind.is_gpu_bound() {
            let device_id = get(section, "device_id").int_or(-1);
            if device_id < 0 {
                errors.push(format!(
                    "{section}.device_id must be a non-negative GPU id, got {device_id}"
                ));
            }
        }

        if kind == WorkerKind::GpuImage {
            let max_concurrent = get(section, "max_concurrent").int_or(1);
            if max_concurrent != 1 {
                errors.push(format!(
                    "{section}.max_concurrent must be 1, got {max_concurrent}"
                ));
            }
        }
    }

    let llm = ConfigSection::Worker(WorkerKind::GpuLlm);
    let image = ConfigSection::Worker(WorkerKind::GpuImage);
    if get(llm, "enabled").bool_or(false)
        && get(image, "enabled").bool_or(false)
        && !get(ConfigSection::Global, "allow_shared_gpu").bool_or(false)
    {
        let llm_device = get(llm, "device_id").int_or(-1);
        if llm_device >= 0 && llm_device == get(image, "device_id").int_or(-2) {
            errors.push(format!(
                "gpu_llm and gpu_image share device {llm_device}; set global.allow_shared_gpu to permit time-slicing"
            ));
        }
    }

    if get(ConfigSection::Monitoring, "enabled").bool_or(false) {
        let interval = get(ConfigSection::Monitoring, "collection_interval_ms").int_or(0);
        if interval < 100 {
            errors.push(format!(
                "monitoring.collection_interval_ms must be >= 100 when monitoring is enabled, got {interval}"
            ));
        }
    }

    errors
}

fn read_json_file(path: &Path) -> Result<Value, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Process-wide configuration, shared by reference.
pub struct ConfigStore {
    data: RwLock<ConfigData>,
    initialized: AtomicBool,
    source: Mutex<Option<PathBuf>>,
    /// Separate from the data lock; held while listeners run.
    listeners: Mutex<Vec<(ListenerId, ConfigListener)>>,
    next_listener: AtomicU64,
}

impl ConfigStore {
    /// Create an empty, uninitialized store.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(ConfigData::default()),
            initialized: AtomicBool::new(false),
            source: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    /// Seed defaults, overlay the optional JSON file and validate.
    ///
    /// A missing or malformed file is logged and ignored. Validation failure
    /// is returned and should abort startup.
    pub fn initialize(&self, config_path: Option<&Path>) -> Result<(), ConfigError> {
        if self.is_initialized() {
            return Err(ConfigError::AlreadyInitialized);
        }

        let mut data = ConfigData::seeded();
        if let Some(path) = config_path {
            *self.source.lock().unwrap_or_else(PoisonError::into_inner) = Some(path.to_path_buf());
            match read_json_file(path).and_then(|doc| data.overlay(&doc)) {
                Ok(count) => {
                    tracing::info!(path = %path.display(), keys = count, "Loaded configuration overrides");
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to load configuration file, using defaults"
                    );
                }
            }
        }

        *self.data.write().unwrap_or_else(PoisonError::into_inner) = data;
        self.validate()?;
        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!("Configuration initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// File passed to `initialize`, if any.
    pub fn source_path(&self) -> Option<PathBuf> {
        self.source.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Clear every section and re-seed the defaults. Listeners see each
    /// changed key.
    pub fn reset_to_defaults(&self) {
        self.replace(ConfigData::seeded());
        tracing::info!("Configuration reset to defaults");
    }

    /// Re-read the source file on top of the current values. The new state is
    /// validated first and discarded if invalid.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let path = self.source_path().ok_or(ConfigError::NoSource)?;
        let doc = read_json_file(&path)?;

        let mut candidate = self.snapshot();
        candidate.overlay(&doc)?;
        let errors = validate_data(&candidate);
        if !errors.is_empty() {
            return Err(ConfigError::Validation(errors));
        }

        let changed = self.replace(candidate);
        tracing::info!(path = %path.display(), changed, "Configuration reloaded");
        Ok(())
    }

    /// Check the semantic constraints on the current values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let errors = validate_data(&self.snapshot());
        if errors.is_empty() {
            Ok(())
        } else {
            for error in &errors {
                tracing::error!("Invalid configuration: {}", error);
            }
            Err(ConfigError::Validation(errors))
        }
    }

    // ── Generic access ──────────────────────────────────────────────────

    /// Read a value, falling back to `default` when the key is unset.
    pub fn get(
        &self,
        section: ConfigSection,
        key: &str,
        default: impl Into<ConfigValue>,
    ) -> ConfigValue {
        self.read()
            .get(section, key)
            .filter(|value| !value.is_absent())
            .cloned()
            .unwrap_or_else(|| default.into())
    }

    /// Write a value and notify listeners.
    pub fn set(&self, section: ConfigSection, key: &str, value: impl Into<ConfigValue>) {
        let new = value.into();
        let old = {
            let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
            data.section_mut(section)
                .insert(key.to_string(), new.clone())
                .unwrap_or_default()
        };

        tracing::debug!(section = %section, key, value = %new, "Configuration value set");
        self.notify(&[ConfigChange {
            section,
            key: key.to_string(),
            old,
            new,
        }]);
    }

    pub fn get_bool(&self, section: ConfigSection, key: &str, default: bool) -> bool {
        self.get(section, key, default).bool_or(default)
    }

    pub fn get_int(&self, section: ConfigSection, key: &str, default: i64) -> i64 {
        self.get(section, key, default).int_or(default)
    }

    pub fn get_float(&self, section: ConfigSection, key: &str, default: f64) -> f64 {
        self.get(section, key, default).float_or(default)
    }

    pub fn get_string(&self, section: ConfigSection, key: &str, default: &str) -> String {
        self.get(section, key, default).string_or(default)
    }

    /// Keys currently set in a section.
    pub fn keys(&self, section: ConfigSection) -> Vec<String> {
        self.read()
            .section(section)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    // ── Per-domain access ───────────────────────────────────────────────

    pub fn get_worker_config(
        &self,
        kind: WorkerKind,
        key: &str,
        default: impl Into<ConfigValue>,
    ) -> ConfigValue {
        self.get(ConfigSection::Worker(kind), key, default)
    }

    pub fn set_worker_config(&self, kind: WorkerKind, key: &str, value: impl Into<ConfigValue>) {
        self.set(ConfigSection::Worker(kind), key, value);
    }

    pub fn get_api_server_config(&self, key: &str, default: impl Into<ConfigValue>) -> ConfigValue {
        self.get(ConfigSection::ApiServer, key, default)
    }

    pub fn set_api_server_config(&self, key: &str, value: impl Into<ConfigValue>) {
        self.set(ConfigSection::ApiServer, key, value);
    }

    pub fn get_monitoring_config(&self, key: &str, default: impl Into<ConfigValue>) -> ConfigValue {
        self.get(ConfigSection::Monitoring, key, default)
    }

    pub fn set_monitoring_config(&self, key: &str, value: impl Into<ConfigValue>) {
        self.set(ConfigSection::Monitoring, key, value);
    }

    pub fn get_optimization_config(
        &self,
        key: &str,
        default: impl Into<ConfigValue>,
    ) -> ConfigValue {
        self.get(ConfigSection::Optimization, key, default)
    }

    pub fn set_optimization_config(&self, key: &str, value: impl Into<ConfigValue>) {
        self.set(ConfigSection::Optimization, key, value);
    }

    pub fn get_global_config(&self, key: &str, default: impl Into<ConfigValue>) -> ConfigValue {
        self.get(ConfigSection::Global, key, default)
    }

    pub fn set_global_config(&self, key: &str, value: impl Into<ConfigValue>) {
        self.set(ConfigSection::Global, key, value);
    }

    // ── Import / export ─────────────────────────────────────────────────

    /// Serialize every section.
    pub fn export_to_json(&self) -> Value {
        self.read().to_json()
    }

    /// Merge a JSON document into the store and notify listeners of every
    /// changed key. Does not validate.
    pub fn load_from_json(&self, doc: &Value) -> Result<(), ConfigError> {
        let mut candidate = self.snapshot();
        candidate.overlay(doc)?;
        self.replace(candidate);
        Ok(())
    }

    /// Write the pretty-printed export to `path`.
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(&self.export_to_json())?;
        std::fs::write(path, text)?;
        Ok(())
    }

    // ── Listeners ───────────────────────────────────────────────────────

    /// Subscribe to changes. Listeners run synchronously on the mutating
    /// thread and must not mutate the store themselves.
    pub fn register_config_change_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConfigChange) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    pub fn unregister_config_change_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    fn notify(&self, changes: &[ConfigChange]) {
        if changes.is_empty() {
            return;
        }
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        for change in changes {
            for (id, listener) in listeners.iter() {
                if catch_unwind(AssertUnwindSafe(|| listener(change))).is_err() {
                    tracing::error!(
                        listener = id.0,
                        section = %change.section,
                        key = %change.key,
                        "Configuration listener panicked"
                    );
                }
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ConfigData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> ConfigData {
        self.read().clone()
    }

    /// Swap in new data and notify the diff. Returns the number of changes.
    fn replace(&self, new: ConfigData) -> usize {
        let changes = {
            let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
            let changes = data.diff(&new);
            *data = new;
            changes
        };
        self.notify(&changes);
        changes.len()
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("initialized", &self.is_initialized())
            .field("source", &self.source_path())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    fn initialized() -> ConfigStore {
        let store = ConfigStore::new();
        store.initialize(None).unwrap();
        store
    }

    #[test]
    fn empty_until_initialized() {
        let store = ConfigStore::new();
        assert!(!store.is_initialized());
        assert!(store.keys(ConfigSection::Global).is_empty());
        assert_eq!(store.get_global_config("log_level", "fallback").string_or(""), "fallback");

        store.initialize(None).unwrap();
        assert_eq!(store.get_global_config("log_level", "fallback").string_or(""), "info");
    }

    #[test]
    fn second_initialize_rejected() {
        let store = initialized();
        assert!(matches!(
            store.initialize(None),
            Err(ConfigError::AlreadyInitialized)
        ));
    }

    #[test]
    fn defaults_validate() {
        initialized().validate().unwrap();
    }

    #[test]
    fn thread_bounds_enforced_for_enabled_workers() {
        let store = initialized();
        store.set_worker_config(WorkerKind::CpuTts, "min_threads", 4);
        store.set_worker_config(WorkerKind::CpuTts, "max_threads", 2);
        let err = store.validate().unwrap_err();
        assert!(err.to_string().contains("max_threads"), "{err}");

        store.set_worker_config(WorkerKind::CpuTts, "max_threads", 4);
        store.validate().unwrap();
    }

    #[test]
    fn disabled_worker_not_checked() {
        let store = initialized();
        store.set_worker_config(WorkerKind::CpuTts, "min_threads", 0);
        assert!(store.validate().is_err());
        store.set_worker_config(WorkerKind::CpuTts, "enabled", false);
        store.validate().unwrap();
    }

    #[test]
    fn api_port_range_checked_only_when_enabled() {
        let store = initialized();
        store.set_api_server_config("port", 70_000);
        assert!(store.validate().is_err());

        store.set_api_server_config("enabled", false);
        store.validate().unwrap();
    }

    #[test]
    fn gpu_workers_need_device() {
        let store = initialized();
        store.set_worker_config(WorkerKind::GpuImage, "device_id", -1);
        assert!(store.validate().is_err());
    }

    #[test]
    fn shared_device_requires_opt_in() {
        let store = initialized();
        store.set_worker_config(WorkerKind::GpuImage, "device_id", 0);
        assert!(store.validate().is_err());

        store.set_global_config("allow_shared_gpu", true);
        store.validate().unwrap();
    }

    #[test]
    fn monitoring_interval_floor() {
        let store = initialized();
        store.set_monitoring_config("collection_interval_ms", 50);
        assert!(store.validate().is_err());
        store.set_monitoring_config("enabled", false);
        store.validate().unwrap();
    }

    #[test]
    fn validation_reports_every_violation() {
        let store = initialized();
        store.set_api_server_config("port", 0);
        store.set_monitoring_config("collection_interval_ms", 10);
        match store.validate() {
            Err(ConfigError::Validation(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn listeners_see_old_and_new() {
        let store = initialized();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store.register_config_change_listener(move |change| {
            sink.lock().unwrap().push(change.clone());
        });

        store.set_worker_config(WorkerKind::GpuLlm, "temperature", 0.2);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].section, ConfigSection::Worker(WorkerKind::GpuLlm));
        assert_eq!(seen[0].old, ConfigValue::Float(0.7));
        assert_eq!(seen[0].new, ConfigValue::Float(0.2));
    }

    #[test]
    fn panicking_listener_does_not_break_setter() {
        let store = initialized();
        let calls = Arc::new(AtomicUsize::new(0));
        store.register_config_change_listener(|_| panic!("bad listener"));
        let counter = Arc::clone(&calls);
        store.register_config_change_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.set_global_config("log_level", "debug");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_global_config("log_level", "").string_or(""), "debug");
    }

    #[test]
    fn unregistered_listener_is_silent() {
        let store = initialized();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = store.register_config_change_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(store.unregister_config_change_listener(id));
        store.set_global_config("log_level", "warn");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reset_restores_defaults_and_notifies() {
        let store = initialized();
        store.set_api_server_config("port", 9000);
        store.set_global_config("custom_key", "x");

        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        store.register_config_change_listener(move |change| {
            sink.lock().unwrap().push(change.key.clone());
        });

        store.reset_to_defaults();
        assert_eq!(store.get_api_server_config("port", 0).int_or(0), 8000);
        assert!(!store.keys(ConfigSection::Global).contains(&"custom_key".to_string()));

        let mut keys = changes.lock().unwrap().clone();
        keys.sort();
        assert_eq!(keys, vec!["custom_key".to_string(), "port".to_string()]);
    }

    #[test]
    fn json_overlay_and_unknown_sections() {
        let store = initialized();
        let doc = serde_json::json!({
            "workers": { "gpu_llm": { "max_tokens": 64 }, "gpu_video": { "x": 1 } },
            "monitoring": { "enabled": false },
            "telemetry_sink": { "x": 1 }
        });
        store.load_from_json(&doc).unwrap();
        assert_eq!(store.get_worker_config(WorkerKind::GpuLlm, "max_tokens", 0).int_or(0), 64);
        assert!(!store.get_bool(ConfigSection::Monitoring, "enabled", true));
    }

    #[test]
    fn malformed_section_rejected_atomically() {
        let store = initialized();
        let doc = serde_json::json!({
            "global": { "log_level": "trace" },
            "api_server": [1, 2, 3]
        });
        assert!(store.load_from_json(&doc).is_err());
        assert_eq!(store.get_global_config("log_level", "").string_or(""), "info");
    }
}
