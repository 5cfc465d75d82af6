//! Integration tests for the configuration store: file loading, JSON
//! round trips, validation and change notification.

use std::sync::{Arc, Mutex};

use serde_json::json;

use ai_lanes::config::{ConfigSection, ConfigStore, ConfigValue, WorkerKind};
use ai_lanes::error::ConfigError;

fn initialized() -> ConfigStore {
    let store = ConfigStore::new();
    store.initialize(None).unwrap();
    store
}

#[test]
fn export_import_round_trip_covers_every_domain() {
    let source = initialized();
    source.set_worker_config(WorkerKind::GpuLlm, "temperature", 0.2);
    source.set_worker_config(WorkerKind::GpuLlm, "draft_model", "tiny-draft.gguf");
    source.set_worker_config(WorkerKind::CpuTts, "default_voice", "mock-bright");
    source.set_worker_config(WorkerKind::CpuTts, "phonemizer", ConfigValue::Absent);
    source.set_worker_config(WorkerKind::GpuImage, "turbo_steps", 2);
    source.set_worker_config(WorkerKind::GpuImage, "guidance_scale", 7.0);
    source.set_api_server_config("port", 9100);
    source.set_api_server_config("cors_origin", "https://lanes.local");
    source.set_monitoring_config("alert_queue_depth", 12);
    source.set_monitoring_config("retention_hours", 48);
    source.set_optimization_config("strategy", "latency");
    source.set_optimization_config("batch_window_ms", 2.5);
    source.set_global_config("log_level", "debug");
    source.set_global_config("instance_name", "lanes-a");

    let doc = source.export_to_json();
    for section in ["workers", "api_server", "monitoring", "optimization", "global"] {
        assert!(doc.get(section).is_some(), "missing {section}");
    }

    // A fresh store holds nothing, so every key below must come from the
    // exported document.
    let target = ConfigStore::new();
    target.load_from_json(&doc).unwrap();
    assert_eq!(target.export_to_json(), doc);

    let llm = ConfigSection::Worker(WorkerKind::GpuLlm);
    let tts = ConfigSection::Worker(WorkerKind::CpuTts);
    let image = ConfigSection::Worker(WorkerKind::GpuImage);
    assert_eq!(target.get(llm, "temperature", 0.0), ConfigValue::Float(0.2));
    assert_eq!(target.get_string(llm, "draft_model", ""), "tiny-draft.gguf");
    // Defaults travel too.
    assert_eq!(target.get(llm, "max_tokens", 0), ConfigValue::Int(512));
    assert_eq!(
        target.get_string(tts, "default_voice", ""),
        "mock-bright"
    );
    assert!(target.keys(tts).contains(&"phonemizer".to_string()));
    assert_eq!(target.get(tts, "phonemizer", "fallback"), ConfigValue::from("fallback"));
    assert_eq!(target.get(image, "turbo_steps", 0), ConfigValue::Int(2));
    // A whole-number float stays a float.
    assert_eq!(target.get(image, "guidance_scale", 0), ConfigValue::Float(7.0));
    assert_eq!(target.get_api_server_config("port", 0), ConfigValue::Int(9100));
    assert_eq!(
        target.get_api_server_config("cors_origin", "").string_or(""),
        "https://lanes.local"
    );
    assert_eq!(target.get_monitoring_config("alert_queue_depth", 0).int_or(0), 12);
    assert_eq!(target.get_monitoring_config("retention_hours", 0).int_or(0), 48);
    assert_eq!(
        target.get_optimization_config("strategy", "").string_or(""),
        "latency"
    );
    assert_eq!(
        target.get_optimization_config("batch_window_ms", 0),
        ConfigValue::Float(2.5)
    );
    assert_eq!(target.get_global_config("log_level", "").string_or(""), "debug");
    assert_eq!(
        target.get_global_config("instance_name", "").string_or(""),
        "lanes-a"
    );
}

#[test]
fn thread_bounds_validated_until_fixed() {
    let store = initialized();
    store.set_worker_config(WorkerKind::CpuTts, "min_threads", 4);
    store.set_worker_config(WorkerKind::CpuTts, "max_threads", 2);

    match store.validate() {
        Err(ConfigError::Validation(errors)) => {
            assert!(errors.iter().any(|e| e.contains("max_threads")));
        }
        other => panic!("expected validation failure, got {other:?}"),
    }

    store.set_worker_config(WorkerKind::CpuTts, "max_threads", 8);
    store.validate().unwrap();
}

#[test]
fn out_of_range_port_rejected() {
    let store = initialized();
    store.set_api_server_config("port", 70_000);
    assert!(matches!(
        store.validate(),
        Err(ConfigError::Validation(errors)) if errors.iter().any(|e| e.contains("port"))
    ));
}

#[test]
fn file_overrides_and_malformed_files() {
    let dir = tempfile::tempdir().unwrap();

    let good = dir.path().join("lanes.json");
    std::fs::write(
        &good,
        json!({
            "workers": { "gpu_llm": { "max_tokens": 64 } },
            "global": { "output_dir": "/srv/artifacts" }
        })
        .to_string(),
    )
    .unwrap();
    let store = ConfigStore::new();
    store.initialize(Some(&good)).unwrap();
    assert_eq!(store.source_path().as_deref(), Some(good.as_path()));
    assert_eq!(
        store.get_int(ConfigSection::Worker(WorkerKind::GpuLlm), "max_tokens", 0),
        64
    );
    assert_eq!(
        store.get_string(ConfigSection::Global, "output_dir", ""),
        "/srv/artifacts"
    );
    // Untouched keys keep their defaults.
    assert_eq!(store.get_int(ConfigSection::ApiServer, "port", 0), 8000);

    let broken = dir.path().join("broken.json");
    std::fs::write(&broken, "{ not json").unwrap();
    let fallback = ConfigStore::new();
    fallback.initialize(Some(&broken)).unwrap();
    assert_eq!(
        fallback.get_int(ConfigSection::Worker(WorkerKind::GpuLlm), "max_tokens", 0),
        512
    );
    assert!(matches!(
        fallback.initialize(None),
        Err(ConfigError::AlreadyInitialized)
    ));
}

#[test]
fn save_then_reload_picks_up_edits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lanes.json");

    let store = initialized();
    store.save_to_file(&path).unwrap();

    let reloaded = ConfigStore::new();
    reloaded.initialize(Some(&path)).unwrap();
    assert_eq!(reloaded.export_to_json(), store.export_to_json());

    std::fs::write(
        &path,
        json!({ "monitoring": { "alert_queue_depth": 7 } }).to_string(),
    )
    .unwrap();
    reloaded.reload().unwrap();
    assert_eq!(
        reloaded.get_int(ConfigSection::Monitoring, "alert_queue_depth", 0),
        7
    );

    // An invalid edit is rejected and the previous values survive.
    std::fs::write(&path, json!({ "api_server": { "port": 70_000 } }).to_string()).unwrap();
    assert!(reloaded.reload().is_err());
    assert_eq!(reloaded.get_int(ConfigSection::ApiServer, "port", 0), 8000);
}

#[test]
fn listeners_see_changes_until_unregistered() {
    let store = initialized();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let id = store.register_config_change_listener(move |change| {
        sink.lock()
            .unwrap()
            .push((change.key.clone(), change.new.int_or(-1)));
    });

    store.set_monitoring_config("alert_queue_depth", 5);
    assert!(store.unregister_config_change_listener(id));
    store.set_monitoring_config("alert_queue_depth", 6);

    assert_eq!(
        *seen.lock().unwrap(),
        vec![("alert_queue_depth".to_string(), 5)]
    );
    assert!(!store.unregister_config_change_listener(id));
}
