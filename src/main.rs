use std::path::PathBuf;
use std::sync::Arc;

use ai_lanes::config::{
    ApiServerSettings, ConfigChange, ConfigStore, ConfigWatcher, GlobalSettings,
    MonitoringSettings,
};
use ai_lanes::monitor::ResourceMonitor;
use ai_lanes::{InitOutcome, Scheduler, SchedulerStats, Task, TaskKind, TaskRequest};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// One JSON line on stdin.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Command {
    Submit(TaskRequest),
    Cancel { kind: TaskKind, id: String },
    Stats,
}

/// One JSON line on stdout.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Event<'a> {
    Accepted { id: &'a str, kind: TaskKind },
    Rejected { error: String },
    CancelResult { id: &'a str, cancelled: bool },
    Stats(SchedulerStats),
    Finished(&'a Task),
}

fn encode(event: &Event<'_>) -> Option<String> {
    serde_json::to_string(event)
        .inspect_err(|e| tracing::error!(error = %e, "Failed to encode event"))
        .ok()
}

fn emit(event: &Event<'_>) {
    if let Some(line) = encode(event) {
        println!("{line}");
    }
}

/// Answer one raw stdin line. `None` for blank lines.
fn handle(scheduler: &Scheduler, raw: &[u8]) -> Option<String> {
    let line = match std::str::from_utf8(raw) {
        Ok(line) => line.trim(),
        Err(e) => {
            tracing::warn!(error = %e, "Skipping request line that is not UTF-8");
            return encode(&Event::Rejected {
                error: format!("invalid request: {e}"),
            });
        }
    };
    if line.is_empty() {
        return None;
    }

    let command: Command = match serde_json::from_str(line) {
        Ok(command) => command,
        Err(e) => {
            return encode(&Event::Rejected {
                error: format!("invalid request: {e}"),
            });
        }
    };

    match command {
        Command::Submit(request) => {
            let kind = request.payload.kind();
            match scheduler.submit(request) {
                Ok(id) => encode(&Event::Accepted { id: &id, kind }),
                Err(e) => encode(&Event::Rejected {
                    error: e.to_string(),
                }),
            }
        }
        Command::Cancel { kind, id } => encode(&Event::CancelResult {
            cancelled: scheduler.cancel(kind, &id),
            id: &id,
        }),
        Command::Stats => encode(&Event::Stats(scheduler.aggregate_stats())),
    }
}

/// stderr plus a daily-rolling file in `global.log_dir`. `RUST_LOG` wins over
/// `global.log_level`.
fn init_logging(
    global: &GlobalSettings,
) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(&global.log_dir)?;
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&global.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file = tracing_appender::rolling::daily(&global.log_dir, "ai-lanes.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("AI_LANES_CONFIG").ok())
        .map(PathBuf::from);

    // Logging depends on the config, so report load problems on a temporary
    // stderr subscriber.
    let config = Arc::new(ConfigStore::new());
    let bootstrap = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::with_default(bootstrap, || config.initialize(config_path.as_deref()))?;

    let global = GlobalSettings::from_store(&config);
    let _log_guard = init_logging(&global)?;

    let api = ApiServerSettings::from_store(&config);
    eprintln!("AI Lanes v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Config: {}",
        config_path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(defaults)".to_string())
    );
    eprintln!("   Output: {}", global.output_dir.display());
    eprintln!("   Logs: {}", global.log_dir.display());
    tracing::info!(
        enabled = api.enabled,
        host = %api.host,
        port = api.port,
        "Request front-end settings"
    );

    config.register_config_change_listener(|change: &ConfigChange| {
        tracing::info!(
            section = %change.section,
            key = %change.key,
            old = %change.old,
            new = %change.new,
            "Configuration changed, applies to workers on next start"
        );
    });

    let scheduler = Arc::new(Scheduler::new(Arc::clone(&config)));
    scheduler.set_task_completed_callback(|task: &Task| emit(&Event::Finished(task)));
    scheduler.set_progress_callback(|task_id: &str, fraction: f32| {
        tracing::debug!(task_id, fraction, "Image progress");
    });

    let report = scheduler.initialize();
    for (kind, outcome) in &report.workers {
        match outcome {
            InitOutcome::Started => eprintln!("   {kind}: started"),
            InitOutcome::Skipped => eprintln!("   {kind}: disabled"),
            InitOutcome::Failed(reason) => eprintln!("   {kind}: FAILED ({reason})"),
        }
    }
    if report.started().is_empty() {
        anyhow::bail!("no worker could be started");
    }
    eprintln!("   Reading JSON requests from stdin. Ctrl-C to exit.\n");

    let monitoring = MonitoringSettings::from_store(&config);
    let monitor = if monitoring.enabled {
        Some(ResourceMonitor::spawn(Arc::clone(&scheduler), monitoring)?)
    } else {
        None
    };
    let watcher = if config_path.is_some() {
        ConfigWatcher::spawn(Arc::clone(&config))
            .inspect_err(|e| tracing::warn!(error = %e, "Configuration hot reload unavailable"))
            .ok()
    } else {
        None
    };

    let mut lines = BufReader::new(tokio::io::stdin()).split(b'\n');
    loop {
        tokio::select! {
            line = lines.next_segment() => match line {
                Ok(Some(raw)) => {
                    if let Some(reply) = handle(&scheduler, &raw) {
                        println!("{reply}");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read stdin, shutting down");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    drop(watcher);
    drop(monitor);
    let lanes = Arc::clone(&scheduler);
    tokio::task::spawn_blocking(move || lanes.shutdown()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(dir: &std::path::Path) -> Scheduler {
        let store = ConfigStore::new();
        store.initialize(None).unwrap();
        store.set_global_config("output_dir", dir.to_string_lossy().to_string());
        Scheduler::new(Arc::new(store))
    }

    fn reply(scheduler: &Scheduler, raw: &[u8]) -> serde_json::Value {
        serde_json::from_str(&handle(scheduler, raw).unwrap()).unwrap()
    }

    #[test]
    fn bad_lines_are_rejected_and_reading_continues() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path());

        assert_eq!(reply(&scheduler, b"\xff\xfe{\"op\"}")["event"], "rejected");
        assert_eq!(reply(&scheduler, b"{not json")["event"], "rejected");
        assert_eq!(handle(&scheduler, b"   "), None);

        let stats = reply(&scheduler, br#"{"op":"stats"}"#);
        assert_eq!(stats["event"], "stats");
        assert_eq!(stats["workers"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn submit_and_cancel_replies() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path());

        // Workers are not started, so submission is refused.
        let refused = reply(
            &scheduler,
            br#"{"op":"submit","payload":{"kind":"llm_inference","params":{"prompt":"hi"}}}"#,
        );
        assert_eq!(refused["event"], "rejected");

        let cancel = reply(
            &scheduler,
            br#"{"op":"cancel","kind":"llm_inference","id":"missing"}"#,
        );
        assert_eq!(cancel["event"], "cancel_result");
        assert_eq!(cancel["cancelled"], false);
    }
}
