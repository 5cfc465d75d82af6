//! Hot reload for the configuration file.
//!
//! Watches the parent directory so editors that save via rename are picked
//! up. Bursts of events are debounced, then `ConfigStore::reload` runs; an
//! invalid edit is logged and the current configuration stays in place.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use super::ConfigStore;
use crate::error::ConfigError;

const DEBOUNCE: Duration = Duration::from_millis(500);

/// Keeps the file watch alive. Dropping it stops watching and ends the
/// reload thread.
pub struct ConfigWatcher {
    watcher: Option<RecommendedWatcher>,
    thread: Option<JoinHandle<()>>,
    path: PathBuf,
}

impl ConfigWatcher {
    /// Watch the store's source file.
    pub fn spawn(store: Arc<ConfigStore>) -> Result<Self, ConfigError> {
        let path = store.source_path().ok_or(ConfigError::NoSource)?;
        Self::watch(store, path)
    }

    /// Watch `path` and reload `store` when it changes.
    pub fn watch(store: Arc<ConfigStore>, path: PathBuf) -> Result<Self, ConfigError> {
        let (event_tx, event_rx) = mpsc::channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = event_tx.send(event);
                }
                Err(e) => tracing::warn!(error = %e, "Configuration watch error"),
            },
            notify::Config::default(),
        )
        .map_err(|e| ConfigError::Watch(e.to_string()))?;

        let watch_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigError::Watch(format!("{}: {e}", watch_dir.display())))?;

        let file_name = path.file_name().map(|name| name.to_os_string());
        let thread = std::thread::Builder::new()
            .name("config-watcher".to_string())
            .spawn(move || {
                let mut pending = false;
                loop {
                    match event_rx.recv_timeout(DEBOUNCE) {
                        Ok(event) => {
                            let relevant = matches!(
                                event.kind,
                                EventKind::Modify(_) | EventKind::Create(_)
                            ) && event
                                .paths
                                .iter()
                                .any(|p| p.file_name() == file_name.as_deref());
                            pending |= relevant;
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if std::mem::take(&mut pending) {
                                match store.reload() {
                                    Ok(()) => {}
                                    Err(e) => tracing::warn!(
                                        error = %e,
                                        "Configuration reload rejected, keeping current values"
                                    ),
                                }
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::debug!("Configuration watcher stopped");
            })
            .map_err(|e| ConfigError::Watch(e.to_string()))?;

        tracing::info!(path = %path.display(), "Watching configuration file");
        Ok(Self {
            watcher: Some(watcher),
            thread: Some(thread),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        // Dropping the watcher closes the event channel.
        self.watcher.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerKind;
    use std::time::Instant;

    fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        check()
    }

    #[test]
    fn requires_source_path() {
        let store = Arc::new(ConfigStore::new());
        store.initialize(None).unwrap();
        assert!(matches!(
            ConfigWatcher::spawn(store),
            Err(ConfigError::NoSource)
        ));
    }

    #[test]
    fn reloads_on_change_and_rejects_invalid_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lanes.json");
        std::fs::write(&path, r#"{"workers": {"gpu_llm": {"max_tokens": 128}}}"#).unwrap();

        let store = Arc::new(ConfigStore::new());
        store.initialize(Some(&path)).unwrap();
        let _watcher = ConfigWatcher::spawn(Arc::clone(&store)).unwrap();

        std::fs::write(&path, r#"{"workers": {"gpu_llm": {"max_tokens": 256}}}"#).unwrap();
        assert!(wait_for(Duration::from_secs(5), || {
            store.get_worker_config(WorkerKind::GpuLlm, "max_tokens", 0).int_or(0) == 256
        }));

        std::fs::write(&path, r#"{"api_server": {"port": 0}}"#).unwrap();
        std::thread::sleep(Duration::from_millis(1500));
        assert_eq!(store.get_api_server_config("port", 0).int_or(0), 8000);
    }
}
