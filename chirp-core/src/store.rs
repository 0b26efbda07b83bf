// ABOUTME: Durable plugin state: enabled/disabled sets and per-plugin settings objects
// ABOUTME: Writes are fire-and-forget through a watch-driven writer task; each write replaces the whole file

use crate::error::PersistenceError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Everything persisted about plugins
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginState {
    #[serde(default)]
    pub enabled: BTreeSet<String>,
    #[serde(default)]
    pub disabled: BTreeSet<String>,
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
}

struct StoreInner {
    path: Option<PathBuf>,
    state: Mutex<PluginState>,
    revision: watch::Sender<u64>,
}

/// Shared handle to the plugin state file
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("path", &self.inner.path)
            .finish()
    }
}

/// Recursively overlay `saved` onto `defaults`. Keys only in `saved` are kept.
pub fn merge_settings(defaults: Value, saved: Option<Value>) -> Value {
    match (defaults, saved) {
        (defaults, None) => defaults,
        (Value::Object(mut base), Some(Value::Object(overlay))) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => merge_settings(existing, Some(value)),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, Some(saved)) => saved,
    }
}

impl StateStore {
    fn with_state(path: Option<PathBuf>, state: PluginState) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(StoreInner {
                path,
                state: Mutex::new(state),
                revision,
            }),
        }
    }

    /// Store that never touches disk
    pub fn in_memory() -> Self {
        Self::with_state(None, PluginState::default())
    }

    /// Load state from `path`. A missing or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<PluginState>(&content) {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Plugin state file is corrupt, starting with defaults"
                    );
                    PluginState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PluginState::default(),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to read plugin state file, starting with defaults"
                );
                PluginState::default()
            }
        };
        Self::with_state(Some(path), state)
    }

    fn state(&self) -> MutexGuard<'_, PluginState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn snapshot(&self) -> PluginState {
        self.state().clone()
    }

    /// Persisted enable/disable choice, if one was ever made
    pub fn enabled_preference(&self, plugin: &str) -> Option<bool> {
        let state = self.state();
        if state.enabled.contains(plugin) {
            Some(true)
        } else if state.disabled.contains(plugin) {
            Some(false)
        } else {
            None
        }
    }

    pub fn set_enabled(&self, plugin: &str, enabled: bool) {
        {
            let mut state = self.state();
            if enabled {
                state.disabled.remove(plugin);
                state.enabled.insert(plugin.to_string());
            } else {
                state.enabled.remove(plugin);
                state.disabled.insert(plugin.to_string());
            }
        }
        self.persist();
    }

    /// Drop a plugin from both sets; its settings are kept
    pub fn forget(&self, plugin: &str) {
        {
            let mut state = self.state();
            state.enabled.remove(plugin);
            state.disabled.remove(plugin);
        }
        self.persist();
    }

    pub fn settings(&self, plugin: &str) -> Option<Value> {
        self.state().settings.get(plugin).cloned()
    }

    pub fn set_settings(&self, plugin: &str, value: Value) {
        self.state().settings.insert(plugin.to_string(), value);
        self.persist();
    }

    /// Signal the writer task. Never blocks, never fails.
    pub fn persist(&self) {
        self.inner.revision.send_modify(|rev| *rev += 1);
    }

    /// Write the current state synchronously
    pub fn flush(&self) -> Result<(), PersistenceError> {
        let Some(path) = self.inner.path.as_deref() else {
            return Ok(());
        };
        let encoded = serde_json::to_string_pretty(&self.snapshot())?;
        write_atomic(path, encoded.as_bytes())
    }

    /// Spawn the background writer. It writes after every [`Self::persist`] and
    /// once more when cancelled.
    pub fn spawn_writer(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        let mut revisions = self.inner.revision.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = revisions.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let writer = store.clone();
                        let result = tokio::task::spawn_blocking(move || writer.flush()).await;
                        match result {
                            Ok(Ok(())) => tracing::trace!("Plugin state persisted"),
                            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to persist plugin state"),
                            Err(e) => tracing::warn!(error = %e, "Plugin state writer panicked"),
                        }
                    }
                }
            }
            if let Err(e) = store.flush() {
                tracing::warn!(error = %e, "Failed to persist plugin state on shutdown");
            }
        })
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let io_err = |source| PersistenceError::Io {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_merge_overlays_saved_values() {
        let defaults = json!({"sides": 6, "max_dice": 20, "style": {"emoji": true, "bold": false}});
        let saved = json!({"max_dice": 50, "style": {"bold": true}, "extra": "kept"});
        let merged = merge_settings(defaults, Some(saved));
        assert_eq!(
            merged,
            json!({"sides": 6, "max_dice": 50, "style": {"emoji": true, "bold": true}, "extra": "kept"})
        );
    }

    #[test]
    fn test_merge_without_saved_returns_defaults() {
        assert_eq!(merge_settings(json!({"a": 1}), None), json!({"a": 1}));
    }

    #[test]
    fn test_enabled_preference_round_trip() {
        let store = StateStore::in_memory();
        assert_eq!(store.enabled_preference("dice"), None);
        store.set_enabled("dice", false);
        assert_eq!(store.enabled_preference("dice"), Some(false));
        store.set_enabled("dice", true);
        store.set_enabled("dice", true);
        assert_eq!(store.enabled_preference("dice"), Some(true));
        assert_eq!(store.snapshot().enabled.len(), 1);
        store.forget("dice");
        assert_eq!(store.enabled_preference("dice"), None);
    }

    #[test]
    fn test_flush_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("plugins.json");

        let store = StateStore::open(&path);
        store.set_enabled("dice", true);
        store.set_settings("dice", json!({"sides": 20}));
        store.flush().unwrap();

        let reopened = StateStore::open(&path);
        assert_eq!(reopened.enabled_preference("dice"), Some(true));
        assert_eq!(reopened.settings("dice"), Some(json!({"sides": 20})));
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plugins.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = StateStore::open(&path);
        assert_eq!(store.snapshot(), PluginState::default());
    }

    #[tokio::test]
    async fn test_writer_persists_in_background() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plugins.json");
        let store = StateStore::open(&path);
        let cancel = CancellationToken::new();
        let writer = store.spawn_writer(cancel.clone());

        store.set_enabled("echo", false);
        cancel.cancel();
        writer.await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let state: PluginState = serde_json::from_str(&content).unwrap();
        assert!(state.disabled.contains("echo"));
    }
}
