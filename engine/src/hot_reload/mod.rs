//! Hot reload manager
//!
//! Reloading a plugin unloads the running instance and loads it again from
//! the (possibly updated) manifest on disk. When state preservation is on, a
//! [`PluginStateSnapshot`] is captured before the unload and the exported
//! state is handed to the new instance before it starts.
//!
//! One reload runs at a time, process-wide. A direct [`reload_plugin`] call
//! made while another reload is running fails with `ReloadInProgress`;
//! watch-driven reloads queue behind the gate instead.
//!
//! Whatever happens, a reloaded plugin ends either `started` or `error`.
//!
//! [`reload_plugin`]: HotReloadManager::reload_plugin

use crate::config::HotReloadConfig;
use crate::loader::PluginLoader;
use crate::message_bus::{catch_panic, emit, events, EventBus};
use crate::resolver::{Catalog, DependencyResolver};
use crate::storage::{FileStore, MANIFEST_FILE};
use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use sdk::errors::EngineError;
use sdk::manifest::Manifest;
use sdk::types::PluginState;
use serde::Serialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const SOURCE: &str = "hot_reload";

/// A change notification from the external file watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub plugin_id: String,
}

impl WatchEvent {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
        }
    }
}

/// State captured right before a reload unloads a plugin
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginStateSnapshot {
    pub plugin_id: String,
    pub state: PluginState,
    pub config: serde_json::Value,
    /// Whatever the plugin chose to export; absent if it exports nothing
    pub exported_state: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of one reload
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadResult {
    pub plugin_id: String,
    pub success: bool,
    pub duration: Duration,
    pub error: Option<String>,
    pub state_restored: bool,
}

pub struct HotReloadManager {
    loader: Arc<PluginLoader>,
    files: Arc<dyn FileStore>,
    config: HotReloadConfig,
    events: Option<Arc<EventBus>>,
    resolver: DependencyResolver,
    gate: tokio::sync::Mutex<()>,
    history: Mutex<VecDeque<ReloadResult>>,
}

impl HotReloadManager {
    pub fn new(loader: Arc<PluginLoader>, files: Arc<dyn FileStore>, config: HotReloadConfig) -> Self {
        Self {
            loader,
            files,
            config,
            events: None,
            resolver: DependencyResolver::new(),
            gate: tokio::sync::Mutex::new(()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    /// Reload one plugin
    ///
    /// Returns `Err(ReloadInProgress)` if another reload holds the gate;
    /// every other failure is reported in the returned [`ReloadResult`].
    pub async fn reload_plugin(&self, plugin_id: &str, preserve_state: bool) -> Result<ReloadResult, EngineError> {
        let Ok(_gate) = self.gate.try_lock() else {
            tracing::debug!(plugin_id, "Reload rejected, another reload is running");
            return Err(EngineError::ReloadInProgress);
        };
        Ok(self.reload_locked(plugin_id, preserve_state).await)
    }

    /// Reload every loaded plugin, one at a time, dependencies first
    pub async fn reload_all(&self) -> Result<Vec<ReloadResult>, EngineError> {
        let Ok(_gate) = self.gate.try_lock() else {
            return Err(EngineError::ReloadInProgress);
        };

        let order = self.reload_order().await;
        tracing::info!(count = order.len(), "Reloading all plugins");

        let mut results = Vec::with_capacity(order.len());
        for id in order {
            results.push(self.reload_locked(&id, self.config.preserve_state).await);
        }
        Ok(results)
    }

    /// Consume watcher notifications until the channel closes
    ///
    /// Notifications are collected until `debounce_ms` passes without a new
    /// one; each plugin in the batch is then reloaded once, provided its
    /// manifest enables hot reload.
    pub async fn watch(&self, mut changes: mpsc::Receiver<WatchEvent>) {
        let debounce = Duration::from_millis(self.config.debounce_ms);

        while let Some(first) = changes.recv().await {
            let mut batch = IndexSet::new();
            batch.insert(first.plugin_id);

            let mut closed = false;
            loop {
                match tokio::time::timeout(debounce, changes.recv()).await {
                    Ok(Some(event)) => {
                        batch.insert(event.plugin_id);
                    }
                    Ok(None) => {
                        closed = true;
                        break;
                    }
                    Err(_) => break,
                }
            }

            if self.config.enabled {
                for id in batch {
                    if !self.hot_reload_enabled(&id).await {
                        tracing::debug!(plugin_id = %id, "Change ignored, hot reload disabled");
                        continue;
                    }
                    let _gate = self.gate.lock().await;
                    self.reload_locked(&id, self.config.preserve_state).await;
                }
            }

            if closed {
                break;
            }
        }

        tracing::debug!("Watch channel closed");
    }

    /// Most recent reloads, oldest first
    pub fn history(&self) -> Vec<ReloadResult> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    async fn reload_locked(&self, plugin_id: &str, preserve_state: bool) -> ReloadResult {
        let started = Instant::now();
        tracing::info!(plugin_id, preserve_state, "Reloading plugin");

        let outcome = self.run_reload(plugin_id, preserve_state).await;
        let result = match outcome {
            Ok(state_restored) => {
                tracing::info!(plugin_id, elapsed = ?started.elapsed(), "Plugin reloaded");
                emit(
                    self.events.as_ref(),
                    events::PLUGIN_RELOADED,
                    SOURCE,
                    json!({ "pluginId": plugin_id, "stateRestored": state_restored }),
                )
                .await;
                ReloadResult {
                    plugin_id: plugin_id.to_string(),
                    success: true,
                    duration: started.elapsed(),
                    error: None,
                    state_restored,
                }
            }
            Err(e) => {
                tracing::error!(plugin_id, "Reload failed: {}", e);
                ReloadResult {
                    plugin_id: plugin_id.to_string(),
                    success: false,
                    duration: started.elapsed(),
                    error: Some(e.to_string()),
                    state_restored: false,
                }
            }
        };

        self.record(result.clone());
        result
    }

    /// Returns whether exported state was handed to the new instance
    async fn run_reload(&self, plugin_id: &str, preserve_state: bool) -> Result<bool, EngineError> {
        let registry = self.loader.registry();
        let current = registry
            .manifest(plugin_id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("plugin {}", plugin_id)))?;

        let snapshot = if preserve_state {
            self.snapshot(plugin_id, &current).await
        } else {
            None
        };

        let result = async {
            let manifest = self.read_manifest(plugin_id, current).await?;
            if manifest.id != plugin_id {
                return Err(EngineError::ManifestParse(format!(
                    "Manifest on disk declares id '{}' instead of '{}'",
                    manifest.id, plugin_id
                )));
            }
            self.loader.unload_for_reload(plugin_id).await?;

            let exported = snapshot.and_then(|s| s.exported_state);
            let restored = exported.is_some();
            self.loader.load_with_state(manifest, exported).await?;
            Ok(restored)
        }
        .await;

        if let Err(e) = &result {
            if registry.state(plugin_id).await != Some(PluginState::Error) {
                self.loader.mark_error(plugin_id, e).await;
            }
        }
        result
    }

    async fn snapshot(&self, plugin_id: &str, manifest: &Manifest) -> Option<PluginStateSnapshot> {
        let registry = self.loader.registry();
        let state = registry.state(plugin_id).await?;
        let plugin = registry.plugin(plugin_id).await?;

        let exported_state = match catch_panic(plugin.export_state()).await {
            Ok(exported) => exported,
            Err(panic) => {
                tracing::warn!(plugin_id, "State export panicked, reloading without it: {}", panic);
                None
            }
        };

        Some(PluginStateSnapshot {
            plugin_id: plugin_id.to_string(),
            state,
            config: serde_json::to_value(&manifest.config).unwrap_or(serde_json::Value::Null),
            exported_state,
            timestamp: Utc::now(),
        })
    }

    /// The manifest on disk, or the registered one if there is no file
    ///
    /// A file that exists but cannot be decoded is a `ManifestParse` error.
    async fn read_manifest(&self, plugin_id: &str, registered: Manifest) -> Result<Manifest, EngineError> {
        let bytes = match self.files.read_file(plugin_id, MANIFEST_FILE).await {
            Ok(bytes) => bytes,
            Err(EngineError::NotFound(_)) => {
                tracing::debug!(plugin_id, "No manifest on disk, using the registered one");
                return Ok(registered);
            }
            Err(e) => return Err(e),
        };

        let json = String::from_utf8(bytes)
            .map_err(|e| EngineError::ManifestParse(format!("{} is not UTF-8: {}", MANIFEST_FILE, e)))?;
        Ok(Manifest::from_json(&json)?)
    }

    async fn hot_reload_enabled(&self, plugin_id: &str) -> bool {
        self.loader
            .registry()
            .manifest(plugin_id)
            .await
            .is_some_and(|m| m.config.hot_reload)
    }

    /// Every registered, non-unloaded plugin with dependencies first
    async fn reload_order(&self) -> Vec<String> {
        let registry = self.loader.registry();
        let mut ids = Vec::new();
        for instance in registry.list().await {
            if instance.state != PluginState::Unloaded {
                ids.push(instance.id);
            }
        }

        let installed = registry.installed_manifests().await;
        let targets: Vec<&str> = ids.iter().map(String::as_str).collect();
        match self.resolver.resolve(&targets, &installed, &Catalog::new()) {
            Ok(resolution) => resolution
                .order
                .into_iter()
                .filter(|id| ids.contains(id))
                .collect(),
            Err(e) => {
                tracing::warn!("Falling back to registration order: {}", e);
                ids
            }
        }
    }

    fn record(&self, result: ReloadResult) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(result);
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoaderConfig;
    use crate::registry::PluginRegistry;
    use crate::storage::LocalFileStore;
    use async_trait::async_trait;
    use sdk::plugin::{Plugin, PluginFactory};
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Counter {
        manifest: Manifest,
        value: AtomicU64,
    }

    #[async_trait]
    impl Plugin for Counter {
        fn manifest(&self) -> &Manifest {
            &self.manifest
        }

        async fn export_state(&self) -> Option<serde_json::Value> {
            Some(json!(self.value.load(Ordering::SeqCst)))
        }

        async fn import_state(&self, state: serde_json::Value) -> Result<(), EngineError> {
            self.value.store(state.as_u64().unwrap_or(0), Ordering::SeqCst);
            Ok(())
        }
    }

    fn setup(dir: &std::path::Path) -> (Arc<PluginLoader>, HotReloadManager) {
        let factory: Arc<dyn PluginFactory> = Arc::new(|m: &Manifest| -> Result<Arc<dyn Plugin>, EngineError> {
            Ok(Arc::new(Counter {
                manifest: m.clone(),
                value: AtomicU64::new(0),
            }))
        });
        let loader = Arc::new(PluginLoader::new(
            Arc::new(PluginRegistry::new()),
            factory,
            LoaderConfig::default(),
        ));
        let files = Arc::new(LocalFileStore::new(dir));
        let manager = HotReloadManager::new(loader.clone(), files, HotReloadConfig::default());
        (loader, manager)
    }

    #[tokio::test]
    async fn test_reload_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let (loader, manager) = setup(dir.path());
        loader.load(Manifest::new("counter", "1.0.0"), None).await.unwrap();

        let result = manager.reload_plugin("counter", true).await.unwrap();
        assert!(result.success);
        assert!(result.state_restored);
        assert_eq!(loader.registry().state("counter").await, Some(PluginState::Started));
        assert_eq!(manager.history().len(), 1);
    }

    #[tokio::test]
    async fn test_reload_unknown_plugin_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (_, manager) = setup(dir.path());

        let result = manager.reload_plugin("ghost", false).await.unwrap();
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_reload_picks_up_manifest_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (loader, manager) = setup(dir.path());
        loader.load(Manifest::new("counter", "1.0.0"), None).await.unwrap();

        let updated = Manifest::new("counter", "1.1.0");
        let files = LocalFileStore::new(dir.path());
        files
            .write_file("counter", MANIFEST_FILE, updated.to_json().unwrap().as_bytes())
            .await
            .unwrap();

        let result = manager.reload_plugin("counter", false).await.unwrap();
        assert!(result.success);
        assert!(!result.state_restored);
        assert_eq!(loader.registry().manifest("counter").await.unwrap().version, "1.1.0");
    }

    #[tokio::test]
    async fn test_invalid_manifest_on_disk_ends_in_error() {
        let dir = tempfile::tempdir().unwrap();
        let (loader, manager) = setup(dir.path());
        loader.load(Manifest::new("counter", "1.0.0"), None).await.unwrap();

        let mut broken = Manifest::new("counter", "not-a-version");
        broken.platforms.clear();
        let files = LocalFileStore::new(dir.path());
        files
            .write_file("counter", MANIFEST_FILE, broken.to_json().unwrap().as_bytes())
            .await
            .unwrap();

        let result = manager.reload_plugin("counter", true).await.unwrap();
        assert!(!result.success);
        assert_eq!(loader.registry().state("counter").await, Some(PluginState::Error));
    }
}
