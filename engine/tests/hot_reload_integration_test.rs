//! Integration tests for hot reload
//!
//! Covers the process-wide reload gate, dependency-ordered reload_all,
//! debounced watch notifications and state carried across reloads.

use async_trait::async_trait;
use plexus_engine::config::{HotReloadConfig, LoaderConfig};
use plexus_engine::hot_reload::{HotReloadManager, WatchEvent};
use plexus_engine::loader::PluginLoader;
use plexus_engine::message_bus::{events, EventBus, EventFilter};
use plexus_engine::registry::PluginRegistry;
use plexus_engine::storage::{FileStore, LocalFileStore, MANIFEST_FILE};
use sdk::errors::EngineError;
use sdk::manifest::{Dependency, Manifest};
use sdk::plugin::{Plugin, PluginFactory};
use sdk::types::PluginState;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, Notify};

struct Stateful {
    manifest: Manifest,
    counter: AtomicU64,
    stop_entered: Option<Arc<Notify>>,
    stop_release: Option<Arc<Notify>>,
}

#[async_trait]
impl Plugin for Stateful {
    fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    async fn stop(&self) -> Result<(), EngineError> {
        if let (Some(entered), Some(release)) = (&self.stop_entered, &self.stop_release) {
            entered.notify_one();
            release.notified().await;
        }
        Ok(())
    }

    async fn export_state(&self) -> Option<serde_json::Value> {
        Some(json!({ "counter": self.counter.load(Ordering::SeqCst) }))
    }

    async fn import_state(&self, state: serde_json::Value) -> Result<(), EngineError> {
        let counter = state["counter"].as_u64().unwrap_or(0);
        self.counter.store(counter + 1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    loader: Arc<PluginLoader>,
    manager: Arc<HotReloadManager>,
    entered: Arc<Notify>,
    release: Arc<Notify>,
    dir: TempDir,
}

fn harness(config: HotReloadConfig, bus: Option<Arc<EventBus>>) -> Harness {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let (e, r) = (entered.clone(), release.clone());

    let factory: Arc<dyn PluginFactory> = Arc::new(move |m: &Manifest| -> Result<Arc<dyn Plugin>, EngineError> {
        let blocking = m.id == "blocking";
        Ok(Arc::new(Stateful {
            manifest: m.clone(),
            counter: AtomicU64::new(0),
            stop_entered: blocking.then(|| e.clone()),
            stop_release: blocking.then(|| r.clone()),
        }))
    });

    let dir = TempDir::new().unwrap();
    let loader = Arc::new(PluginLoader::new(
        Arc::new(PluginRegistry::new()),
        factory,
        LoaderConfig::default(),
    ));
    let mut manager = HotReloadManager::new(loader.clone(), Arc::new(LocalFileStore::new(dir.path())), config);
    if let Some(bus) = bus {
        manager = manager.with_events(bus);
    }

    Harness {
        loader,
        manager: Arc::new(manager),
        entered,
        release,
        dir,
    }
}

fn hot(id: &str) -> Manifest {
    let mut manifest = Manifest::new(id, "1.0.0");
    manifest.config.hot_reload = true;
    manifest
}

#[tokio::test]
async fn test_concurrent_reload_rejected() {
    let h = harness(HotReloadConfig::default(), None);
    h.loader.load(Manifest::new("blocking", "1.0.0"), None).await.unwrap();

    let manager = h.manager.clone();
    let first = tokio::spawn(async move { manager.reload_plugin("blocking", false).await });
    h.entered.notified().await;

    let err = h.manager.reload_plugin("blocking", false).await.unwrap_err();
    assert!(matches!(err, EngineError::ReloadInProgress));
    assert!(matches!(h.manager.reload_all().await, Err(EngineError::ReloadInProgress)));

    h.release.notify_one();
    let result = first.await.unwrap().unwrap();
    assert!(result.success, "{:?}", result.error);
    assert_eq!(h.loader.registry().state("blocking").await, Some(PluginState::Started));
}

#[tokio::test]
async fn test_reload_all_goes_dependencies_first() {
    let h = harness(HotReloadConfig::default(), None);
    h.loader
        .load(
            Manifest::new("ui", "1.0.0").with_dependency(Dependency::required("base", "*")),
            None,
        )
        .await
        .unwrap();
    h.loader.load(Manifest::new("base", "1.0.0"), None).await.unwrap();

    let results = h.manager.reload_all().await.unwrap();
    let ids: Vec<&str> = results.iter().map(|r| r.plugin_id.as_str()).collect();
    assert_eq!(ids, vec!["base", "ui"]);
    assert!(results.iter().all(|r| r.success && r.state_restored));
}

#[tokio::test]
async fn test_reload_from_paused_ends_started() {
    let h = harness(HotReloadConfig::default(), None);
    h.loader.load(Manifest::new("demo", "1.0.0"), None).await.unwrap();
    h.loader.pause("demo").await.unwrap();

    let result = h.manager.reload_plugin("demo", true).await.unwrap();
    assert!(result.success);
    assert_eq!(h.loader.registry().state("demo").await, Some(PluginState::Started));
}

#[tokio::test]
async fn test_watch_debounces_and_respects_manifest_flag() {
    let bus = Arc::new(EventBus::new());
    let mut reloaded = bus.subscribe(EventFilter::event_type(events::PLUGIN_RELOADED)).await;

    let config = HotReloadConfig {
        debounce_ms: 20,
        ..HotReloadConfig::default()
    };
    let h = harness(config, Some(bus));
    h.loader.load(hot("watched"), None).await.unwrap();
    h.loader.load(Manifest::new("frozen", "1.0.0"), None).await.unwrap();

    let (tx, rx) = mpsc::channel(16);
    for _ in 0..3 {
        tx.send(WatchEvent::new("watched")).await.unwrap();
    }
    tx.send(WatchEvent::new("frozen")).await.unwrap();
    drop(tx);

    tokio::time::timeout(Duration::from_secs(5), h.manager.watch(rx))
        .await
        .unwrap();

    let history = h.manager.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].plugin_id, "watched");

    let event = reloaded.receiver.try_recv().unwrap();
    assert_eq!(event.data["pluginId"], "watched");
    assert!(reloaded.receiver.try_recv().is_err());
}

#[tokio::test]
async fn test_history_is_bounded() {
    let config = HotReloadConfig {
        history_limit: 2,
        ..HotReloadConfig::default()
    };
    let h = harness(config, None);
    h.loader.load(Manifest::new("demo", "1.0.0"), None).await.unwrap();

    for _ in 0..4 {
        h.manager.reload_plugin("demo", false).await.unwrap();
    }
    assert_eq!(h.manager.history().len(), 2);
}

#[tokio::test]
async fn test_corrupt_manifest_on_disk_fails_reload() {
    let h = harness(HotReloadConfig::default(), None);
    h.loader.load(Manifest::new("alpha", "1.0.0"), None).await.unwrap();

    let files = LocalFileStore::new(h.dir.path());
    files.write_file("alpha", MANIFEST_FILE, b"{ this is not json").await.unwrap();

    let result = h.manager.reload_plugin("alpha", false).await.unwrap();
    assert!(!result.success);
    assert!(result.error.is_some());
    assert_eq!(h.loader.registry().state("alpha").await, Some(PluginState::Error));
}

#[tokio::test]
async fn test_non_utf8_manifest_on_disk_fails_reload() {
    let h = harness(HotReloadConfig::default(), None);
    h.loader.load(Manifest::new("alpha", "1.0.0"), None).await.unwrap();

    let files = LocalFileStore::new(h.dir.path());
    files.write_file("alpha", MANIFEST_FILE, &[0xff, 0xfe, 0x00]).await.unwrap();

    let result = h.manager.reload_plugin("alpha", true).await.unwrap();
    assert!(!result.success);
    assert!(result.error.unwrap().contains("UTF-8"));
    assert_eq!(h.loader.registry().state("alpha").await, Some(PluginState::Error));
}

#[tokio::test]
async fn test_missing_manifest_uses_registered_one() {
    let h = harness(HotReloadConfig::default(), None);
    h.loader.load(Manifest::new("alpha", "1.0.0"), None).await.unwrap();

    let result = h.manager.reload_plugin("alpha", false).await.unwrap();
    assert!(result.success, "{:?}", result.error);
    assert_eq!(h.loader.registry().state("alpha").await, Some(PluginState::Started));
}
