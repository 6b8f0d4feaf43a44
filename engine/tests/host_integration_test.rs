//! Integration tests for the host install and activation pipelines

use plexus_engine::config::{DownloadConfig, LoaderConfig, SecurityConfig, SecurityPolicy};
use plexus_engine::downloader::fetch::ReqwestFetcher;
use plexus_engine::downloader::{DownloadManager, DownloadRequest};
use plexus_engine::host::PluginHost;
use plexus_engine::loader::PluginLoader;
use plexus_engine::package::PluginPackage;
use plexus_engine::registry::PluginRegistry;
use plexus_engine::security::SecurityValidator;
use plexus_engine::signature::digest::sha256_hex;
use plexus_engine::signature::SignatureService;
use plexus_engine::storage::{FileStore, InstallStore, LocalFileStore, RECORD_FILE};
use sdk::errors::EngineError;
use sdk::manifest::{Dependency, Manifest};
use sdk::plugin::{Plugin, PluginFactory};
use sdk::types::PluginState;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

struct Plain(Manifest);

impl Plugin for Plain {
    fn manifest(&self) -> &Manifest {
        &self.0
    }
}

/// Local store whose install-record writes fail once armed
struct FlakyStore {
    inner: LocalFileStore,
    fail_records: AtomicBool,
}

#[async_trait]
impl FileStore for FlakyStore {
    fn plugin_dir(&self, plugin_id: &str) -> PathBuf {
        self.inner.plugin_dir(plugin_id)
    }

    async fn create_dir(&self, plugin_id: &str) -> Result<(), EngineError> {
        self.inner.create_dir(plugin_id).await
    }

    async fn delete_dir(&self, plugin_id: &str) -> Result<(), EngineError> {
        self.inner.delete_dir(plugin_id).await
    }

    async fn rename_dir(&self, from: &str, to: &str) -> Result<bool, EngineError> {
        self.inner.rename_dir(from, to).await
    }

    async fn write_file(&self, plugin_id: &str, relative: &str, contents: &[u8]) -> Result<(), EngineError> {
        if relative == RECORD_FILE && self.fail_records.load(Ordering::SeqCst) {
            return Err(EngineError::Storage("disk full".into()));
        }
        self.inner.write_file(plugin_id, relative, contents).await
    }

    async fn read_file(&self, plugin_id: &str, relative: &str) -> Result<Vec<u8>, EngineError> {
        self.inner.read_file(plugin_id, relative).await
    }

    async fn dir_size(&self, plugin_id: &str) -> Result<u64, EngineError> {
        self.inner.dir_size(plugin_id).await
    }

    async fn list_plugins(&self) -> Result<Vec<String>, EngineError> {
        self.inner.list_plugins().await
    }

    async fn validate_dir(&self, plugin_id: &str) -> Result<bool, EngineError> {
        self.inner.validate_dir(plugin_id).await
    }
}

fn build_host(root: &Path, policy: SecurityPolicy) -> PluginHost {
    build_host_with(Arc::new(LocalFileStore::new(root)), policy)
}

fn build_host_with(files: Arc<dyn FileStore>, policy: SecurityPolicy) -> PluginHost {
    let factory: Arc<dyn PluginFactory> = Arc::new(|m: &Manifest| -> Result<Arc<dyn Plugin>, EngineError> {
        Ok(Arc::new(Plain(m.clone())))
    });
    let loader = Arc::new(PluginLoader::new(
        Arc::new(PluginRegistry::new()),
        factory,
        LoaderConfig::default(),
    ));

    let security = SecurityConfig {
        policy,
        ..SecurityConfig::default()
    };
    let signatures = Arc::new(SignatureService::with_keys(vec![], vec![]));
    let validator = Arc::new(SecurityValidator::new(security, signatures).unwrap());

    let fetcher = ReqwestFetcher::new(Duration::from_secs(5)).unwrap();
    let downloads = Arc::new(DownloadManager::new(DownloadConfig::default(), Arc::new(fetcher)));

    PluginHost::new(loader, validator, downloads, files)
}

fn package(manifest: Manifest) -> Vec<u8> {
    PluginPackage::new(manifest)
        .with_file("index.js", "export default { start() {} }")
        .to_bytes()
        .unwrap()
}

fn app() -> Manifest {
    Manifest::new("app", "1.0.0").with_dependency(Dependency::required("base", "^1.0"))
}

#[tokio::test]
async fn test_install_activate_uninstall() {
    let dir = TempDir::new().unwrap();
    let host = build_host(dir.path(), SecurityPolicy::Relaxed);

    host.install_package(&package(Manifest::new("base", "1.2.0")), None)
        .await
        .unwrap();
    let report = host.install_package(&package(app()), None).await.unwrap();
    assert_eq!(report.record.dependencies, vec!["base"]);
    assert!(report.record.size > 0);
    assert!(dir.path().join("app").join("index.js").exists());

    let loaded = host.activate("app").await.unwrap();
    assert_eq!(loaded, vec!["base", "app"]);

    let registry = host.loader().registry();
    assert_eq!(registry.state("app").await, Some(PluginState::Started));

    let err = host.uninstall("base").await.unwrap_err();
    assert!(matches!(err, EngineError::DependentsActive { .. }));

    host.deactivate("app", false).await.unwrap();
    host.uninstall("base").await.unwrap();
    assert!(!dir.path().join("base").exists());
    assert!(!registry.contains("base").await);
    assert!(!host.installed().await.contains_key("base"));
}

#[tokio::test]
async fn test_install_with_missing_dependency_fails() {
    let dir = TempDir::new().unwrap();
    let host = build_host(dir.path(), SecurityPolicy::Relaxed);

    let err = host.install_package(&package(app()), None).await.unwrap_err();
    assert!(matches!(err, EngineError::DependencyMissing { .. }));
    assert!(!dir.path().join("app").exists());
}

#[tokio::test]
async fn test_blocked_package_never_reaches_disk() {
    let dir = TempDir::new().unwrap();
    let host = build_host(dir.path(), SecurityPolicy::Relaxed);

    let bytes = PluginPackage::new(Manifest::new("miner", "1.0.0"))
        .with_file("index.js", "connect('stratum+tcp://pool.example:3333')")
        .to_bytes()
        .unwrap();

    let err = host.install_package(&bytes, None).await.unwrap_err();
    assert!(matches!(err, EngineError::SecurityBlocked { .. }));
    assert!(!dir.path().join("miner").exists());
}

#[tokio::test]
async fn test_restore_reactivates_running_plugins() {
    let dir = TempDir::new().unwrap();
    {
        let host = build_host(dir.path(), SecurityPolicy::Relaxed);
        host.install_package(&package(Manifest::new("base", "1.0.0")), None)
            .await
            .unwrap();
        host.install_package(&package(app()), None).await.unwrap();
        host.install_package(&package(Manifest::new("idle", "1.0.0")), None)
            .await
            .unwrap();
        host.activate("app").await.unwrap();
    }

    let host = build_host(dir.path(), SecurityPolicy::Relaxed);
    let mut restored = host.restore().await.unwrap();
    restored.sort();
    assert_eq!(restored, vec!["app", "base"]);
    assert_eq!(host.installed().await.len(), 3);
    assert_eq!(host.loader().registry().state("idle").await, None);

    let records = InstallStore::new(Arc::new(LocalFileStore::new(dir.path())));
    assert_eq!(records.load("idle").await.unwrap().state, PluginState::Unloaded);
}

#[tokio::test]
async fn test_install_from_url() {
    let server = MockServer::start().await;
    let bytes = package(Manifest::new("remote", "2.0.0"));
    Mock::given(method("GET"))
        .and(path("/remote.json"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes.clone()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let downloads = TempDir::new().unwrap();
    let host = build_host(dir.path(), SecurityPolicy::Relaxed);

    let report = host
        .install_from_url(DownloadRequest {
            id: "remote".to_string(),
            url: format!("{}/remote.json", server.uri()),
            checksum: format!("sha256:{}", sha256_hex(&bytes)),
            destination: downloads.path().join("remote.json"),
        })
        .await
        .unwrap();

    assert_eq!(report.record.version, "2.0.0");
    let files = LocalFileStore::new(dir.path());
    assert!(files.validate_dir("remote").await.unwrap());
}

#[tokio::test]
async fn test_failed_reinstall_keeps_previous_install() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FlakyStore {
        inner: LocalFileStore::new(dir.path()),
        fail_records: AtomicBool::new(false),
    });
    let host = build_host_with(store.clone(), SecurityPolicy::Relaxed);

    host.install_package(&package(Manifest::new("base", "1.0.0")), None)
        .await
        .unwrap();

    store.fail_records.store(true, Ordering::SeqCst);
    let upgrade = PluginPackage::new(Manifest::new("base", "2.0.0"))
        .with_file("extra.js", "export {}")
        .to_bytes()
        .unwrap();
    let err = host.install_package(&upgrade, None).await.unwrap_err();
    assert!(matches!(err, EngineError::Storage(_)));
    store.fail_records.store(false, Ordering::SeqCst);

    assert!(dir.path().join("base").join("index.js").exists());
    assert!(!dir.path().join("base").join("extra.js").exists());
    assert!(!dir.path().join(".base.previous").exists());
    assert_eq!(host.installed().await["base"].version, "1.0.0");

    let records = InstallStore::new(store.clone());
    assert_eq!(records.load("base").await.unwrap().version, "1.0.0");

    let fresh = build_host(dir.path(), SecurityPolicy::Relaxed);
    fresh.restore().await.unwrap();
    assert_eq!(fresh.installed().await["base"].version, "1.0.0");
    assert_eq!(fresh.activate("base").await.unwrap(), vec!["base"]);
}

#[tokio::test]
async fn test_successful_reinstall_replaces_files() {
    let dir = TempDir::new().unwrap();
    let host = build_host(dir.path(), SecurityPolicy::Relaxed);

    host.install_package(&package(Manifest::new("base", "1.0.0")), None)
        .await
        .unwrap();
    let upgrade = PluginPackage::new(Manifest::new("base", "2.0.0"))
        .with_file("extra.js", "export {}")
        .to_bytes()
        .unwrap();
    let report = host.install_package(&upgrade, None).await.unwrap();

    assert_eq!(report.record.version, "2.0.0");
    assert!(dir.path().join("base").join("extra.js").exists());
    assert!(!dir.path().join("base").join("index.js").exists());
    assert!(!dir.path().join(".base.previous").exists());
}
