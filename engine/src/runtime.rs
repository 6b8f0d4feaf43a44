//! Runtime composition root
//!
//! Builds every service from a [`Config`]. Each config section goes to the
//! component that owns it, and all components share one event bus and one
//! registry.

use crate::config::Config;
use crate::downloader::fetch::ReqwestFetcher;
use crate::downloader::DownloadManager;
use crate::host::PluginHost;
use crate::hot_reload::HotReloadManager;
use crate::loader::PluginLoader;
use crate::message_bus::messenger::Messenger;
use crate::message_bus::EventBus;
use crate::registry::PluginRegistry;
use crate::security::SecurityValidator;
use crate::signature::SignatureService;
use crate::storage::{FileStore, LocalFileStore};
use sdk::errors::EngineError;
use sdk::plugin::PluginFactory;
use std::sync::Arc;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Every runtime service, wired together
pub struct Runtime {
    pub events: Arc<EventBus>,
    pub registry: Arc<PluginRegistry>,
    pub loader: Arc<PluginLoader>,
    pub validator: Arc<SecurityValidator>,
    pub downloads: Arc<DownloadManager>,
    pub host: Arc<PluginHost>,
    pub hot_reload: Arc<HotReloadManager>,
    pub messenger: Arc<Messenger>,
}

impl Runtime {
    /// Build the runtime; plugins are stored under `config.plugins_dir()`
    ///
    /// # Errors
    ///
    /// `Config` if the security section holds malformed keys or patterns,
    /// `Network` if the HTTP client cannot be built.
    pub fn from_config(config: &Config, factory: Arc<dyn PluginFactory>) -> Result<Self, EngineError> {
        let events = Arc::new(EventBus::with_buffer(config.messaging.subscriber_buffer));
        let registry = Arc::new(PluginRegistry::new());
        let loader = Arc::new(
            PluginLoader::new(registry.clone(), factory, config.loader.clone()).with_events(events.clone()),
        );

        let signatures = Arc::new(SignatureService::new(&config.security)?);
        let validator = Arc::new(SecurityValidator::new(config.security.clone(), signatures)?);

        let fetcher = Arc::new(ReqwestFetcher::new(CONNECT_TIMEOUT)?);
        let downloads =
            Arc::new(DownloadManager::new(config.download.clone(), fetcher).with_validator(validator.clone()));

        let files: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(config.plugins_dir()));
        let host = Arc::new(PluginHost::new(
            loader.clone(),
            validator.clone(),
            downloads.clone(),
            files.clone(),
        ));
        let hot_reload = Arc::new(
            HotReloadManager::new(loader.clone(), files, config.hot_reload.clone()).with_events(events.clone()),
        );
        let messenger = Arc::new(Messenger::new(registry.clone(), &config.messaging));

        tracing::debug!(
            plugins_dir = %config.plugins_dir().display(),
            policy = ?config.security.policy,
            "Runtime assembled"
        );

        Ok(Self {
            events,
            registry,
            loader,
            validator,
            downloads,
            host,
            hot_reload,
            messenger,
        })
    }
}
