//! Plugin host facade
//!
//! Composes the runtime services into the install and activation pipelines.
//! Each pipeline is a chain of fallible stages that stops at the first
//! failure:
//!
//! ```text
//! install:   validate -> parse -> resolve -> persist
//! download:  fetch -> verify -> install
//! activate:  resolve -> load each dependency -> load target
//! uninstall: check dependents -> unload -> delete -> unregister
//! ```
//!
//! Installed manifests are kept in memory alongside the registry; an
//! installed plugin only enters the registry once it is activated.

use crate::downloader::{DownloadManager, DownloadRequest};
use crate::loader::PluginLoader;
use crate::package::PluginPackage;
use crate::resolver::{Catalog, DependencyResolver};
use crate::security::{SecurityValidationResult, SecurityValidator};
use crate::storage::{FileStore, InstallRecord, InstallStore, MANIFEST_FILE};
use chrono::Utc;
use sdk::errors::EngineError;
use sdk::manifest::Manifest;
use sdk::types::PluginState;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Result of a successful install
#[derive(Debug, Clone)]
pub struct InstallReport {
    pub record: InstallRecord,
    pub security: SecurityValidationResult,
}

pub struct PluginHost {
    loader: Arc<PluginLoader>,
    validator: Arc<SecurityValidator>,
    downloads: Arc<DownloadManager>,
    files: Arc<dyn FileStore>,
    records: InstallStore,
    resolver: DependencyResolver,
    installed: RwLock<Catalog>,
}

impl PluginHost {
    pub fn new(
        loader: Arc<PluginLoader>,
        validator: Arc<SecurityValidator>,
        downloads: Arc<DownloadManager>,
        files: Arc<dyn FileStore>,
    ) -> Self {
        Self {
            loader,
            validator,
            downloads,
            records: InstallStore::new(files.clone()),
            files,
            resolver: DependencyResolver::new(),
            installed: RwLock::new(Catalog::new()),
        }
    }

    pub fn loader(&self) -> &Arc<PluginLoader> {
        &self.loader
    }

    pub fn downloads(&self) -> &Arc<DownloadManager> {
        &self.downloads
    }

    /// Manifests of every installed plugin
    pub async fn installed(&self) -> Catalog {
        self.installed.read().await.clone()
    }

    /// Validate, resolve and persist a package
    ///
    /// # Errors
    ///
    /// - `SecurityBlocked` if the security policy rejects the package
    /// - `StructuralValidation` for an invalid manifest
    /// - `DependencyMissing`, `DependencyConflict` or `DependencyCycle`
    /// - `LifecycleState` if an active version of the plugin is running
    /// - `Storage` if persisting fails; the previous install, if any, is left in place
    pub async fn install_package(&self, bytes: &[u8], source_url: Option<&str>) -> Result<InstallReport, EngineError> {
        let security = self.validator.validate(bytes, source_url)?;
        security.ensure_allowed()?;

        let package = PluginPackage::parse(bytes)?;
        let manifest = package.manifest.clone();
        let id = manifest.id.clone();
        self.loader.validate_manifest(&manifest)?;

        if let Some(state) = self.loader.registry().state(&id).await {
            if state.is_active() {
                return Err(EngineError::lifecycle(&id, state, "reinstall"));
            }
        }

        let mut installed = self.installed().await;
        installed.remove(&id);
        if let Some(path) = self
            .resolver
            .self_dependency_path(&manifest, &installed, &Catalog::new())
        {
            return Err(EngineError::DependencyCycle { cycles: vec![path] });
        }
        let available = Catalog::from([(id.clone(), manifest.clone())]);
        self.resolver.resolve(&[id.as_str()], &installed, &available)?;

        let backup = backup_name(&id);
        self.files.delete_dir(&backup).await?;
        let replacing = self.files.rename_dir(&id, &backup).await?;

        let record = match self.persist(&package).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(plugin_id = %id, "Install failed, rolling back: {}", e);
                self.roll_back(&id, replacing).await;
                return Err(e);
            }
        };
        if replacing {
            if let Err(e) = self.files.delete_dir(&backup).await {
                tracing::warn!(plugin_id = %id, "Failed to remove previous install: {}", e);
            }
        }

        self.installed.write().await.insert(id.clone(), manifest);
        tracing::info!(plugin_id = %id, version = %record.version, level = ?security.level, "Plugin installed");

        Ok(InstallReport { record, security })
    }

    /// Drop a partial install and put the previous one back, if any
    async fn roll_back(&self, id: &str, restore_previous: bool) {
        if let Err(e) = self.files.delete_dir(id).await {
            tracing::warn!(plugin_id = %id, "Rollback cleanup failed: {}", e);
            return;
        }
        if restore_previous {
            if let Err(e) = self.files.rename_dir(&backup_name(id), id).await {
                tracing::error!(plugin_id = %id, "Failed to restore previous install: {}", e);
            }
        }
    }

    async fn persist(&self, package: &PluginPackage) -> Result<InstallRecord, EngineError> {
        let manifest = &package.manifest;
        let id = manifest.id.as_str();

        self.files.create_dir(id).await?;
        for (path, contents) in &package.files {
            self.files.write_file(id, path, contents.as_bytes()).await?;
        }
        let manifest_json = manifest.to_json()?;
        self.files.write_file(id, MANIFEST_FILE, manifest_json.as_bytes()).await?;

        let now = Utc::now();
        let record = InstallRecord {
            id: id.to_string(),
            version: manifest.version.clone(),
            state: PluginState::Unloaded,
            permissions: manifest.permissions.clone(),
            dependencies: manifest.dependency_ids().map(str::to_string).collect(),
            size: self.files.dir_size(id).await?,
            auto_update: manifest.config.auto_update,
            installed_at: now,
            last_used_at: now,
        };
        self.records.save(&record).await?;
        Ok(record)
    }

    /// Download a package and install it
    pub async fn install_from_url(&self, request: DownloadRequest) -> Result<InstallReport, EngineError> {
        let url = request.url.clone();
        let task = self.downloads.start(request).await?;
        let bytes = tokio::fs::read(&task.destination).await?;
        self.install_package(&bytes, Some(&url)).await
    }

    /// Load an installed plugin, loading its dependencies first
    ///
    /// Returns the ids that were loaded by this call, in load order.
    pub async fn activate(&self, plugin_id: &str) -> Result<Vec<String>, EngineError> {
        let installed = self.installed().await;
        if !installed.contains_key(plugin_id) {
            return Err(EngineError::NotFound(format!("installed plugin {}", plugin_id)));
        }

        let resolution = self
            .resolver
            .resolve(&[plugin_id], &installed, &Catalog::new())?;
        let registry = self.loader.registry();

        let mut loaded = Vec::new();
        for id in &resolution.order {
            if registry.state(id).await.is_some_and(|s| s.is_active()) {
                continue;
            }
            let Some(manifest) = installed.get(id) else {
                continue;
            };

            self.loader.load(manifest.clone(), None).await?;
            let size = self.files.dir_size(id).await.unwrap_or(0);
            registry.set_size(id, size).await;
            self.update_record(id, PluginState::Started).await;
            loaded.push(id.clone());
        }

        Ok(loaded)
    }

    /// Unload a running plugin, keeping it installed
    pub async fn deactivate(&self, plugin_id: &str, force: bool) -> Result<(), EngineError> {
        self.loader.unload(plugin_id, force).await?;
        self.update_record(plugin_id, PluginState::Unloaded).await;
        Ok(())
    }

    /// Remove a plugin from the registry and from disk
    ///
    /// # Errors
    ///
    /// `DependentsActive` if any active plugin depends on it.
    pub async fn uninstall(&self, plugin_id: &str) -> Result<(), EngineError> {
        let registry = self.loader.registry();

        let dependents = registry.active_dependents_of(plugin_id).await;
        if !dependents.is_empty() {
            return Err(EngineError::DependentsActive {
                plugin_id: plugin_id.to_string(),
                dependents,
            });
        }

        let registered = registry.state(plugin_id).await;
        let known = self.installed.read().await.contains_key(plugin_id);
        if registered.is_none() && !known {
            return Err(EngineError::NotFound(format!("installed plugin {}", plugin_id)));
        }

        if registered.is_some_and(|s| s != PluginState::Unloaded) {
            self.loader.unload(plugin_id, false).await?;
        }

        self.files.delete_dir(plugin_id).await?;
        if registered.is_some() {
            registry.unregister(plugin_id).await?;
        }
        self.installed.write().await.remove(plugin_id);

        tracing::info!(plugin_id, "Plugin uninstalled");
        Ok(())
    }

    /// Rebuild the installed set from disk and reactivate plugins that were running
    ///
    /// Returns the ids that were reactivated. Plugins that fail to come back
    /// are logged and skipped.
    pub async fn restore(&self) -> Result<Vec<String>, EngineError> {
        let to_activate: Vec<String> = self
            .load_installed()
            .await?
            .into_iter()
            .filter(|record| record.state.is_active())
            .map(|record| record.id)
            .collect();

        let mut restored = Vec::new();
        for id in to_activate {
            match self.activate(&id).await {
                Ok(_) => restored.push(id),
                Err(e) => tracing::warn!(plugin_id = %id, "Failed to reactivate plugin: {}", e),
            }
        }
        Ok(restored)
    }

    /// Rebuild the installed set from disk without activating anything
    ///
    /// Returns the records whose manifests could be read.
    pub async fn load_installed(&self) -> Result<Vec<InstallRecord>, EngineError> {
        let records = self.records.load_all().await?;

        let mut readable = Vec::with_capacity(records.len());
        let mut installed = self.installed.write().await;
        for record in records {
            match self.read_manifest(&record.id).await {
                Ok(manifest) => {
                    installed.insert(record.id.clone(), manifest);
                    readable.push(record);
                }
                Err(e) => tracing::warn!(plugin_id = %record.id, "Skipping unreadable plugin: {}", e),
            }
        }
        tracing::info!(installed = readable.len(), "Install records restored");
        Ok(readable)
    }

    async fn read_manifest(&self, plugin_id: &str) -> Result<Manifest, EngineError> {
        let bytes = self.files.read_file(plugin_id, MANIFEST_FILE).await?;
        let json = String::from_utf8(bytes).map_err(|e| EngineError::ManifestParse(e.to_string()))?;
        Ok(Manifest::from_json(&json)?)
    }

    async fn update_record(&self, plugin_id: &str, state: PluginState) {
        if let Err(e) = self.records.set_state(plugin_id, state).await {
            tracing::warn!(plugin_id, "Failed to update install record: {}", e);
        }
    }
}

/// Directory the current install is moved to while a reinstall is written
fn backup_name(plugin_id: &str) -> String {
    format!(".{}.previous", plugin_id)
}
