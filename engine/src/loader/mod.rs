//! Plugin loader
//!
//! Drives the lifecycle state machine.
//!
//! ```text
//! unloaded -> loaded -> initialized -> started <-> paused
//! started | paused -> stopped -> unloaded
//! any -> error (recoverable only by a fresh load)
//! ```
//!
//! Every transition for a given plugin id is serialized behind a per-id
//! lock; different ids transition concurrently. Concurrent `load` calls for
//! the same id share one in-flight load and all observe its result.
//!
//! A load runs structural validation, then registration, permission
//! consent, `initialize` and `start`, raced against the load timeout. A
//! failure or timeout leaves the plugin in `error`, never half-loaded.

use crate::config::LoaderConfig;
use crate::message_bus::{catch_panic, emit, events, EventBus};
use crate::registry::PluginRegistry;
use crate::resolver::{Catalog, DependencyResolver};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use sdk::errors::EngineError;
use sdk::manifest::{Manifest, Permission};
use sdk::plugin::{Plugin, PluginContext, PluginFactory};
use sdk::types::PluginState;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Async permission prompt: `(plugin_id, permission, reason) -> granted`
pub type ConsentCallback =
    Arc<dyn Fn(String, Permission, String) -> BoxFuture<'static, bool> + Send + Sync>;

type SharedLoad = Shared<BoxFuture<'static, Result<(), EngineError>>>;

const SOURCE: &str = "loader";

pub struct PluginLoader {
    registry: Arc<PluginRegistry>,
    factory: Arc<dyn PluginFactory>,
    config: LoaderConfig,
    resolver: DependencyResolver,
    consent: Option<ConsentCallback>,
    events: Option<Arc<EventBus>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    in_flight: Mutex<HashMap<String, SharedLoad>>,
}

impl PluginLoader {
    pub fn new(registry: Arc<PluginRegistry>, factory: Arc<dyn PluginFactory>, config: LoaderConfig) -> Self {
        Self {
            registry,
            factory,
            config,
            resolver: DependencyResolver::new(),
            consent: None,
            events: None,
            locks: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Ask the user before granting declared permissions
    ///
    /// Without a callback every recognised permission is granted.
    pub fn with_consent(mut self, consent: ConsentCallback) -> Self {
        self.consent = Some(consent);
        self
    }

    /// Publish lifecycle events on `bus`
    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.config.load_timeout_ms)
    }

    /// Load a plugin through to `started`
    ///
    /// # Errors
    ///
    /// - `LifecycleState` if the plugin is registered and not `unloaded`/`error`
    /// - `StructuralValidation` listing every manifest problem
    /// - `DependencyCycle` if the manifest transitively depends on itself
    /// - `PluginFailure` if a lifecycle hook fails
    /// - `LoadTimeout` if the whole load exceeds `timeout`
    pub async fn load(self: &Arc<Self>, manifest: Manifest, timeout: Option<Duration>) -> Result<(), EngineError> {
        self.load_shared(manifest, timeout, None).await
    }

    /// Load and hand `state` to the new instance before it starts
    pub(crate) async fn load_with_state(
        self: &Arc<Self>,
        manifest: Manifest,
        state: Option<serde_json::Value>,
    ) -> Result<(), EngineError> {
        self.load_shared(manifest, None, state).await
    }

    async fn load_shared(
        self: &Arc<Self>,
        manifest: Manifest,
        timeout: Option<Duration>,
        restore: Option<serde_json::Value>,
    ) -> Result<(), EngineError> {
        let id = manifest.id.clone();

        let load = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            match in_flight.get(&id) {
                Some(existing) => {
                    tracing::debug!(plugin_id = %id, "Joining in-flight load");
                    existing.clone()
                }
                None => {
                    let this = Arc::clone(self);
                    let key = id.clone();
                    let load: SharedLoad = async move {
                        let result = this.load_inner(manifest, timeout, restore).await;
                        this.in_flight
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .remove(&key);
                        result
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(id.clone(), load.clone());
                    load
                }
            }
        };

        load.await
    }

    async fn load_inner(
        &self,
        manifest: Manifest,
        timeout: Option<Duration>,
        restore: Option<serde_json::Value>,
    ) -> Result<(), EngineError> {
        let id = manifest.id.clone();
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;

        if let Some(state) = self.registry.state(&id).await {
            if !matches!(state, PluginState::Unloaded | PluginState::Error) {
                return Err(EngineError::lifecycle(&id, state, "load"));
            }
        }

        self.validate_manifest(&manifest)?;

        let installed = self.registry.installed_manifests().await;
        if let Some(path) = self
            .resolver
            .self_dependency_path(&manifest, &installed, &Catalog::new())
        {
            return Err(EngineError::DependencyCycle { cycles: vec![path] });
        }

        let timeout = timeout.unwrap_or_else(|| self.default_timeout());
        tracing::info!(plugin_id = %id, version = %manifest.version, "Loading plugin");

        match tokio::time::timeout(timeout, self.run_load(manifest, restore)).await {
            Ok(Ok(())) => {
                tracing::info!(plugin_id = %id, "Plugin loaded and started");
                Ok(())
            }
            Ok(Err(e)) => {
                self.fail(&id, &e).await;
                Err(e)
            }
            Err(_) => {
                let err = EngineError::LoadTimeout {
                    plugin_id: id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                };
                self.fail(&id, &err).await;
                Err(err)
            }
        }
    }

    async fn run_load(&self, manifest: Manifest, restore: Option<serde_json::Value>) -> Result<(), EngineError> {
        let id = manifest.id.clone();
        let plugin = self.create_and_register(&manifest).await?;

        self.run_initialize(&id, &plugin, &manifest).await?;
        if let Some(state) = restore {
            call_hook(&id, "import_state", plugin.import_state(state)).await?;
            tracing::debug!(plugin_id = %id, "Plugin state restored");
        }
        self.run_start(&id, &plugin).await
    }

    /// Register a plugin and move it to `loaded` without initializing it
    pub async fn register(&self, manifest: Manifest) -> Result<(), EngineError> {
        let id = manifest.id.clone();
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;

        if let Some(state) = self.registry.state(&id).await {
            if !matches!(state, PluginState::Unloaded | PluginState::Error) {
                return Err(EngineError::lifecycle(&id, state, "load"));
            }
        }

        self.validate_manifest(&manifest)?;
        self.create_and_register(&manifest).await.map(|_| ())
    }

    /// Structural checks run before any registration
    pub fn validate_manifest(&self, manifest: &Manifest) -> Result<(), EngineError> {
        let problems = manifest.validate(&self.config.supported_platforms);
        if problems.is_empty() {
            return Ok(());
        }
        tracing::warn!(plugin_id = %manifest.id, ?problems, "Manifest failed structural validation");
        Err(EngineError::StructuralValidation {
            plugin_id: manifest.id.clone(),
            problems,
        })
    }

    async fn create_and_register(&self, manifest: &Manifest) -> Result<Arc<dyn Plugin>, EngineError> {
        let id = manifest.id.as_str();
        let plugin = self
            .factory
            .create(manifest)
            .map_err(|e| EngineError::plugin_failure(id, "create", e))?;

        self.registry.register(manifest.clone(), plugin.clone(), 0).await?;
        self.registry.update_state(id, PluginState::Loaded).await?;
        self.emit(events::PLUGIN_LOADED, id).await;

        let granted = self.request_permissions(manifest).await;
        self.registry.grant_permissions(id, granted).await;

        Ok(plugin)
    }

    async fn request_permissions(&self, manifest: &Manifest) -> Vec<String> {
        let mut granted = Vec::new();

        for permission in manifest.recognised_permissions() {
            let allowed = match &self.consent {
                None => true,
                Some(consent) => {
                    let reason = format!("{} requests {} access", manifest.name, permission.as_str());
                    consent(manifest.id.clone(), permission, reason).await
                }
            };

            if allowed {
                granted.push(permission.as_str().to_string());
            } else {
                tracing::info!(plugin_id = %manifest.id, permission = permission.as_str(), "Permission denied by user");
            }
        }

        granted
    }

    async fn run_initialize(&self, id: &str, plugin: &Arc<dyn Plugin>, manifest: &Manifest) -> Result<(), EngineError> {
        let granted_permissions = self
            .registry
            .instance(id)
            .await
            .map(|i| i.granted_permissions)
            .unwrap_or_default();
        let ctx = PluginContext {
            plugin_id: id.to_string(),
            granted_permissions,
            config: serde_json::to_value(&manifest.config).unwrap_or(serde_json::Value::Null),
        };

        call_hook(id, "initialize", plugin.initialize(&ctx)).await?;
        self.registry.update_state(id, PluginState::Initialized).await?;
        Ok(())
    }

    async fn run_start(&self, id: &str, plugin: &Arc<dyn Plugin>) -> Result<(), EngineError> {
        call_hook(id, "start", plugin.start()).await?;
        self.registry.update_state(id, PluginState::Started).await?;
        self.emit(events::PLUGIN_STARTED, id).await;
        Ok(())
    }

    /// Initialize a `loaded` plugin
    pub async fn initialize(&self, id: &str) -> Result<(), EngineError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let (plugin, manifest) = self.expect_state(id, PluginState::Loaded, "initialize").await?;
        let result = self.run_initialize(id, &plugin, &manifest).await;
        self.fail_on_err(id, result).await
    }

    /// Start an `initialized` plugin
    pub async fn start(&self, id: &str) -> Result<(), EngineError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let (plugin, _) = self.expect_state(id, PluginState::Initialized, "start").await?;
        let result = self.run_start(id, &plugin).await;
        self.fail_on_err(id, result).await
    }

    /// Pause a `started` plugin
    pub async fn pause(&self, id: &str) -> Result<(), EngineError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let (plugin, _) = self.expect_state(id, PluginState::Started, "pause").await?;
        let result = async {
            call_hook(id, "pause", plugin.pause()).await?;
            self.registry.update_state(id, PluginState::Paused).await?;
            Ok(())
        }
        .await;
        self.fail_on_err(id, result).await?;
        self.emit(events::PLUGIN_PAUSED, id).await;
        Ok(())
    }

    /// Resume a `paused` plugin
    pub async fn resume(&self, id: &str) -> Result<(), EngineError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let (plugin, _) = self.expect_state(id, PluginState::Paused, "resume").await?;
        let result = async {
            call_hook(id, "resume", plugin.resume()).await?;
            self.registry.update_state(id, PluginState::Started).await?;
            Ok(())
        }
        .await;
        self.fail_on_err(id, result).await?;
        self.emit(events::PLUGIN_RESUMED, id).await;
        Ok(())
    }

    /// Stop a `started` or `paused` plugin without unloading it
    pub async fn stop(&self, id: &str) -> Result<(), EngineError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let state = self.current_state(id).await?;
        if !matches!(state, PluginState::Started | PluginState::Paused) {
            return Err(EngineError::lifecycle(id, state, "stop"));
        }
        let result = self.run_stop(id).await;
        self.fail_on_err(id, result).await
    }

    /// Stop, dispose and unload a plugin
    ///
    /// Active dependents block the unload unless `force` is set. Under
    /// `force`, hook failures are logged and the plugin ends `unloaded`;
    /// otherwise a failure leaves it in `error`.
    pub async fn unload(&self, id: &str, force: bool) -> Result<(), EngineError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let state = self.current_state(id).await?;
        if state == PluginState::Unloaded {
            return if force {
                Ok(())
            } else {
                Err(EngineError::lifecycle(id, state, "unload"))
            };
        }

        let dependents = self.registry.active_dependents_of(id).await;
        if !dependents.is_empty() {
            if !force {
                return Err(EngineError::DependentsActive {
                    plugin_id: id.to_string(),
                    dependents,
                });
            }
            tracing::warn!(plugin_id = %id, ?dependents, "Force-unloading plugin with active dependents");
        }

        self.teardown(id, state, force).await
    }

    /// Unload for a reload: dependents are not consulted and failures end in `error`
    pub(crate) async fn unload_for_reload(&self, id: &str) -> Result<(), EngineError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let state = self.current_state(id).await?;
        if state == PluginState::Unloaded {
            return Ok(());
        }
        self.teardown(id, state, false).await
    }

    async fn teardown(&self, id: &str, state: PluginState, force: bool) -> Result<(), EngineError> {
        let result = async {
            if matches!(state, PluginState::Started | PluginState::Paused) {
                self.run_stop(id).await?;
            }
            let plugin = self
                .registry
                .plugin(id)
                .await
                .ok_or_else(|| EngineError::NotFound(format!("plugin {}", id)))?;
            call_hook(id, "dispose", plugin.dispose()).await?;
            self.registry.update_state(id, PluginState::Unloaded).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                tracing::info!(plugin_id = %id, "Plugin unloaded");
                self.emit(events::PLUGIN_UNLOADED, id).await;
                Ok(())
            }
            Err(e) if force => {
                tracing::warn!(plugin_id = %id, "Ignoring failure during forced unload: {}", e);
                self.registry.force_state(id, PluginState::Unloaded).await;
                self.emit(events::PLUGIN_UNLOADED, id).await;
                Ok(())
            }
            Err(e) => {
                self.fail(id, &e).await;
                Err(e)
            }
        }
    }

    async fn run_stop(&self, id: &str) -> Result<(), EngineError> {
        let plugin = self
            .registry
            .plugin(id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("plugin {}", id)))?;
        call_hook(id, "stop", plugin.stop()).await?;
        self.registry.update_state(id, PluginState::Stopped).await?;
        self.emit(events::PLUGIN_STOPPED, id).await;
        Ok(())
    }

    /// Move a plugin to `error` after an operation outside the loader failed
    pub(crate) async fn mark_error(&self, id: &str, err: &EngineError) {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.fail(id, err).await;
    }

    async fn current_state(&self, id: &str) -> Result<PluginState, EngineError> {
        self.registry
            .state(id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("plugin {}", id)))
    }

    async fn expect_state(
        &self,
        id: &str,
        expected: PluginState,
        action: &str,
    ) -> Result<(Arc<dyn Plugin>, Manifest), EngineError> {
        let state = self.current_state(id).await?;
        if state != expected {
            return Err(EngineError::lifecycle(id, state, action));
        }
        let plugin = self.registry.plugin(id).await;
        let manifest = self.registry.manifest(id).await;
        plugin
            .zip(manifest)
            .ok_or_else(|| EngineError::NotFound(format!("plugin {}", id)))
    }

    async fn fail_on_err(&self, id: &str, result: Result<(), EngineError>) -> Result<(), EngineError> {
        if let Err(e) = &result {
            self.fail(id, e).await;
        }
        result
    }

    async fn fail(&self, id: &str, err: &EngineError) {
        tracing::error!(plugin_id = %id, "Plugin lifecycle failure: {}", err);
        if self.registry.contains(id).await {
            self.registry.force_state(id, PluginState::Error).await;
        }
        emit(
            self.events.as_ref(),
            events::PLUGIN_ERROR,
            SOURCE,
            json!({ "pluginId": id, "error": err.to_string() }),
        )
        .await;
    }

    async fn emit(&self, event_type: &str, id: &str) {
        emit(self.events.as_ref(), event_type, SOURCE, json!({ "pluginId": id })).await;
    }

    fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(id.to_string())
            .or_default()
            .clone()
    }
}

/// Run a plugin hook, converting errors and panics into `PluginFailure`
async fn call_hook<F>(id: &str, stage: &str, hook: F) -> Result<(), EngineError>
where
    F: Future<Output = Result<(), EngineError>>,
{
    match catch_panic(hook).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(EngineError::plugin_failure(id, stage, e)),
        Err(panic) => Err(EngineError::plugin_failure(id, stage, format!("panicked: {}", panic))),
    }
}
