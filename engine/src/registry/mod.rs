//! Plugin registry
//!
//! The catalog of registered plugin instances.
//!
//! The registry is the single source of truth for lifecycle state. Reads are
//! public; every mutation is crate-private so that state only changes through
//! the [`PluginLoader`](crate::loader::PluginLoader).

use chrono::Utc;
use indexmap::IndexMap;
use sdk::errors::EngineError;
use sdk::manifest::Manifest;
use sdk::plugin::{Capability, Plugin};
use sdk::types::{PluginInstance, PluginState};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::resolver::Catalog;

struct RegistryEntry {
    instance: PluginInstance,
    manifest: Manifest,
    plugin: Arc<dyn Plugin>,
}

/// In-memory plugin catalog keyed by plugin id
#[derive(Default)]
pub struct PluginRegistry {
    entries: RwLock<IndexMap<String, RegistryEntry>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a registration in state `unloaded`
    ///
    /// Replacing is only allowed while the existing entry is `unloaded` or
    /// `error`; its install time is kept.
    pub(crate) async fn register(
        &self,
        manifest: Manifest,
        plugin: Arc<dyn Plugin>,
        size: u64,
    ) -> Result<(), EngineError> {
        let mut entries = self.entries.write().await;
        let id = manifest.id.clone();

        let mut instance = PluginInstance::new(&id, &manifest.version, size);
        if let Some(existing) = entries.get(&id) {
            if !matches!(existing.instance.state, PluginState::Unloaded | PluginState::Error) {
                return Err(EngineError::AlreadyRegistered(id));
            }
            instance.installed_at = existing.instance.installed_at;
            instance.granted_permissions = existing.instance.granted_permissions.clone();
        }

        tracing::debug!(plugin_id = %id, version = %manifest.version, "Plugin registered");
        entries.insert(
            id,
            RegistryEntry {
                instance,
                manifest,
                plugin,
            },
        );
        Ok(())
    }

    /// Remove a registration entirely
    pub(crate) async fn unregister(&self, id: &str) -> Result<PluginInstance, EngineError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .shift_remove(id)
            .ok_or_else(|| EngineError::NotFound(format!("plugin {}", id)))?;
        tracing::debug!(plugin_id = %id, "Plugin unregistered");
        Ok(entry.instance)
    }

    /// Apply a lifecycle transition, rejecting illegal ones
    ///
    /// Returns the previous state.
    pub(crate) async fn update_state(&self, id: &str, next: PluginState) -> Result<PluginState, EngineError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("plugin {}", id)))?;

        let current = entry.instance.state;
        if !current.can_transition_to(next) {
            return Err(EngineError::lifecycle(id, current, &format!("move to {}", next)));
        }

        entry.instance.state = next;
        tracing::info!(plugin_id = %id, from = %current, to = %next, "Plugin state changed");
        Ok(current)
    }

    /// Set a state without transition checks; used for forced unloads and rollbacks
    pub(crate) async fn force_state(&self, id: &str, state: PluginState) {
        if let Some(entry) = self.entries.write().await.get_mut(id) {
            let previous = entry.instance.state;
            entry.instance.state = state;
            tracing::warn!(plugin_id = %id, from = %previous, to = %state, "Plugin state forced");
        }
    }

    pub(crate) async fn grant_permissions(&self, id: &str, permissions: Vec<String>) {
        if let Some(entry) = self.entries.write().await.get_mut(id) {
            entry.instance.granted_permissions = permissions;
        }
    }

    pub(crate) async fn set_size(&self, id: &str, size: u64) {
        if let Some(entry) = self.entries.write().await.get_mut(id) {
            entry.instance.size = size;
        }
    }

    /// Record a use of the plugin
    pub async fn touch(&self, id: &str) {
        if let Some(entry) = self.entries.write().await.get_mut(id) {
            entry.instance.last_used_at = Utc::now();
        }
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }

    pub async fn state(&self, id: &str) -> Option<PluginState> {
        self.entries.read().await.get(id).map(|e| e.instance.state)
    }

    pub async fn instance(&self, id: &str) -> Option<PluginInstance> {
        self.entries.read().await.get(id).map(|e| e.instance.clone())
    }

    pub async fn manifest(&self, id: &str) -> Option<Manifest> {
        self.entries.read().await.get(id).map(|e| e.manifest.clone())
    }

    pub async fn plugin(&self, id: &str) -> Option<Arc<dyn Plugin>> {
        self.entries.read().await.get(id).map(|e| e.plugin.clone())
    }

    /// All registrations in registration order
    pub async fn list(&self) -> Vec<PluginInstance> {
        self.entries
            .read()
            .await
            .values()
            .map(|e| e.instance.clone())
            .collect()
    }

    pub async fn ids_in_state(&self, state: PluginState) -> Vec<String> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.instance.state == state)
            .map(|e| e.instance.id.clone())
            .collect()
    }

    /// Registered plugins declaring `id` as a dependency, with their states
    pub async fn dependents_of(&self, id: &str) -> Vec<(String, PluginState)> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.instance.id != id && e.manifest.depends_on(id))
            .map(|e| (e.instance.id.clone(), e.instance.state))
            .collect()
    }

    /// Started plugins contributing a capability accepted by `wanted`
    pub async fn providers<F>(&self, wanted: F) -> Vec<String>
    where
        F: Fn(&Capability) -> bool,
    {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.instance.state == PluginState::Started)
            .filter(|e| e.plugin.capabilities().iter().any(&wanted))
            .map(|e| e.instance.id.clone())
            .collect()
    }

    /// Dependents currently in an active state
    pub async fn active_dependents_of(&self, id: &str) -> Vec<String> {
        self.dependents_of(id)
            .await
            .into_iter()
            .filter(|(_, state)| state.is_active())
            .map(|(id, _)| id)
            .collect()
    }

    /// Manifests of every registration, for dependency resolution
    pub async fn installed_manifests(&self) -> Catalog {
        self.entries
            .read()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), e.manifest.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::manifest::Dependency;

    struct Inert(Manifest);

    impl Plugin for Inert {
        fn manifest(&self) -> &Manifest {
            &self.0
        }
    }

    async fn registered(registry: &PluginRegistry, manifest: Manifest) {
        let plugin = Arc::new(Inert(manifest.clone()));
        registry.register(manifest, plugin, 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_register_and_transition() {
        let registry = PluginRegistry::new();
        registered(&registry, Manifest::new("a", "1.0.0")).await;

        assert_eq!(registry.state("a").await, Some(PluginState::Unloaded));
        registry.update_state("a", PluginState::Loaded).await.unwrap();

        let err = registry.update_state("a", PluginState::Started).await.unwrap_err();
        assert!(matches!(err, EngineError::LifecycleState { state: PluginState::Loaded, .. }));
    }

    #[tokio::test]
    async fn test_duplicate_live_registration_rejected() {
        let registry = PluginRegistry::new();
        registered(&registry, Manifest::new("a", "1.0.0")).await;
        registry.update_state("a", PluginState::Loaded).await.unwrap();

        let again = Manifest::new("a", "1.0.1");
        let result = registry.register(again.clone(), Arc::new(Inert(again)), 0).await;
        assert!(matches!(result, Err(EngineError::AlreadyRegistered(_))));
    }

    #[tokio::test]
    async fn test_active_dependents() {
        let registry = PluginRegistry::new();
        registered(&registry, Manifest::new("base", "1.0.0")).await;
        registered(
            &registry,
            Manifest::new("ui", "1.0.0").with_dependency(Dependency::required("base", "*")),
        )
        .await;
        registered(
            &registry,
            Manifest::new("idle", "1.0.0").with_dependency(Dependency::required("base", "*")),
        )
        .await;
        registry.force_state("ui", PluginState::Started).await;

        assert_eq!(registry.dependents_of("base").await.len(), 2);
        assert_eq!(registry.active_dependents_of("base").await, vec!["ui".to_string()]);
    }

    struct Exporter(Manifest);

    impl Plugin for Exporter {
        fn manifest(&self) -> &Manifest {
            &self.0
        }

        fn capabilities(&self) -> Vec<Capability> {
            vec![Capability::Exporter {
                format: "svg".to_string(),
            }]
        }
    }

    #[tokio::test]
    async fn test_providers_only_lists_started() {
        let registry = PluginRegistry::new();
        for id in ["svg_out", "svg_idle"] {
            let manifest = Manifest::new(id, "1.0.0");
            let plugin = Arc::new(Exporter(manifest.clone()));
            registry.register(manifest, plugin, 0).await.unwrap();
        }
        registered(&registry, Manifest::new("plain", "1.0.0")).await;
        registry.force_state("svg_out", PluginState::Started).await;
        registry.force_state("plain", PluginState::Started).await;

        let svg = registry
            .providers(|c| matches!(c, Capability::Exporter { format } if format == "svg"))
            .await;
        assert_eq!(svg, vec!["svg_out".to_string()]);
        assert!(registry.providers(|c| *c == Capability::Theme).await.is_empty());
    }

    #[tokio::test]
    async fn test_unregister() {
        let registry = PluginRegistry::new();
        registered(&registry, Manifest::new("a", "1.0.0")).await;
        registry.unregister("a").await.unwrap();
        assert!(registry.is_empty().await);
        assert!(registry.unregister("a").await.is_err());
    }
}
