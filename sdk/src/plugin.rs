//! Plugin trait and context types
//!
//! Every in-process plugin implements [`Plugin`], a single lifecycle
//! interface. What a plugin *does* for the host (a drawing tool, an exporter,
//! a background service) is declared through [`Capability`] tags rather than
//! through a type hierarchy.

use crate::errors::EngineError;
use crate::manifest::Manifest;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Kind of interactive tool a plugin contributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Drawing,
    Selection,
    Transform,
}

/// Capability tag describing what a plugin contributes to the host
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Capability {
    Tool { tool: ToolKind },
    Exporter { format: String },
    Importer { format: String },
    Theme,
    Service,
    Panel,
}

/// A point-to-point or broadcast message delivered to a plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMessage {
    pub id: Uuid,
    pub sender: String,
    /// `None` for broadcasts
    pub target: Option<String>,
    pub action: String,
    pub data: serde_json::Value,
    /// Broadcasts are notifications; their handler result is discarded
    pub expects_response: bool,
    pub timestamp: DateTime<Utc>,
}

impl PluginMessage {
    pub fn request(
        sender: impl Into<String>,
        target: impl Into<String>,
        action: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            target: Some(target.into()),
            action: action.into(),
            data,
            expects_response: true,
            timestamp: Utc::now(),
        }
    }

    pub fn notification(
        sender: impl Into<String>,
        action: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            target: None,
            action: action.into(),
            data,
            expects_response: false,
            timestamp: Utc::now(),
        }
    }
}

/// Context handed to a plugin when it is initialized
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub plugin_id: String,
    /// Permissions the user actually granted
    pub granted_permissions: Vec<String>,
    /// Manifest config block, as JSON
    pub config: serde_json::Value,
}

/// Lifecycle interface implemented by every plugin
///
/// The loader calls these hooks in state-machine order; a plugin never needs
/// to guard against out-of-order calls itself. Every hook has a no-op default
/// except [`Plugin::manifest`].
#[async_trait]
pub trait Plugin: Send + Sync {
    /// The manifest this instance was created from
    fn manifest(&self) -> &Manifest;

    /// Capabilities this plugin contributes
    fn capabilities(&self) -> Vec<Capability> {
        Vec::new()
    }

    async fn initialize(&self, _ctx: &PluginContext) -> Result<(), EngineError> {
        Ok(())
    }

    async fn start(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn pause(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn resume(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Release every resource; called once before the instance is dropped
    async fn dispose(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Serializable runtime state to carry across a hot reload
    async fn export_state(&self) -> Option<serde_json::Value> {
        None
    }

    /// Restore state exported by a previous instance
    async fn import_state(&self, _state: serde_json::Value) -> Result<(), EngineError> {
        Ok(())
    }

    /// Handle a message; `Ok(Some(_))` answers a request
    async fn handle_message(
        &self,
        _message: &PluginMessage,
    ) -> Result<Option<serde_json::Value>, EngineError> {
        Ok(None)
    }
}

/// Creates in-process plugin instances from manifests
///
/// The host supplies the factory; the loader and hot reload manager use it
/// to (re)create instances.
pub trait PluginFactory: Send + Sync {
    fn create(&self, manifest: &Manifest) -> Result<Arc<dyn Plugin>, EngineError>;
}

impl<F> PluginFactory for F
where
    F: Fn(&Manifest) -> Result<Arc<dyn Plugin>, EngineError> + Send + Sync,
{
    fn create(&self, manifest: &Manifest) -> Result<Arc<dyn Plugin>, EngineError> {
        self(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(Manifest);

    impl Plugin for Noop {
        fn manifest(&self) -> &Manifest {
            &self.0
        }
    }

    #[tokio::test]
    async fn test_default_hooks_succeed() {
        let plugin = Noop(Manifest::new("noop", "1.0.0"));
        let ctx = PluginContext {
            plugin_id: "noop".into(),
            granted_permissions: vec![],
            config: serde_json::Value::Null,
        };
        assert!(plugin.initialize(&ctx).await.is_ok());
        assert!(plugin.start().await.is_ok());
        assert!(plugin.export_state().await.is_none());
        assert!(plugin.capabilities().is_empty());
    }

    #[test]
    fn test_closure_factory() {
        let factory = |m: &Manifest| -> Result<Arc<dyn Plugin>, EngineError> {
            Ok(Arc::new(Noop(m.clone())))
        };
        let plugin = factory.create(&Manifest::new("made", "0.1.0")).unwrap();
        assert_eq!(plugin.manifest().id, "made");
    }

    #[test]
    fn test_capability_serialization() {
        let cap = Capability::Tool {
            tool: ToolKind::Selection,
        };
        let json = serde_json::to_string(&cap).unwrap();
        assert_eq!(json, r#"{"kind":"tool","tool":"selection"}"#);
    }
}
