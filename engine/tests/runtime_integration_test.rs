//! Integration tests for assembling the runtime from a config file

use async_trait::async_trait;
use plexus_engine::config::Config;
use plexus_engine::message_bus::{events, EventFilter};
use plexus_engine::package::PluginPackage;
use plexus_engine::runtime::Runtime;
use sdk::errors::EngineError;
use sdk::manifest::Manifest;
use sdk::plugin::{Plugin, PluginFactory, PluginMessage};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

struct Silent(Manifest);

#[async_trait]
impl Plugin for Silent {
    fn manifest(&self) -> &Manifest {
        &self.0
    }

    async fn handle_message(&self, _message: &PluginMessage) -> Result<Option<serde_json::Value>, EngineError> {
        Ok(None)
    }
}

fn config(data_dir: &Path, policy: &str) -> Config {
    let toml = format!(
        r#"
[core]
data_dir = {:?}

[security]
policy = "{}"

[messaging]
default_timeout_ms = 50
subscriber_buffer = 2
"#,
        data_dir, policy
    );
    Config::from_toml_str(&toml).unwrap()
}

fn runtime(config: &Config) -> Runtime {
    let factory: Arc<dyn PluginFactory> = Arc::new(|m: &Manifest| -> Result<Arc<dyn Plugin>, EngineError> {
        Ok(Arc::new(Silent(m.clone())))
    });
    Runtime::from_config(config, factory).unwrap()
}

fn package(id: &str) -> Vec<u8> {
    PluginPackage::new(Manifest::new(id, "1.0.0"))
        .with_file("index.js", "export default {}")
        .to_bytes()
        .unwrap()
}

#[tokio::test]
async fn test_subscriber_buffer_comes_from_config() {
    let temp = TempDir::new().unwrap();
    let runtime = runtime(&config(temp.path(), "relaxed"));

    let _ticks = runtime.events.subscribe(EventFilter::event_type("test.tick")).await;
    assert_eq!(runtime.events.publish("test.tick", "test", json!(1)).await, 1);
    assert_eq!(runtime.events.publish("test.tick", "test", json!(2)).await, 1);
    assert_eq!(runtime.events.publish("test.tick", "test", json!(3)).await, 0);
}

#[tokio::test]
async fn test_install_activate_and_message_through_runtime() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path(), "relaxed");
    let runtime = runtime(&config);
    let mut started = runtime
        .events
        .subscribe(EventFilter::event_type(events::PLUGIN_STARTED))
        .await;

    runtime.host.install_package(&package("quiet"), None).await.unwrap();
    assert!(config.plugins_dir().join("quiet").join("index.js").exists());

    assert_eq!(runtime.host.activate("quiet").await.unwrap(), vec!["quiet"]);
    let event = started.receiver.try_recv().unwrap();
    assert_eq!(event.data["pluginId"], "quiet");

    let err = runtime
        .messenger
        .send_message("host", "quiet", "ping", json!(null), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::MessageTimeout { .. }));
    assert_eq!(runtime.messenger.pending_count(), 0);

    let result = runtime.hot_reload.reload_plugin("quiet", true).await.unwrap();
    assert!(result.success, "{:?}", result.error);
}

#[tokio::test]
async fn test_security_policy_comes_from_config() {
    let temp = TempDir::new().unwrap();
    let runtime = runtime(&config(temp.path(), "enterprise"));

    let err = runtime.host.install_package(&package("unsigned"), None).await.unwrap_err();
    assert!(matches!(err, EngineError::SecurityBlocked { .. }));
    assert!(runtime.host.installed().await.is_empty());
}
