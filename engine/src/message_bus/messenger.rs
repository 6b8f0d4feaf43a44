//! Point-to-point plugin messaging
//!
//! A request is delivered only to a `started` plugin. The reply arrives
//! either as the handler's return value or later through
//! [`Messenger::respond`]; both complete the same pending entry, keyed by
//! message id. The entry is removed once the request settles, whatever the
//! outcome.

use super::catch_panic;
use crate::config::MessagingConfig;
use crate::registry::PluginRegistry;
use futures::future::join_all;
use sdk::errors::EngineError;
use sdk::plugin::{Plugin, PluginMessage};
use sdk::types::PluginState;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

type Reply = Result<serde_json::Value, EngineError>;
type PendingMap = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Reply>>>>;

/// Outcome of a broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub struct Messenger {
    registry: Arc<PluginRegistry>,
    pending: PendingMap,
    default_timeout: Duration,
}

impl Messenger {
    pub fn new(registry: Arc<PluginRegistry>, config: &MessagingConfig) -> Self {
        Self {
            registry,
            pending: Arc::new(Mutex::new(HashMap::new())),
            default_timeout: Duration::from_millis(config.default_timeout_ms),
        }
    }

    /// Send a request to `target` and wait for its reply
    ///
    /// # Errors
    ///
    /// - `NotFound` if the target is not registered
    /// - `TargetNotActive` if the target is not `started`
    /// - `PluginFailure` if the target's handler fails or panics
    /// - `MessageTimeout` if no reply arrives within the timeout
    pub async fn send_message(
        &self,
        sender: &str,
        target: &str,
        action: &str,
        data: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, EngineError> {
        let plugin = self.active_plugin(target).await?;
        let timeout = timeout.unwrap_or(self.default_timeout);

        let message = PluginMessage::request(sender, target, action, data);
        let message_id = message.id;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(message_id, tx);

        tracing::debug!(%message_id, sender, target, action, "Delivering request");
        self.registry.touch(target).await;

        let pending = Arc::clone(&self.pending);
        let target_id = target.to_string();
        tokio::spawn(async move {
            let outcome = match catch_panic(plugin.handle_message(&message)).await {
                Ok(Ok(Some(reply))) => Some(Ok(reply)),
                Ok(Ok(None)) => None,
                Ok(Err(e)) => Some(Err(EngineError::plugin_failure(&target_id, "handle_message", e))),
                Err(panic) => Some(Err(EngineError::plugin_failure(
                    &target_id,
                    "handle_message",
                    format!("panicked: {}", panic),
                ))),
            };
            if let Some(reply) = outcome {
                complete(&pending, message_id, reply);
            }
        });

        let result = tokio::time::timeout(timeout, rx).await;
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&message_id);

        match result {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) | Err(_) => {
                tracing::warn!(%message_id, target, action, "Request timed out");
                Err(EngineError::MessageTimeout {
                    message_id: message_id.to_string(),
                    target: target.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Complete a pending request; returns false if it already settled
    pub fn respond(&self, message_id: Uuid, payload: serde_json::Value) -> bool {
        complete(&self.pending, message_id, Ok(payload))
    }

    /// Notify every started plugin except the sender and `exclude`
    ///
    /// Each recipient runs on its own task; a failing or panicking
    /// recipient is reported and does not affect the rest.
    pub async fn broadcast_message(
        &self,
        sender: &str,
        action: &str,
        data: serde_json::Value,
        exclude: &[String],
    ) -> BroadcastReport {
        let recipients: Vec<String> = self
            .registry
            .ids_in_state(PluginState::Started)
            .await
            .into_iter()
            .filter(|id| id != sender && !exclude.contains(id))
            .collect();

        let mut tasks = Vec::with_capacity(recipients.len());
        for id in recipients {
            let Some(plugin) = self.registry.plugin(&id).await else {
                continue;
            };
            let message = PluginMessage::notification(sender, action, data.clone());
            tasks.push(async move {
                let handle = tokio::spawn(async move { deliver(plugin, message).await });
                let outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => Err(e.to_string()),
                };
                (id, outcome)
            });
        }

        let mut report = BroadcastReport::default();
        for (id, outcome) in join_all(tasks).await {
            match outcome {
                Ok(()) => report.delivered.push(id),
                Err(reason) => {
                    tracing::warn!(plugin_id = %id, action, "Broadcast delivery failed: {}", reason);
                    report.failed.push((id, reason));
                }
            }
        }

        tracing::debug!(
            action,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Broadcast finished"
        );
        report
    }

    /// Requests still waiting for a reply
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn active_plugin(&self, target: &str) -> Result<Arc<dyn Plugin>, EngineError> {
        let state = self
            .registry
            .state(target)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("plugin {}", target)))?;
        if state != PluginState::Started {
            return Err(EngineError::TargetNotActive {
                plugin_id: target.to_string(),
                state,
            });
        }
        self.registry
            .plugin(target)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("plugin {}", target)))
    }
}

async fn deliver(plugin: Arc<dyn Plugin>, message: PluginMessage) -> Result<(), String> {
    match catch_panic(plugin.handle_message(&message)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(format!("panicked: {}", panic)),
    }
}

fn complete(pending: &PendingMap, message_id: Uuid, reply: Reply) -> bool {
    let sender = pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&message_id);
    match sender {
        Some(tx) => tx.send(reply).is_ok(),
        None => false,
    }
}
