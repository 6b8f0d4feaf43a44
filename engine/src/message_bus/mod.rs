//! Event bus for host and plugin communication
//!
//! The EventBus provides fire-and-forget publish/subscribe. Subscribers
//! register a filter (event type, source, custom predicate) and receive
//! matching events on a bounded channel, in subscription order.
//!
//! Publishing never waits on a subscriber: a full queue drops the event for
//! that subscriber only, and a closed queue removes the subscription. A
//! panicking predicate or handler is isolated from every other subscriber.
//!
//! Point-to-point request/response between plugins lives in [`messenger`].

pub mod messenger;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use sdk::errors::EngineError;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Default subscriber queue size
const CHANNEL_BUFFER_SIZE: usize = 100;

/// Lifecycle event types published by the loader and hot reload manager
pub mod events {
    pub const PLUGIN_LOADED: &str = "plugin.loaded";
    pub const PLUGIN_STARTED: &str = "plugin.started";
    pub const PLUGIN_PAUSED: &str = "plugin.paused";
    pub const PLUGIN_RESUMED: &str = "plugin.resumed";
    pub const PLUGIN_STOPPED: &str = "plugin.stopped";
    pub const PLUGIN_UNLOADED: &str = "plugin.unloaded";
    pub const PLUGIN_ERROR: &str = "plugin.error";
    pub const PLUGIN_RELOADED: &str = "plugin.reloaded";
}

/// An event delivered to subscribers
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: String,
    pub source: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

type Predicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Which events a subscription receives
///
/// Event types match exactly, or by prefix when the filter ends in `*`
/// (`plugin.*`).
#[derive(Clone, Default)]
pub struct EventFilter {
    event_type: Option<String>,
    source: Option<String>,
    predicate: Option<Predicate>,
}

impl EventFilter {
    /// Match every event
    pub fn all() -> Self {
        Self::default()
    }

    pub fn event_type(event_type: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            ..Self::default()
        }
    }

    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Whether `event` passes the filter; a panicking predicate counts as no match
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(wanted) = &self.event_type {
            let type_ok = match wanted.strip_suffix('*') {
                Some(prefix) => event.event_type.starts_with(prefix),
                None => *wanted == event.event_type,
            };
            if !type_ok {
                return false;
            }
        }

        if let Some(source) = &self.source {
            if *source != event.source {
                return false;
            }
        }

        match &self.predicate {
            None => true,
            Some(predicate) => std::panic::catch_unwind(AssertUnwindSafe(|| predicate(event)))
                .unwrap_or_else(|_| {
                    tracing::warn!(event_type = %event.event_type, "Subscriber predicate panicked");
                    false
                }),
        }
    }
}

impl std::fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFilter")
            .field("event_type", &self.event_type)
            .field("source", &self.source)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

/// Subscription handle
pub type SubscriptionId = u64;

/// A registered subscription and its queue
pub struct Subscription {
    pub id: SubscriptionId,
    pub receiver: mpsc::Receiver<Event>,
}

struct Subscriber {
    id: SubscriptionId,
    filter: EventFilter,
    tx: mpsc::Sender<Event>,
}

/// Publish/subscribe bus
pub struct EventBus {
    /// Subscribers in registration order
    subscribers: Mutex<Vec<Subscriber>>,
    buffer: usize,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create a new EventBus
    pub fn new() -> Self {
        Self::with_buffer(CHANNEL_BUFFER_SIZE)
    }

    /// Create a bus whose subscriber queues hold `buffer` events
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            buffer: buffer.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe with a filter
    ///
    /// Returns a receiver that will receive matching events. The channel is
    /// bounded; events published while it is full are dropped for this
    /// subscriber.
    pub async fn subscribe(&self, filter: EventFilter) -> Subscription {
        let (tx, receiver) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.subscribers.lock().await.push(Subscriber { id, filter, tx });
        tracing::debug!(subscription = id, "Subscriber registered");

        Subscription { id, receiver }
    }

    /// Subscribe with a handler that runs on its own task
    ///
    /// Events reach the handler in order. A handler error is logged; a
    /// handler panic is contained to that one invocation.
    pub async fn subscribe_fn<F, Fut>(&self, filter: EventFilter, handler: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        let Subscription { id, mut receiver } = self.subscribe(filter).await;

        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let event_type = event.event_type.clone();
                match tokio::spawn(handler(event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(subscription = id, event_type = %event_type, "Event handler failed: {}", e)
                    }
                    Err(e) => {
                        tracing::warn!(subscription = id, event_type = %event_type, "Event handler panicked: {}", e)
                    }
                }
            }
        });

        id
    }

    /// Remove a subscription; returns whether it existed
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock().await;
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        before != subscribers.len()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Publish an event to all matching subscribers
    ///
    /// Returns the number of subscribers the event was queued for.
    pub async fn publish(
        &self,
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: serde_json::Value,
    ) -> usize {
        let event = Event {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            source: source.into(),
            data,
            timestamp: Utc::now(),
        };
        self.publish_event(event).await
    }

    pub async fn publish_event(&self, event: Event) -> usize {
        let mut subscribers = self.subscribers.lock().await;
        let mut delivered = 0;
        let mut closed = Vec::new();

        for subscriber in subscribers.iter() {
            if !subscriber.filter.matches(&event) {
                continue;
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        subscription = subscriber.id,
                        event_type = %event.event_type,
                        "Subscriber queue full, event dropped"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(subscriber.id),
            }
        }

        if !closed.is_empty() {
            subscribers.retain(|s| !closed.contains(&s.id));
            tracing::debug!(count = closed.len(), "Removed closed subscriptions");
        }

        tracing::debug!(event_type = %event.event_type, delivered, "Event published");
        delivered
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Publish on an optional bus; used by services that may run without one
pub(crate) async fn emit(bus: Option<&Arc<EventBus>>, event_type: &str, source: &str, data: serde_json::Value) {
    if let Some(bus) = bus {
        bus.publish(event_type, source, data).await;
    }
}

/// Catch a panic in an async block, turning it into an error message
pub(crate) async fn catch_panic<F, T>(fut: F) -> Result<T, String>
where
    F: Future<Output = T>,
{
    AssertUnwindSafe(fut).catch_unwind().await.map_err(|panic| {
        panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic".to_string())
    })
}
