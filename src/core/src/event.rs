use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Event key type
pub type EventKey = String;

/// Event payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Empty,
    String(String),
    Map(HashMap<String, serde_json::Value>),
}

/// Bridge event, published to the telemetry layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeEvent {
    /// Event key (e.g., "vm.state.changed", "vm.usb.attached")
    pub key: EventKey,

    /// Event payload
    pub payload: EventPayload,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl BridgeEvent {
    pub fn new(key: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            key: key.into(),
            payload,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn empty(key: impl Into<String>) -> Self {
        Self::new(key, EventPayload::Empty)
    }

    pub fn with_string(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(key, EventPayload::String(message.into()))
    }

    /// Build a map payload from `(field, value)` pairs.
    pub fn with_fields<I, K>(key: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, serde_json::Value)>,
        K: Into<String>,
    {
        let map = fields.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Self::new(key, EventPayload::Map(map))
    }

    /// Look up one field of a map payload.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        match &self.payload {
            EventPayload::Map(map) => map.get(name),
            _ => None,
        }
    }
}

/// Event emitter
///
/// Lossy by nature: a subscriber that falls behind the channel capacity
/// skips events. Nothing that needs every event should be built on it.
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<BridgeEvent>>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn emit(&self, event: BridgeEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to events with a filter
    pub fn subscribe_filtered(
        &self,
        filter: impl Fn(&BridgeEvent) -> bool + Send + Sync + 'static,
    ) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
            filter: Arc::new(filter),
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Event stream with filtering
pub struct EventStream {
    receiver: broadcast::Receiver<BridgeEvent>,
    filter: Arc<dyn Fn(&BridgeEvent) -> bool + Send + Sync>,
}

impl EventStream {
    /// Receive the next matching event
    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if (self.filter)(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Event catalog - predefined event keys
pub mod events {
    // VM events
    pub const VM_STATE_CHANGED: &str = "vm.state.changed";
    pub const VM_NETWORK_DISCONNECTED: &str = "vm.network.disconnected";
    pub const VM_INSTALL_PROGRESS: &str = "vm.install.progress";

    // USB hot-plug
    pub const VM_USB_ATTACHED: &str = "vm.usb.attached";
    pub const VM_USB_DETACHED: &str = "vm.usb.detached";

    // Datapath events
    pub const DATAPATH_STOPPED: &str = "datapath.stopped";
}
