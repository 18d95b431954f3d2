//! Bridge sink
//!
//! Client activity is mirrored to an external bus as structured events. The
//! core treats the bus as an opaque sink: implementations get a
//! [`BridgeEvent`] per connect, publish, subscribe, unsubscribe and
//! disconnect and do whatever their backend needs.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

/// What the client did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BridgeAction {
    Connect,
    Publish,
    Subscribe,
    Unsubscribe,
    Disconnect,
}

/// A structured event describing one client action.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeEvent {
    pub client_id: String,
    pub username: String,
    pub action: BridgeAction,
    /// Unix seconds
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl BridgeEvent {
    pub fn new(client_id: &str, username: &str, action: BridgeAction) -> Self {
        Self {
            client_id: client_id.to_string(),
            username: username.to_string(),
            action,
            timestamp: unix_now(),
            topic: None,
            payload: None,
        }
    }

    pub fn with_topic(mut self, topic: &str) -> Self {
        self.topic = Some(topic.to_string());
        self
    }

    pub fn with_payload(mut self, payload: &[u8]) -> Self {
        self.payload = Some(String::from_utf8_lossy(payload).into_owned());
        self
    }
}

/// Current time as unix seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// An event consumer. Deliveries must not block the caller; sinks that talk
/// to slow backends should enqueue internally.
pub trait BridgeSink: Send + Sync {
    fn deliver(&self, event: BridgeEvent);
}

/// Sink that drops every event. The default when no bridge is configured.
pub struct NullBridge;

impl BridgeSink for NullBridge {
    fn deliver(&self, _event: BridgeEvent) {}
}

/// Sink that logs events as JSON lines, useful for debugging and as a
/// reference implementation.
pub struct LogBridge;

impl BridgeSink for LogBridge {
    fn deliver(&self, event: BridgeEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!(target: "bridge", "{}", json),
            Err(e) => tracing::warn!("failed to serialize bridge event: {}", e),
        }
    }
}

/// Sink that records events in memory for inspection in tests.
#[derive(Default)]
pub struct ChannelBridge {
    events: Mutex<Vec<BridgeEvent>>,
}

impl ChannelBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<BridgeEvent> {
        std::mem::take(&mut self.events.lock())
    }
}

impl BridgeSink for ChannelBridge {
    fn deliver(&self, event: BridgeEvent) {
        self.events.lock().push(event);
    }
}

/// Resolve a sink by its configured name.
pub fn sink_by_name(name: &str) -> Option<Arc<dyn BridgeSink>> {
    match name {
        "log" | "console" => Some(Arc::new(LogBridge)),
        _ => None,
    }
}
