//! IPC event types (server to client).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event sent from daemon to subscribed clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event type
    pub event: EventType,
    /// Event data
    pub data: Value,
}

impl Event {
    /// Build an event from serializable data.
    #[must_use]
    pub fn new(event: EventType, data: &impl Serialize) -> Self {
        Self { event, data: serde_json::to_value(data).unwrap_or_default() }
    }
}

/// Types of events that can be subscribed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A link session was committed or torn down
    SessionChanged,
    /// The PipeWire connection was lost; the session is gone
    GraphLost,
    /// The default output sink changed
    DefaultSinkChanged,
}

/// Session changed event data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionChangedData {
    pub active: bool,
    pub links: usize,
}

/// Graph lost event data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphLostData {
    pub reason: String,
}

/// Default sink changed event data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultSinkChangedData {
    pub name: Option<String>,
}
