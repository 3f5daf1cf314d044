//! IPC message types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::EventType;

/// Request envelope sent from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Unique request ID for matching responses
    pub id: u64,
    /// The method to invoke
    pub method: Method,
}

/// Response envelope sent from daemon to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Request ID this is responding to
    pub id: u64,
    /// Result of the request
    pub result: Result<Value, ErrorInfo>,
}

impl Response {
    /// A successful response.
    #[must_use]
    pub fn ok(id: u64, value: Value) -> Self {
        Self { id, result: Ok(value) }
    }

    /// A failed response.
    #[must_use]
    pub fn error(id: u64, error: ErrorInfo) -> Self {
        Self { id, result: Err(error) }
    }
}

/// Error information in a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error code
    pub code: i32,
    /// Human-readable error message
    pub message: String,
}

impl ErrorInfo {
    /// Create a new error.
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl From<&screenmic_core::Error> for ErrorInfo {
    fn from(e: &screenmic_core::Error) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

/// Methods that can be invoked via IPC.
///
/// `List` and `Link` carry raw JSON so the daemon can accept every
/// historical request shape and report malformed ones as invalid arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum Method {
    /// Check whether a PipeWire server is reachable
    Probe,
    /// List audio-producing nodes, projected onto the given keys
    List {
        #[serde(default)]
        props: Option<Value>,
    },
    /// Route the selected nodes into the capture node
    Link { filter: Value },
    /// Tear down the active link session
    Unlink,
    /// Describe the active link session
    GetSession,

    // Subscriptions
    /// Subscribe to event types
    Subscribe { events: Vec<EventType> },
    /// Unsubscribe from event types
    Unsubscribe { events: Vec<EventType> },

    // System
    /// Request graceful shutdown
    Shutdown,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_method_wire_format() {
        let request = Request { id: 7, method: Method::Link { filter: json!("Firefox") } };
        let encoded = serde_json::to_value(&request).expect("Failed to encode");

        assert_eq!(encoded, json!({"id": 7, "method": {"type": "Link", "params": {"filter": "Firefox"}}}));
    }

    #[test]
    fn test_list_without_props() {
        let request: Request =
            serde_json::from_value(json!({"id": 1, "method": {"type": "List", "params": {}}}))
                .expect("Failed to decode");

        assert!(matches!(request.method, Method::List { props: None }));
    }

    #[test]
    fn test_error_response_carries_core_code() {
        let error = screenmic_core::Error::InvalidFilter("empty".into());
        let response = Response::error(3, ErrorInfo::from(&error));

        let decoded: Response = serde_json::from_str(&serde_json::to_string(&response).expect("Failed to encode"))
            .expect("Failed to decode");
        assert_eq!(decoded.result.expect_err("Expected an error").code, 422);
    }
}
