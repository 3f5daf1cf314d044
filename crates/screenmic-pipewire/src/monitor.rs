//! Graph change notifications.
//!
//! The PipeWire thread must never block, so events are delivered with
//! `try_send` and dropped (with a warning) when the consumer falls behind.

use tokio::sync::mpsc;
use tracing::warn;

/// Events emitted by the PipeWire runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphEvent {
    /// PipeWire connection established and the initial graph is known
    Connected,
    /// PipeWire connection lost; every link this client created is gone
    Disconnected,
    /// A node was added to the graph
    NodeAdded { id: u32, name: String },
    /// A node was removed from the graph
    NodeRemoved { id: u32, name: String },
    /// A link was created
    LinkAdded { id: u32, output_node: u32, input_node: u32 },
    /// A link was removed
    LinkRemoved { id: u32 },
    /// The default output sink changed
    DefaultSinkChanged { name: Option<String> },
}

/// Non-blocking sender half used on the PipeWire thread.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<GraphEvent>,
}

impl EventSink {
    /// Create a sink and its receiving end.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<GraphEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Deliver an event without blocking.
    pub fn emit(&self, event: GraphEvent) {
        match self.tx.try_send(event) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(?event, "Graph event queue full, dropping event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_never_blocks() {
        let (sink, mut rx) = EventSink::channel(1);

        sink.emit(GraphEvent::Connected);
        sink.emit(GraphEvent::Disconnected);

        assert_eq!(rx.try_recv().expect("Failed to receive event"), GraphEvent::Connected);
        assert!(rx.try_recv().is_err());

        drop(rx);
        sink.emit(GraphEvent::Connected);
    }
}
