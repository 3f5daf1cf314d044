//! IPC server implementation.
//!
//! Messages are newline-delimited JSON. Subscription requests are answered by
//! the connection task itself; every other request is forwarded to the daemon
//! together with a channel for the response.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, error, info, warn};

use crate::error::IpcResult;
use crate::events::{Event, EventType};
use crate::messages::{ErrorInfo, Method, Request, Response};

/// Longest accepted request line.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Error code for a line that is not a valid request.
const MALFORMED_REQUEST: i32 = 400;

/// A request forwarded to the daemon, tagged with its connection.
pub type IncomingRequest = (u64, Request, mpsc::Sender<Response>);

/// IPC server that listens for client connections.
pub struct IpcServer {
    listener: UnixListener,
    next_client_id: AtomicU64,
    event_tx: broadcast::Sender<Event>,
    request_tx: mpsc::Sender<IncomingRequest>,
}

impl IpcServer {
    /// Create a new IPC server bound to the given socket path.
    ///
    /// # Errors
    /// Returns an error if the socket cannot be created.
    pub async fn bind(socket_path: &Path) -> IpcResult<(Self, mpsc::Receiver<IncomingRequest>)> {
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Stale socket from a previous run
        if socket_path.exists() {
            tokio::fs::remove_file(socket_path).await?;
        }

        let listener = UnixListener::bind(socket_path)?;
        info!(?socket_path, "IPC server listening");

        let (event_tx, _) = broadcast::channel(256);
        let (request_tx, request_rx) = mpsc::channel(64);

        Ok((Self { listener, next_client_id: AtomicU64::new(1), event_tx, request_tx }, request_rx))
    }

    /// Run the server, accepting connections.
    pub async fn run(&self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let client_id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
                    info!(client_id, "Client connected");

                    let event_rx = self.event_tx.subscribe();
                    let request_tx = self.request_tx.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_client(client_id, stream, event_rx, request_tx).await {
                            error!(client_id, error = %e, "Client error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                }
            }
        }
    }

    /// Broadcast an event to all subscribed clients.
    pub fn broadcast(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }

    /// Get a clone of the event sender for broadcasting from other tasks.
    #[must_use]
    pub fn event_sender(&self) -> broadcast::Sender<Event> {
        self.event_tx.clone()
    }
}

/// Event types a connection wants. Empty means everything.
#[derive(Debug, Default)]
struct Subscriptions(HashSet<EventType>);

impl Subscriptions {
    fn wants(&self, event: EventType) -> bool {
        self.0.is_empty() || self.0.contains(&event)
    }

    fn add(&mut self, events: &[EventType]) {
        self.0.extend(events.iter().copied());
    }

    fn remove(&mut self, events: &[EventType]) {
        for event in events {
            self.0.remove(event);
        }
    }
}

async fn handle_client(
    client_id: u64,
    stream: UnixStream,
    mut event_rx: broadcast::Receiver<Event>,
    request_tx: mpsc::Sender<IncomingRequest>,
) -> IpcResult<()> {
    let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let (mut sink, mut lines) = framed.split::<String>();

    let (response_tx, mut response_rx) = mpsc::channel::<Response>(16);
    let mut subscriptions = Subscriptions::default();

    loop {
        tokio::select! {
            line = lines.next() => {
                let line = match line {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        warn!(client_id, error = %e, "Dropping client after framing error");
                        break;
                    }
                    None => {
                        debug!(client_id, "Client disconnected");
                        break;
                    }
                };

                if line.trim().is_empty() {
                    continue;
                }

                let request = match serde_json::from_str::<Request>(&line) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(client_id, error = %e, "Invalid request format");
                        let response = Response::error(
                            0,
                            ErrorInfo::new(MALFORMED_REQUEST, format!("Malformed request: {e}")),
                        );
                        sink.send(serde_json::to_string(&response)?).await?;
                        continue;
                    }
                };

                debug!(client_id, request_id = request.id, "Received request");

                match &request.method {
                    Method::Subscribe { events } => {
                        subscriptions.add(events);
                        let response = Response::ok(request.id, Value::Bool(true));
                        sink.send(serde_json::to_string(&response)?).await?;
                    }
                    Method::Unsubscribe { events } => {
                        subscriptions.remove(events);
                        let response = Response::ok(request.id, Value::Bool(true));
                        sink.send(serde_json::to_string(&response)?).await?;
                    }
                    _ => {
                        if request_tx.send((client_id, request, response_tx.clone())).await.is_err() {
                            warn!(client_id, "Daemon stopped accepting requests");
                            break;
                        }
                    }
                }
            }

            Some(response) = response_rx.recv() => {
                sink.send(serde_json::to_string(&response)?).await?;
            }

            event = event_rx.recv() => {
                match event {
                    Ok(event) => {
                        if subscriptions.wants(event.event) {
                            sink.send(serde_json::to_string(&event)?).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(client_id, skipped, "Client fell behind on events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(client_id, "Event channel closed");
                        break;
                    }
                }
            }
        }
    }

    info!(client_id, "Client handler exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_subscriptions_want_everything() {
        let subs = Subscriptions::default();
        assert!(subs.wants(EventType::GraphLost));
        assert!(subs.wants(EventType::SessionChanged));
    }

    #[test]
    fn test_subscriptions_filter() {
        let mut subs = Subscriptions::default();
        subs.add(&[EventType::GraphLost]);
        assert!(subs.wants(EventType::GraphLost));
        assert!(!subs.wants(EventType::DefaultSinkChanged));

        subs.remove(&[EventType::GraphLost]);
        assert!(subs.wants(EventType::DefaultSinkChanged));
    }
}
