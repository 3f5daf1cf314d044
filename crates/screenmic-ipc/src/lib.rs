//! screenmic IPC - Unix socket protocol and client library.
//!
//! This crate defines the newline-delimited JSON protocol between the daemon
//! and its clients, and provides both ends of the socket.

pub mod client;
pub mod error;
pub mod events;
pub mod messages;
pub mod server;

pub use client::IpcClient;
pub use error::{IpcError, IpcResult};
pub use events::{DefaultSinkChangedData, Event, EventType, GraphLostData, SessionChangedData};
pub use messages::{ErrorInfo, Method, Request, Response};
pub use server::{IncomingRequest, IpcServer};

use std::path::PathBuf;

/// Get the default socket path.
///
/// Uses `$XDG_RUNTIME_DIR/screenmic/daemon.sock` or falls back to
/// `/run/user/$UID/screenmic/daemon.sock`.
#[must_use]
#[allow(unsafe_code)] // libc::getuid() is safe to call
pub fn socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("screenmic/daemon.sock")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/run/user/{uid}/screenmic/daemon.sock"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use serde_json::{Value, json};

    use super::*;

    async fn start(dir: &tempfile::TempDir) -> (Arc<IpcServer>, tokio::sync::mpsc::Receiver<IncomingRequest>, PathBuf) {
        let path = dir.path().join("screenmic/daemon.sock");
        let (server, requests) = IpcServer::bind(&path).await.expect("Failed to bind server");
        let server = Arc::new(server);
        let runner = Arc::clone(&server);
        tokio::spawn(async move { runner.run().await });
        (server, requests, path)
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let (_server, mut requests, path) = start(&dir).await;

        tokio::spawn(async move {
            while let Some((_, request, reply)) = requests.recv().await {
                let response = match request.method {
                    Method::Probe => Response::ok(request.id, json!(true)),
                    _ => Response::error(request.id, ErrorInfo::new(422, "Invalid filter: empty")),
                };
                let _ = reply.send(response).await;
            }
        });

        let client = IpcClient::connect(&path).await.expect("Failed to connect");

        let value = client.call(Method::Probe).await.expect("Failed to probe");
        assert_eq!(value, Value::Bool(true));

        let err = client.call(Method::Link { filter: json!({"include": []}) }).await;
        assert_matches!(err, Err(IpcError::Server { code: 422, .. }));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        // Keep the receiver alive but never answer
        let (_server, _requests, path) = start(&dir).await;

        let client = IpcClient::connect(&path)
            .await
            .expect("Failed to connect")
            .with_timeout(Duration::from_millis(50));

        assert_matches!(client.request(Method::GetSession).await, Err(IpcError::Timeout));
    }

    #[tokio::test]
    async fn test_subscribed_events_are_delivered() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let (server, _requests, path) = start(&dir).await;

        let mut client = IpcClient::connect(&path).await.expect("Failed to connect");
        client
            .call(Method::Subscribe { events: vec![EventType::GraphLost] })
            .await
            .expect("Failed to subscribe");

        server.broadcast(Event::new(
            EventType::DefaultSinkChanged,
            &DefaultSinkChangedData { name: Some("speakers".into()) },
        ));
        server.broadcast(Event::new(EventType::GraphLost, &GraphLostData { reason: "server gone".into() }));

        let event = tokio::time::timeout(Duration::from_secs(1), client.events().recv())
            .await
            .expect("Failed to receive event in time")
            .expect("Failed to receive event");

        assert_eq!(event.event, EventType::GraphLost);
        assert_eq!(event.data["reason"], "server gone");
    }

    #[tokio::test]
    async fn test_malformed_line_gets_error_response() {
        use futures::{SinkExt, StreamExt};
        use tokio_util::codec::{Framed, LinesCodec};

        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let (_server, _requests, path) = start(&dir).await;

        let stream = tokio::net::UnixStream::connect(&path).await.expect("Failed to connect");
        let mut framed = Framed::new(stream, LinesCodec::new());
        framed.send("not json").await.expect("Failed to send");

        let line = framed.next().await.expect("Failed to read").expect("Failed to decode line");
        let response: Response = serde_json::from_str(&line).expect("Failed to parse response");
        assert_eq!(response.result.expect_err("Expected an error").code, 400);
    }
}
