//! IPC client implementation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::UnixStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, error, warn};

use crate::error::{IpcError, IpcResult};
use crate::events::Event;
use crate::messages::{Method, Request, Response};

type Writer = SplitSink<Framed<UnixStream, LinesCodec>, String>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

/// Default bound on a single request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// IPC client for connecting to the screenmic daemon.
pub struct IpcClient {
    writer: Arc<Mutex<Writer>>,
    next_id: AtomicU64,
    pending: Pending,
    event_rx: mpsc::Receiver<Event>,
    timeout: Duration,
}

impl IpcClient {
    /// Connect to the daemon at the given socket path.
    ///
    /// # Errors
    /// Returns an error if the connection fails.
    pub async fn connect(socket_path: &Path) -> IpcResult<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        let (writer, mut lines) = Framed::new(stream, LinesCodec::new()).split::<String>();

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::channel(64);

        let reader_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        error!(error = %e, "Read error");
                        break;
                    }
                };

                // Events carry an `event` field, responses an `id`
                if let Ok(response) = serde_json::from_str::<Response>(&line) {
                    if let Some(tx) = reader_pending.lock().await.remove(&response.id) {
                        let _ = tx.send(response);
                    } else {
                        warn!(id = response.id, "Response for unknown request");
                    }
                } else if let Ok(event) = serde_json::from_str::<Event>(&line) {
                    let _ = event_tx.send(event).await;
                } else {
                    warn!("Unknown message format");
                }
            }

            debug!("Connection closed");
            // Wake every waiter with ChannelClosed
            reader_pending.lock().await.clear();
        });

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            next_id: AtomicU64::new(1),
            pending,
            event_rx,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Connect to the daemon at the default socket path.
    ///
    /// # Errors
    /// Returns an error if the connection fails.
    pub async fn connect_default() -> IpcResult<Self> {
        Self::connect(&crate::socket_path()).await
    }

    /// Change the per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send a request and wait for a response.
    ///
    /// # Errors
    /// Returns an error if the request cannot be sent, the connection closes
    /// or no response arrives in time.
    pub async fn request(&self, method: Method) -> IpcResult<Response> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = Request { id, method };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let json = serde_json::to_string(&request)?;
        if let Err(e) = self.writer.lock().await.send(json).await {
            self.pending.lock().await.remove(&id);
            return Err(e.into());
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(IpcError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(IpcError::Timeout)
            }
        }
    }

    /// Send a request and unwrap the daemon's answer.
    ///
    /// # Errors
    /// Returns [`IpcError::Server`] if the daemon reported an error, or any
    /// transport error from [`IpcClient::request`].
    pub async fn call(&self, method: Method) -> IpcResult<Value> {
        self.request(method)
            .await?
            .result
            .map_err(|e| IpcError::Server { code: e.code, message: e.message })
    }

    /// Get the event receiver for incoming events.
    pub fn events(&mut self) -> &mut mpsc::Receiver<Event> {
        &mut self.event_rx
    }
}
