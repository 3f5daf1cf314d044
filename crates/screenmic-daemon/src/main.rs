//! screenmic daemon - routes application audio into a virtual microphone.
//!
//! The daemon owns one patch bay engine over PipeWire and serves it on a Unix
//! socket. The engine is built on first use and rebuilt after the PipeWire
//! connection is lost.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod server;
mod signals;

use config::{Config, DaemonConfig, LogFormat};
use screenmic_core::{Error, PatchBay, SessionInfo};
use screenmic_ipc::{
    DefaultSinkChangedData, ErrorInfo, Event, EventType, GraphLostData, IpcServer, Method, Request,
    Response, SessionChangedData,
};
use screenmic_pipewire::{GraphEvent, PipeWireBackend, has_pipewire};
use server::Effect;

type Engine = PatchBay<PipeWireBackend>;

/// Quiet period after a graph change before the session is re-evaluated.
const REFRESH_DELAY: Duration = Duration::from_millis(100);

/// Error code for a request handler that died.
const INTERNAL_ERROR: i32 = 500;

#[derive(Parser)]
#[command(name = "screenmic-daemon", version)]
#[command(about = "Route application audio into a virtual microphone")]
struct Args {
    /// Configuration file (defaults to the XDG config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// IPC socket path
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => config::load_from(path)?,
        None => config::load_config()?,
    };
    if args.socket.is_some() {
        config.daemon.socket_path = args.socket;
    }

    init_logging(&config.daemon)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting screenmic daemon");

    let socket = config.socket_path();
    let (ipc_server, mut request_rx) =
        IpcServer::bind(&socket).await.context("Failed to start IPC server")?;
    let event_tx = ipc_server.event_sender();

    let ipc_handle = tokio::spawn(async move {
        ipc_server.run().await;
    });

    let mut shutdown_rx = signals::setup_signal_handlers()?;

    let mut daemon = Daemon::new(config, event_tx);
    if let Err(e) = daemon.ensure_engine().await {
        warn!(error = %e, "PipeWire not ready, the engine will be built on first use");
    }

    info!(?socket, "Daemon running");

    loop {
        tokio::select! {
            event = daemon.next_graph_event() => {
                daemon.on_graph_event(event).await;
            }

            // Restarted on every loop turn, so bursts of graph events coalesce
            () = tokio::time::sleep(REFRESH_DELAY), if daemon.refresh_due => {
                daemon.refresh().await;
            }

            Some((client_id, request, response_tx)) = request_rx.recv() => {
                debug!(client_id, request_id = request.id, "Handling IPC request");

                let (response, shutdown) = daemon.handle(request).await;
                let _ = response_tx.send(response).await;

                if shutdown {
                    info!(client_id, "Shutdown requested via IPC");
                    break;
                }
            }

            Some(signal) = shutdown_rx.recv() => {
                info!(?signal, "Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down...");
    daemon.shutdown().await;
    ipc_handle.abort();

    if let Err(e) = tokio::fs::remove_file(&socket).await {
        debug!(error = %e, "Socket already gone");
    }

    info!("screenmic daemon stopped");
    Ok(())
}

fn init_logging(config: &DaemonConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let level = &config.log_level;
            EnvFilter::new("warn")
                .add_directive(format!("screenmic_core={level}").parse()?)
                .add_directive(format!("screenmic_pipewire={level}").parse()?)
                .add_directive(format!("screenmic_ipc={level}").parse()?)
                .add_directive(format!("screenmic_daemon={level}").parse()?)
        }
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }

    Ok(())
}

/// Engine ownership and event fan-out.
struct Daemon {
    config: Config,
    engine: Option<Arc<Engine>>,
    graph_events: Option<mpsc::Receiver<GraphEvent>>,
    event_tx: broadcast::Sender<Event>,
    /// A stream appeared or started playing since the last refresh
    refresh_due: bool,
}

impl Daemon {
    fn new(config: Config, event_tx: broadcast::Sender<Event>) -> Self {
        Self { config, engine: None, graph_events: None, event_tx, refresh_due: false }
    }

    async fn ensure_engine(&mut self) -> screenmic_core::Result<Arc<Engine>> {
        if let Some(engine) = &self.engine {
            return Ok(Arc::clone(engine));
        }

        let options = self.config.pipewire_options();
        let engine_options = self.config.engine_options();

        let (engine, events) = tokio::task::spawn_blocking(move || {
            screenmic_pipewire::connect(options, engine_options)
        })
        .await
        .map_err(|e| Error::Unavailable(format!("engine construction aborted: {e}")))??;

        info!("Patch bay engine ready");
        let engine = Arc::new(engine);
        self.engine = Some(Arc::clone(&engine));
        self.graph_events = Some(events);
        Ok(engine)
    }

    /// Forget the engine after connection loss and tell the clients.
    async fn lose_engine(&mut self, reason: String) {
        self.graph_events = None;
        let Some(engine) = self.engine.take() else {
            return;
        };

        error!(%reason, "Graph lost, engine dropped");
        release(engine).await;
        self.broadcast(EventType::GraphLost, &GraphLostData { reason });
        self.broadcast(EventType::SessionChanged, &SessionChangedData { active: false, links: 0 });
    }

    /// Extend the active session with streams that started matching.
    async fn refresh(&mut self) {
        self.refresh_due = false;
        let Some(engine) = self.engine.clone() else {
            return;
        };
        if !engine.session().active {
            return;
        }

        match tokio::task::spawn_blocking(move || server::refresh_session(&engine)).await {
            Ok(effect) => self.apply(effect).await,
            Err(e) => error!(error = %e, "Session refresh aborted"),
        }
    }

    async fn apply(&mut self, effect: Option<Effect>) {
        match effect {
            Some(Effect::SessionChanged(session)) => {
                self.broadcast(
                    EventType::SessionChanged,
                    &SessionChangedData { active: session.active, links: session.links.len() },
                );
            }
            Some(Effect::GraphLost(reason)) => self.lose_engine(reason).await,
            None => {}
        }
    }

    async fn next_graph_event(&mut self) -> Option<GraphEvent> {
        match self.graph_events.as_mut() {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    async fn on_graph_event(&mut self, event: Option<GraphEvent>) {
        match event {
            Some(GraphEvent::Connected) => info!("PipeWire connected"),
            Some(GraphEvent::Disconnected) | None => {
                self.lose_engine("PipeWire connection lost".to_string()).await;
            }
            Some(GraphEvent::DefaultSinkChanged { name }) => {
                info!(sink = ?name, "Default sink changed");
                self.broadcast(EventType::DefaultSinkChanged, &DefaultSinkChangedData { name });
            }
            Some(GraphEvent::NodeAdded { id, name }) => {
                trace!(id, %name, "Node added");
                self.refresh_due = true;
            }
            Some(GraphEvent::NodeRemoved { id, name }) => debug!(id, %name, "Node removed"),
            Some(GraphEvent::LinkAdded { id, output_node, input_node }) => {
                trace!(id, output_node, input_node, "Link added");
                self.refresh_due = true;
            }
            Some(GraphEvent::LinkRemoved { id }) => trace!(id, "Link removed"),
        }
    }

    /// Answer a request. The flag is set when the daemon should stop.
    async fn handle(&mut self, request: Request) -> (Response, bool) {
        let id = request.id;

        let response = match request.method {
            Method::Shutdown => return (Response::ok(id, Value::Bool(true)), true),

            Method::Probe => {
                let timeout = self.config.pipewire_options().probe_timeout;
                let available = tokio::task::spawn_blocking(move || has_pipewire(timeout))
                    .await
                    .unwrap_or(false);
                Response::ok(id, Value::Bool(available))
            }

            // Answered by the connection task
            Method::Subscribe { .. } | Method::Unsubscribe { .. } => Response::ok(id, Value::Bool(true)),

            // Nothing can be linked without an engine
            Method::GetSession if self.engine.is_none() => Response::ok(id, json!(SessionInfo::default())),
            Method::Unlink if self.engine.is_none() => Response::ok(id, Value::Bool(true)),

            method => self.run_engine_request(id, method).await,
        };

        (response, false)
    }

    async fn run_engine_request(&mut self, id: u64, method: Method) -> Response {
        let engine = match self.ensure_engine().await {
            Ok(engine) => engine,
            Err(e) => {
                warn!(error = %e, "Engine unavailable");
                return Response::error(id, ErrorInfo::from(&e));
            }
        };

        let handled = tokio::task::spawn_blocking(move || server::handle_request(&method, &engine)).await;

        let result = match handled {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Request handler aborted");
                return Response::error(id, ErrorInfo::new(INTERNAL_ERROR, format!("handler aborted: {e}")));
            }
        };

        self.apply(result.effect).await;

        Response { id, result: result.response }
    }

    fn broadcast(&self, event: EventType, data: &impl serde::Serialize) {
        // No receivers just means no clients are connected
        let _ = self.event_tx.send(Event::new(event, data));
    }

    /// Tear the session and capture node down before exiting.
    async fn shutdown(&mut self) {
        self.graph_events = None;
        if let Some(engine) = self.engine.take() {
            release(engine).await;
        }
    }
}

/// Drop an engine on a blocking thread; its teardown waits on PipeWire.
async fn release(engine: Arc<Engine>) {
    if let Err(e) = tokio::task::spawn_blocking(move || drop(engine)).await {
        warn!(error = %e, "Engine teardown aborted");
    }
}
