//! screenmic PipeWire - the live graph behind the patch bay.
//!
//! This crate handles all interactions with PipeWire, including:
//! - Probing whether a PipeWire server is reachable
//! - Mirroring the registry into consistent snapshots
//! - Creating and destroying the capture node
//! - Creating and destroying links on behalf of the engine

pub mod backend;
pub mod error;
pub mod factory;
pub mod graph;
pub mod link;
pub mod metadata;
pub mod monitor;
pub mod node;
pub mod probe;
pub mod runtime;

use std::time::Duration;

use screenmic_core::{EngineOptions, Error, PatchBay};
use tokio::sync::mpsc;
use tracing::error;

pub use backend::PipeWireBackend;
pub use error::{PwError, PwResult};
pub use graph::GraphManager;
pub use monitor::GraphEvent;
pub use node::CaptureNodeProps;
pub use probe::has_pipewire;
pub use runtime::PipeWireRuntime;

/// Connection settings for the PipeWire backend.
#[derive(Debug, Clone)]
pub struct PipeWireOptions {
    /// Capture node to create on the first link
    pub capture: CaptureNodeProps,
    /// Bound on the construction handshake
    pub ready_timeout: Duration,
    /// Bound on every request to the PipeWire thread
    pub request_timeout: Duration,
    /// Bound on the availability probe
    pub probe_timeout: Duration,
}

impl Default for PipeWireOptions {
    fn default() -> Self {
        Self {
            capture: CaptureNodeProps::default(),
            ready_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_millis(500),
        }
    }
}

/// Probe for PipeWire and build an engine over it.
///
/// # Errors
/// Returns [`Error::Unavailable`] if no server is reachable or the
/// construction handshake fails.
pub fn connect(
    options: PipeWireOptions,
    engine: EngineOptions,
) -> screenmic_core::Result<(PatchBay<PipeWireBackend>, mpsc::Receiver<GraphEvent>)> {
    if !has_pipewire(options.probe_timeout) {
        return Err(Error::Unavailable("no PipeWire server reachable".to_string()));
    }

    let (backend, events) = PipeWireBackend::connect(options).map_err(|e| {
        error!(error = %e, "Failed to start PipeWire backend");
        Error::Unavailable(e.to_string())
    })?;

    Ok((PatchBay::new(backend, engine), events))
}
