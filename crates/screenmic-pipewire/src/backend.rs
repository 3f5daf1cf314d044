//! [`GraphBackend`] implementation over the PipeWire runtime.

use std::sync::Arc;
use std::time::{Duration, Instant};

use screenmic_core::{BackendResult, GraphBackend, LinkHandle, PlannedLink, PortDirection, Snapshot};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::PipeWireOptions;
use crate::error::{PwError, PwResult};
use crate::factory::{FactoryRequest, FactoryResponse};
use crate::graph::GraphManager;
use crate::monitor::GraphEvent;
use crate::runtime::PipeWireRuntime;

/// Delay between registry roundtrips while waiting for capture ports.
const CAPTURE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Live PipeWire graph.
pub struct PipeWireBackend {
    runtime: PipeWireRuntime,
    options: PipeWireOptions,
    capture: Option<u32>,
}

impl PipeWireBackend {
    /// Connect to PipeWire and wait for the initial graph.
    ///
    /// # Errors
    /// Returns an error if the connection fails or the handshake times out.
    pub fn connect(options: PipeWireOptions) -> PwResult<(Self, mpsc::Receiver<GraphEvent>)> {
        let graph = Arc::new(GraphManager::new());
        let (runtime, events) = PipeWireRuntime::spawn(graph, options.ready_timeout, options.request_timeout)?;

        Ok((Self { runtime, options, capture: None }, events))
    }

    fn sync(&self) -> PwResult<Arc<Snapshot>> {
        // Fail fast instead of waiting out the request timeout
        if !self.runtime.graph().is_connected() {
            return Err(PwError::Disconnected);
        }

        match self.runtime.request(FactoryRequest::Sync)? {
            FactoryResponse::Synced(_) => Ok(self.runtime.graph().snapshot()),
            other => Err(unexpected(&other)),
        }
    }

    fn wait_for_capture_ports(&self, id: u32) -> PwResult<()> {
        let expected = self.options.capture.channels();
        let deadline = Instant::now() + self.options.request_timeout;

        loop {
            let snapshot = self.sync()?;
            let visible = snapshot.ports_of(id, PortDirection::Input).count();

            if visible >= expected {
                debug!(id, ports = visible, "Capture node ports visible");
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(PwError::CaptureNodeFailed(format!(
                    "only {visible} of {expected} input ports appeared"
                )));
            }

            std::thread::sleep(CAPTURE_POLL_INTERVAL);
        }
    }
}

fn unexpected(response: &FactoryResponse) -> PwError {
    PwError::MainLoopError(format!("Unexpected response: {response:?}"))
}

impl GraphBackend for PipeWireBackend {
    fn snapshot(&self) -> BackendResult<Snapshot> {
        Ok(self.sync()?.as_ref().clone())
    }

    fn ensure_capture_node(&mut self) -> BackendResult<u32> {
        if let Some(id) = self.capture {
            if self.sync()?.node(id).is_some() {
                return Ok(id);
            }
            warn!(id, "Capture node vanished, recreating");
            self.capture = None;
        }

        let id = match self.runtime.request(FactoryRequest::EnsureCaptureNode(self.options.capture.clone()))? {
            FactoryResponse::CaptureNode(id) => id,
            other => return Err(unexpected(&other).into()),
        };

        if let Err(e) = self.wait_for_capture_ports(id) {
            warn!(id, error = %e, "Capture node unusable, destroying it");
            if let Err(cleanup) = self.runtime.request(FactoryRequest::DestroyCaptureNode) {
                warn!(id, error = %cleanup, "Failed to destroy unusable capture node");
            }
            return Err(e.into());
        }

        info!(id, name = %self.options.capture.name, "Capture node ready");
        self.capture = Some(id);
        Ok(id)
    }

    fn release_capture_node(&mut self) -> BackendResult<()> {
        self.capture = None;

        match self.runtime.request(FactoryRequest::DestroyCaptureNode)? {
            FactoryResponse::CaptureNodeDestroyed => Ok(()),
            other => Err(unexpected(&other).into()),
        }
    }

    fn create_link(&mut self, link: &PlannedLink) -> BackendResult<LinkHandle> {
        match self.runtime.request(FactoryRequest::CreateLink(link.clone()))? {
            FactoryResponse::LinkCreated(handle) => Ok(handle),
            other => Err(unexpected(&other).into()),
        }
    }

    fn destroy_link(&mut self, handle: LinkHandle) -> BackendResult<()> {
        match self.runtime.request(FactoryRequest::DestroyLink(handle))? {
            FactoryResponse::LinkDestroyed => Ok(()),
            other => Err(unexpected(&other).into()),
        }
    }
}
