//! Requests sent to the PipeWire thread.
//!
//! Every request carries its own bounded reply channel, so a caller that
//! gave up waiting simply drops the receiver and the PipeWire thread sees the
//! failed send.

use std::sync::mpsc as std_mpsc;

use screenmic_core::{LinkHandle, PlannedLink};
use tracing::debug;

use crate::error::PwError;
use crate::node::CaptureNodeProps;

/// Request to the PipeWire thread
#[derive(Debug)]
pub enum FactoryRequest {
    /// Roundtrip with the server and publish the graph
    Sync,
    /// Create the capture node unless it already exists
    EnsureCaptureNode(CaptureNodeProps),
    /// Destroy the capture node
    DestroyCaptureNode,
    /// Create a link between two ports
    CreateLink(PlannedLink),
    /// Destroy a link created earlier
    DestroyLink(LinkHandle),
    /// Shutdown the PipeWire thread
    Shutdown,
}

impl FactoryRequest {
    /// Short name used in timeout errors.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sync => "graph sync",
            Self::EnsureCaptureNode(_) => "capture node",
            Self::DestroyCaptureNode => "capture node removal",
            Self::CreateLink(_) => "link acknowledgement",
            Self::DestroyLink(_) => "link removal",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Response from the PipeWire thread
#[derive(Debug)]
pub enum FactoryResponse {
    /// Graph published at this version
    Synced(u64),
    /// Capture node is bound with this registry ID
    CaptureNode(u32),
    /// Capture node destroyed (or never existed)
    CaptureNodeDestroyed,
    /// Link was created and acknowledged
    LinkCreated(LinkHandle),
    /// Link was destroyed
    LinkDestroyed,
    /// The request failed
    Failed(PwError),
}

/// Reply half of a request.
#[derive(Debug)]
pub struct Reply(std_mpsc::SyncSender<FactoryResponse>);

impl Reply {
    /// Create a reply channel.
    #[must_use]
    pub fn channel() -> (Self, std_mpsc::Receiver<FactoryResponse>) {
        let (tx, rx) = std_mpsc::sync_channel(1);
        (Self(tx), rx)
    }

    /// Deliver the response. Returns `false` if the caller stopped waiting.
    pub fn send(self, response: FactoryResponse) -> bool {
        match self.0.try_send(response) {
            Ok(()) => true,
            Err(e) => {
                debug!(response = ?e, "Requester went away");
                false
            }
        }
    }
}

/// A request together with where to send the answer.
#[derive(Debug)]
pub struct Envelope {
    /// The request
    pub request: FactoryRequest,
    /// Reply channel; `None` for fire-and-forget requests
    pub reply: Option<Reply>,
}
