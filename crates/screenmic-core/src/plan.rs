//! Port-level link planning.
//!
//! The planner pairs each output port of a selected node with the matching
//! input ports of the capture endpoint. Channels are matched by position; a
//! port with an unknown position is matched by its per-node port index, and a
//! mono source fans out to every capture channel.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::filter::RoutingMode;
use crate::graph::{Node, Port, PortDirection, Snapshot};

/// One link the executor should create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedLink {
    /// Source node ID
    pub output_node: u32,
    /// Source port ID
    pub output_port: u32,
    /// Capture endpoint node ID
    pub input_node: u32,
    /// Capture endpoint port ID
    pub input_port: u32,
    /// Channel position of the source port
    pub channel: Option<String>,
}

/// An ordered list of links computed from one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPlan {
    /// Version of the snapshot the plan was computed from
    pub version: u64,
    links: Vec<PlannedLink>,
}

impl LinkPlan {
    /// The planned links, in creation order.
    #[must_use]
    pub fn links(&self) -> &[PlannedLink] {
        &self.links
    }

    /// Number of planned links.
    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether the plan creates nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Builds link plans against a fixed snapshot and capture endpoint.
pub struct LinkPlanner<'a> {
    snapshot: &'a Snapshot,
    capture_node: u32,
}

impl<'a> LinkPlanner<'a> {
    /// Create a planner for `snapshot`, routing into `capture_node`.
    #[must_use]
    pub fn new(snapshot: &'a Snapshot, capture_node: u32) -> Self {
        Self { snapshot, capture_node }
    }

    /// Compute the plan for the selected candidates.
    ///
    /// The mode only affects how the candidates were chosen; the link
    /// topology is the same for both modes. A candidate without linkable
    /// ports contributes nothing.
    #[must_use]
    pub fn plan(&self, candidates: &[Node], mode: RoutingMode) -> LinkPlan {
        let capture_inputs: Vec<&Port> =
            self.snapshot.ports_of(self.capture_node, PortDirection::Input).collect();

        if capture_inputs.is_empty() {
            warn!(capture = self.capture_node, "Capture endpoint has no input ports");
        }

        let mut links = Vec::new();

        for node in candidates {
            if node.id == self.capture_node {
                warn!(id = node.id, "Prevented link to self");
                continue;
            }

            for (output, input) in self.map_ports(node, &capture_inputs) {
                if self.snapshot.has_port_link(output.id, input.id) {
                    debug!(output = output.id, input = input.id, "Link already present");
                    continue;
                }

                links.push(PlannedLink {
                    output_node: node.id,
                    output_port: output.id,
                    input_node: self.capture_node,
                    input_port: input.id,
                    channel: output.channel.clone(),
                });
            }
        }

        debug!(?mode, candidates = candidates.len(), links = links.len(), "Plan computed");

        LinkPlan { version: self.snapshot.version, links }
    }

    fn map_ports<'p>(&self, node: &Node, capture_inputs: &[&'p Port]) -> Vec<(&'p Port, &'p Port)>
    where
        'a: 'p,
    {
        let outputs: Vec<&'p Port> =
            self.snapshot.ports_of(node.id, PortDirection::Output).collect();

        if outputs.is_empty() {
            warn!(id = node.id, "Node has no output ports");
            return Vec::new();
        }

        let is_mono = outputs.len() == 1;
        if is_mono {
            debug!(id = node.id, "Node is mono");
        }

        let mut mapping = Vec::new();

        for output in outputs {
            let before = mapping.len();

            for input in capture_inputs.iter().copied() {
                if is_mono || channels_match(output, input) {
                    mapping.push((output, input));
                }
            }

            debug!(port = output.id, count = mapping.len() - before, "Port maps to capture port(s)");
        }

        mapping
    }
}

fn channels_match(output: &Port, input: &Port) -> bool {
    if output.has_unknown_channel() || input.has_unknown_channel() {
        return output.index.is_some() && output.index == input.index;
    }

    output.channel == input.channel
}
