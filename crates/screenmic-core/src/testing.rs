//! In-memory graph backend for tests.
//!
//! [`FakeGraph`] models nodes, ports and links the way the registry reports
//! them and can inject link failures or a lost connection. Clones share state,
//! so a test can keep one handle while the engine owns another.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{BackendError, BackendResult, GraphBackend, LinkHandle};
use crate::graph::{Link, Node, Port, PortDirection, Snapshot};
use crate::plan::PlannedLink;

/// A failure to inject into [`FakeGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The n-th `create_link` call (1-based) is rejected by the server
    RejectLinkNumber(usize),
    /// The connection drops at the n-th `create_link` call (1-based)
    DisconnectAtLink(usize),
    /// The node disappears just before the n-th `create_link` call (1-based)
    RemoveNodeAtLink { link: usize, node: u32 },
    /// The connection is already gone
    Disconnected,
}

#[derive(Debug, Default)]
struct FakeState {
    version: u64,
    next_id: u32,
    nodes: BTreeMap<u32, Node>,
    ports: BTreeMap<u32, Port>,
    links: BTreeMap<u32, Link>,
    default_sink: Option<String>,
    capture: Option<u32>,
    faults: Vec<Fault>,
    disconnected: bool,
    link_calls: usize,
    calls: usize,
}

impl FakeState {
    fn allocate(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn touch(&mut self) {
        self.version += 1;
    }

    fn check_connected(&self) -> BackendResult<()> {
        if self.disconnected {
            return Err(BackendError::unavailable("connection lost"));
        }
        Ok(())
    }

    fn add_node(&mut self, id: u32, props: &[(&str, &str)], outputs: &[&str], inputs: &[&str]) {
        let props = props.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        let mut node = Node::new(id, props);
        node.max_output_ports = u32::try_from(outputs.len()).unwrap_or(u32::MAX);
        self.nodes.insert(id, node);

        for (direction, channels) in [(PortDirection::Output, outputs), (PortDirection::Input, inputs)] {
            for (index, channel) in channels.iter().enumerate() {
                let port_id = self.allocate();
                self.ports.insert(
                    port_id,
                    Port {
                        id: port_id,
                        node_id: id,
                        direction,
                        channel: Some((*channel).to_string()),
                        index: u32::try_from(index).ok(),
                    },
                );
            }
        }

        self.touch();
    }

    fn remove_node(&mut self, id: u32) {
        self.nodes.remove(&id);
        self.ports.retain(|_, p| p.node_id != id);
        self.links.retain(|_, l| l.output_node != id && l.input_node != id);
        self.touch();
    }

    fn first_port(&self, node_id: u32, direction: PortDirection) -> Option<u32> {
        self.ports.values().find(|p| p.node_id == node_id && p.direction == direction).map(|p| p.id)
    }
}

/// Scripted in-memory graph.
#[derive(Debug, Clone, Default)]
pub struct FakeGraph {
    state: Arc<Mutex<FakeState>>,
}

impl FakeGraph {
    /// Node name of the capture endpoint created by the fake.
    pub const CAPTURE_NAME: &'static str = "screenmic-capture";

    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        let graph = Self::default();
        graph.state.lock().next_id = 100;
        graph
    }

    /// A graph with two stereo browser streams (`Firefox` = 1, `Chrome` = 2)
    /// and a hardware sink `speakers` (10) that is the default output.
    #[must_use]
    pub fn with_browsers() -> Self {
        let graph = Self::new();
        graph.add_stream(1, &[("node.name", "Firefox"), ("application.name", "Firefox")], 2);
        graph.add_stream(2, &[("node.name", "Chrome"), ("application.name", "Chrome")], 2);
        {
            let mut state = graph.state.lock();
            state.add_node(
                10,
                &[("node.name", "speakers"), ("device.id", "3"), ("media.class", "Audio/Sink")],
                &[],
                &["FL", "FR"],
            );
            state.default_sink = Some("speakers".into());
        }
        graph
    }

    /// Add an application stream with `outputs` output ports (1 = mono).
    pub fn add_stream(&self, id: u32, props: &[(&str, &str)], outputs: usize) {
        let channels: &[&str] = match outputs {
            0 => &[],
            1 => &["MONO"],
            _ => &["FL", "FR"],
        };
        self.state.lock().add_node(id, props, channels, &[]);
    }

    /// Link the first output port of `output_node` to the first input port of
    /// `input_node`, as another client would.
    ///
    /// # Panics
    /// Panics if either node lacks a port in the needed direction.
    pub fn add_foreign_link(&self, output_node: u32, input_node: u32) {
        let mut state = self.state.lock();
        let output_port = state.first_port(output_node, PortDirection::Output).expect("output port");
        let input_port = state.first_port(input_node, PortDirection::Input).expect("input port");
        let id = state.allocate();
        state.links.insert(id, Link { id, output_node, output_port, input_node, input_port });
        state.touch();
    }

    /// Remove a node as if its application exited.
    pub fn remove_node(&self, id: u32) {
        self.state.lock().remove_node(id);
    }

    /// Inject a fault.
    pub fn inject(&self, fault: Fault) {
        let mut state = self.state.lock();
        if fault == Fault::Disconnected {
            state.disconnected = true;
        }
        state.faults.push(fault);
    }

    /// The capture endpoint node ID, if it exists.
    #[must_use]
    pub fn capture_node(&self) -> Option<u32> {
        self.state.lock().capture
    }

    /// Every link currently present in the graph.
    #[must_use]
    pub fn active_links(&self) -> Vec<Link> {
        self.state.lock().links.values().cloned().collect()
    }

    /// Number of backend calls made so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.state.lock().calls
    }
}

impl GraphBackend for FakeGraph {
    fn snapshot(&self) -> BackendResult<Snapshot> {
        let mut state = self.state.lock();
        state.calls += 1;
        state.check_connected()?;

        Ok(Snapshot {
            version: state.version,
            nodes: state.nodes.values().cloned().collect(),
            ports: state.ports.values().cloned().collect(),
            links: state.links.values().cloned().collect(),
            default_sink: state.default_sink.clone(),
        })
    }

    fn ensure_capture_node(&mut self) -> BackendResult<u32> {
        let mut state = self.state.lock();
        state.calls += 1;
        state.check_connected()?;

        if let Some(id) = state.capture {
            return Ok(id);
        }

        let id = state.allocate();
        state.add_node(
            id,
            &[("node.name", Self::CAPTURE_NAME), ("media.class", "Audio/Source/Virtual")],
            &["FL", "FR"],
            &["FL", "FR"],
        );
        state.capture = Some(id);
        Ok(id)
    }

    fn release_capture_node(&mut self) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.calls += 1;
        state.check_connected()?;

        if let Some(id) = state.capture.take() {
            state.remove_node(id);
        }
        Ok(())
    }

    fn create_link(&mut self, link: &PlannedLink) -> BackendResult<LinkHandle> {
        let mut state = self.state.lock();
        state.calls += 1;
        state.check_connected()?;

        state.link_calls += 1;
        let n = state.link_calls;

        if state.faults.contains(&Fault::DisconnectAtLink(n)) {
            state.disconnected = true;
            return Err(BackendError::unavailable("connection lost while linking"));
        }
        if state.faults.contains(&Fault::RejectLinkNumber(n)) {
            return Err(BackendError::rejected("link refused"));
        }
        let vanished: Vec<u32> = state
            .faults
            .iter()
            .filter_map(|f| match *f {
                Fault::RemoveNodeAtLink { link, node } if link == n => Some(node),
                _ => None,
            })
            .collect();
        for node in vanished {
            state.remove_node(node);
        }

        if !state.ports.contains_key(&link.output_port) || !state.ports.contains_key(&link.input_port) {
            return Err(BackendError::rejected("no such port"));
        }
        if state.links.values().any(|l| l.output_port == link.output_port && l.input_port == link.input_port) {
            return Err(BackendError::rejected("link exists"));
        }

        let id = state.allocate();
        state.links.insert(
            id,
            Link {
                id,
                output_node: link.output_node,
                output_port: link.output_port,
                input_node: link.input_node,
                input_port: link.input_port,
            },
        );
        state.touch();

        Ok(LinkHandle(u64::from(id)))
    }

    fn destroy_link(&mut self, handle: LinkHandle) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.calls += 1;
        state.check_connected()?;

        let id = u32::try_from(handle.0).map_err(|_| BackendError::rejected("bad handle"))?;
        if state.links.remove(&id).is_none() {
            return Err(BackendError::rejected("no such link"));
        }
        state.touch();
        Ok(())
    }
}
