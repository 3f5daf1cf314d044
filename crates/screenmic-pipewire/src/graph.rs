//! PipeWire graph state.
//!
//! The PipeWire thread owns a mutable [`GraphTable`] fed by registry events.
//! Whenever a sync roundtrip completes it publishes an immutable
//! [`Snapshot`] through the [`GraphManager`], which any thread can read
//! without locking.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arc_swap::ArcSwap;
use screenmic_core::{Link, Node, Port, Snapshot};
use tracing::{debug, trace};

/// What a registry removal referred to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removed {
    /// A node, together with its ports
    Node(Node),
    /// A port
    Port(Port),
    /// A link
    Link(Link),
    /// An object the table does not track
    Unknown,
}

/// Mutable graph state owned by the PipeWire thread.
#[derive(Debug, Default)]
pub struct GraphTable {
    nodes: BTreeMap<u32, Node>,
    ports: BTreeMap<u32, Port>,
    links: BTreeMap<u32, Link>,
    default_sink: Option<String>,
}

impl GraphTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node announced by the registry.
    pub fn add_node(&mut self, node: Node) {
        trace!(id = node.id, name = node.name(), "Node added to graph");
        self.nodes.insert(node.id, node);
    }

    /// Replace a node's properties with those from a bound proxy's info event.
    ///
    /// Returns `false` if the node is no longer known.
    pub fn update_node(&mut self, id: u32, props: Option<BTreeMap<String, String>>, max_output_ports: u32) -> bool {
        let Some(node) = self.nodes.get_mut(&id) else {
            return false;
        };

        if let Some(props) = props {
            node.props = props;
        }
        node.max_output_ports = max_output_ports;
        true
    }

    /// Add a port.
    pub fn add_port(&mut self, port: Port) {
        trace!(id = port.id, node_id = port.node_id, channel = ?port.channel, "Port added");
        self.ports.insert(port.id, port);
    }

    /// Add a link.
    pub fn add_link(&mut self, link: Link) {
        trace!(id = link.id, output = link.output_node, input = link.input_node, "Link added");
        self.links.insert(link.id, link);
    }

    /// Forget a registry object of any kind.
    pub fn remove(&mut self, id: u32) -> Removed {
        if let Some(node) = self.nodes.remove(&id) {
            self.ports.retain(|_, p| p.node_id != id);
            debug!(id, name = node.name(), "Node removed from graph");
            return Removed::Node(node);
        }
        if let Some(port) = self.ports.remove(&id) {
            return Removed::Port(port);
        }
        if let Some(link) = self.links.remove(&id) {
            return Removed::Link(link);
        }
        Removed::Unknown
    }

    /// Record the default output sink's node name.
    pub fn set_default_sink(&mut self, name: Option<String>) {
        self.default_sink = name;
    }

    /// The default output sink's node name.
    #[must_use]
    pub fn default_sink(&self) -> Option<&str> {
        self.default_sink.as_deref()
    }

    /// Copy the table into an immutable snapshot.
    #[must_use]
    pub fn to_snapshot(&self, version: u64) -> Snapshot {
        Snapshot {
            version,
            nodes: self.nodes.values().cloned().collect(),
            ports: self.ports.values().cloned().collect(),
            links: self.links.values().cloned().collect(),
            default_sink: self.default_sink.clone(),
        }
    }
}

/// Shared, lock-free view of the last published graph.
pub struct GraphManager {
    current: ArcSwap<Snapshot>,
    version: AtomicU64,
    connected: AtomicBool,
}

impl GraphManager {
    /// Create a manager holding an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(Snapshot::default()),
            version: AtomicU64::new(0),
            connected: AtomicBool::new(false),
        }
    }

    /// The last published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Publish the table as a new snapshot and return its version.
    pub fn publish(&self, table: &GraphTable) -> u64 {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        self.current.store(Arc::new(table.to_snapshot(version)));
        version
    }

    /// Record connection state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Whether the PipeWire thread is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Default for GraphManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use screenmic_core::PortDirection;

    use super::*;

    fn named(id: u32, name: &str) -> Node {
        Node::new(id, BTreeMap::from([("node.name".to_string(), name.to_string())]))
    }

    #[test]
    fn test_remove_node_drops_its_ports() {
        let mut table = GraphTable::new();
        table.add_node(named(1, "app"));
        table.add_port(Port { id: 10, node_id: 1, direction: PortDirection::Output, channel: None, index: Some(0) });
        table.add_port(Port { id: 20, node_id: 2, direction: PortDirection::Output, channel: None, index: Some(0) });

        assert!(matches!(table.remove(1), Removed::Node(n) if n.id == 1));

        let snapshot = table.to_snapshot(1);
        assert_eq!(snapshot.ports.len(), 1);
        assert_eq!(snapshot.ports[0].id, 20);
        assert_eq!(table.remove(99), Removed::Unknown);
    }

    #[test]
    fn test_update_node_refreshes_props() {
        let mut table = GraphTable::new();
        table.add_node(named(1, "app"));

        let props = BTreeMap::from([
            ("node.name".to_string(), "app".to_string()),
            ("application.name".to_string(), "App".to_string()),
        ]);
        assert!(table.update_node(1, Some(props), 2));
        assert!(!table.update_node(5, None, 2));

        let snapshot = table.to_snapshot(1);
        assert_eq!(snapshot.nodes[0].prop("application.name"), Some("App"));
        assert_eq!(snapshot.nodes[0].max_output_ports, 2);
    }

    #[test]
    fn test_publish_bumps_version() {
        let manager = GraphManager::new();
        let mut table = GraphTable::new();
        table.add_node(named(1, "app"));
        table.set_default_sink(Some("speakers".into()));

        assert_eq!(manager.snapshot().version, 0);
        assert_eq!(manager.publish(&table), 1);
        assert_eq!(manager.publish(&table), 2);

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.nodes.len(), 1);
        assert_eq!(snapshot.default_sink.as_deref(), Some("speakers"));
    }

    #[test]
    fn test_connection_flag() {
        let manager = GraphManager::new();
        assert!(!manager.is_connected());

        manager.set_connected(true);
        assert!(manager.is_connected());
    }
}
