//! Point-in-time view of the audio graph.
//!
//! A [`Snapshot`] is an immutable copy of every node, port and link known to
//! the registry at the moment it was taken. Filtering and planning operate on a
//! single snapshot so a plan never mixes objects from two graph versions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Property key holding a node's name.
pub const NODE_NAME: &str = "node.name";
/// Property key holding a node's media class (`Stream/Output/Audio`, `Audio/Sink`, ...).
pub const MEDIA_CLASS: &str = "media.class";
/// Property key set on nodes that belong to a hardware device.
pub const DEVICE_ID: &str = "device.id";
/// Channel position reported by ports whose position is unknown.
pub const UNKNOWN_CHANNEL: &str = "UNK";

/// A node discovered in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Registry object ID
    pub id: u32,
    /// Property map as reported by the server
    pub props: BTreeMap<String, String>,
    /// Maximum number of output ports the node can expose
    pub max_output_ports: u32,
}

impl Node {
    /// Create a node from its ID and properties.
    #[must_use]
    pub fn new(id: u32, props: BTreeMap<String, String>) -> Self {
        Self { id, props, max_output_ports: 0 }
    }

    /// Look up a property value.
    #[must_use]
    pub fn prop(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }

    /// The node name, or an empty string when unset.
    #[must_use]
    pub fn name(&self) -> &str {
        self.prop(NODE_NAME).unwrap_or_default()
    }

    /// Whether the node is a hardware endpoint rather than an application stream.
    #[must_use]
    pub fn is_device(&self) -> bool {
        self.prop(DEVICE_ID).is_some_and(|id| !id.is_empty())
    }

    /// Whether the node's media class marks it as an input (capture) node.
    #[must_use]
    pub fn is_input_media(&self) -> bool {
        self.prop(MEDIA_CLASS).is_some_and(|class| class.contains("Input"))
    }
}

/// Port direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortDirection {
    /// Input port (receives audio)
    Input,
    /// Output port (sends audio)
    Output,
}

/// A single channel endpoint of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    /// Registry object ID
    pub id: u32,
    /// Parent node ID
    pub node_id: u32,
    /// Port direction
    pub direction: PortDirection,
    /// Audio channel position (FL, FR, MONO, UNK, ...)
    pub channel: Option<String>,
    /// Per-node port index (`port.id`)
    pub index: Option<u32>,
}

impl Port {
    /// Whether the channel position is unknown.
    #[must_use]
    pub fn has_unknown_channel(&self) -> bool {
        self.channel.as_deref().is_none_or(|c| c == UNKNOWN_CHANNEL)
    }
}

/// A link between an output port and an input port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Registry object ID
    pub id: u32,
    /// Output (source) node ID
    pub output_node: u32,
    /// Output port ID
    pub output_port: u32,
    /// Input (destination) node ID
    pub input_node: u32,
    /// Input port ID
    pub input_port: u32,
}

/// Immutable view of the graph at one registry version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Monotonic version of the table this snapshot was copied from
    pub version: u64,
    /// Nodes ordered by ID
    pub nodes: Vec<Node>,
    /// Ports ordered by ID
    pub ports: Vec<Port>,
    /// Links ordered by ID
    pub links: Vec<Link>,
    /// Name of the current default output sink, if known
    pub default_sink: Option<String>,
}

impl Snapshot {
    /// Get a node by ID.
    #[must_use]
    pub fn node(&self, id: u32) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Get a node by name.
    #[must_use]
    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    /// Ports of a node in the given direction, ordered by ID.
    pub fn ports_of(&self, node_id: u32, direction: PortDirection) -> impl Iterator<Item = &Port> {
        self.ports.iter().filter(move |p| p.node_id == node_id && p.direction == direction)
    }

    /// Whether any link connects `output_node` into `input_node`.
    #[must_use]
    pub fn has_link_between(&self, output_node: u32, input_node: u32) -> bool {
        self.links.iter().any(|l| l.output_node == output_node && l.input_node == input_node)
    }

    /// Whether `output_node` currently plays into a hardware device.
    #[must_use]
    pub fn plays_into_device(&self, output_node: u32) -> bool {
        self.links
            .iter()
            .filter(|l| l.output_node == output_node)
            .any(|l| self.node(l.input_node).is_some_and(Node::is_device))
    }

    /// Whether a link between the two ports already exists.
    #[must_use]
    pub fn has_port_link(&self, output_port: u32, input_port: u32) -> bool {
        self.links.iter().any(|l| l.output_port == output_port && l.input_port == input_port)
    }

    /// The node currently acting as the default output sink.
    #[must_use]
    pub fn default_sink_node(&self) -> Option<&Node> {
        self.default_sink.as_deref().and_then(|name| self.node_by_name(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    #[test]
    fn test_device_detection() {
        let speaker = Node::new(1, props(&[("node.name", "alsa_output"), ("device.id", "42")]));
        let stream = Node::new(2, props(&[("node.name", "Firefox")]));
        let blank = Node::new(3, props(&[("device.id", "")]));

        assert!(speaker.is_device());
        assert!(!stream.is_device());
        assert!(!blank.is_device());
    }

    #[test]
    fn test_input_media_detection() {
        let capture = Node::new(1, props(&[("media.class", "Stream/Input/Audio")]));
        let playback = Node::new(2, props(&[("media.class", "Stream/Output/Audio")]));

        assert!(capture.is_input_media());
        assert!(!playback.is_input_media());
    }

    #[test]
    fn test_default_sink_lookup() {
        let snapshot = Snapshot {
            nodes: vec![
                Node::new(10, props(&[("node.name", "speakers")])),
                Node::new(11, props(&[("node.name", "headset")])),
            ],
            default_sink: Some("headset".into()),
            ..Snapshot::default()
        };

        assert_eq!(snapshot.default_sink_node().map(|n| n.id), Some(11));
    }

    #[test]
    fn test_unknown_channel() {
        let mut port = Port {
            id: 1,
            node_id: 1,
            direction: PortDirection::Output,
            channel: None,
            index: Some(0),
        };
        assert!(port.has_unknown_channel());

        port.channel = Some("UNK".into());
        assert!(port.has_unknown_channel());

        port.channel = Some("FL".into());
        assert!(!port.has_unknown_channel());
    }
}
