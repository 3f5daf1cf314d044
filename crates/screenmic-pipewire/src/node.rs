//! Registry property conversion and capture node properties.

use std::collections::BTreeMap;

use pipewire::spa::utils::dict::DictRef;
use screenmic_core::{Link, Port, PortDirection};
use serde::{Deserialize, Serialize};

/// Property key tagging the capture node with the owning process.
pub const INSTANCE_KEY: &str = "screenmic.instance";

/// Copy a registry dictionary into an owned map.
#[must_use]
pub fn dict_to_map(dict: &DictRef) -> BTreeMap<String, String> {
    dict.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn parse_id(props: &BTreeMap<String, String>, key: &str) -> Option<u32> {
    props.get(key).and_then(|s| s.parse().ok())
}

/// Build a [`Port`] from the global properties of a port object.
///
/// Returns `None` when the parent node cannot be determined.
#[must_use]
pub fn port_from_props(id: u32, props: &BTreeMap<String, String>) -> Option<Port> {
    let node_id = parse_id(props, "node.id")?;

    let direction = match props.get("port.direction").map(String::as_str) {
        Some("in") => PortDirection::Input,
        _ => PortDirection::Output,
    };

    Some(Port {
        id,
        node_id,
        direction,
        channel: props.get("audio.channel").cloned(),
        index: parse_id(props, "port.id"),
    })
}

/// Build a [`Link`] from the global properties of a link object.
#[must_use]
pub fn link_from_props(id: u32, props: &BTreeMap<String, String>) -> Option<Link> {
    Some(Link {
        id,
        output_node: parse_id(props, "link.output.node")?,
        output_port: parse_id(props, "link.output.port")?,
        input_node: parse_id(props, "link.input.node")?,
        input_port: parse_id(props, "link.input.port")?,
    })
}

/// Properties for creating the capture node.
///
/// The node is a `support.null-audio-sink` adapter advertised as a virtual
/// source, so applications see it as a microphone while the engine links
/// streams into its input ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureNodeProps {
    /// Node name
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// Audio channel positions (e.g., `["FL", "FR"]`)
    pub positions: Vec<String>,
}

impl CaptureNodeProps {
    /// Create properties for a stereo capture node.
    #[must_use]
    pub fn stereo(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            positions: vec!["FL".to_string(), "FR".to_string()],
        }
    }

    /// Number of audio channels.
    #[must_use]
    pub fn channels(&self) -> usize {
        self.positions.len()
    }

    /// Positions in the comma-separated form the adapter expects.
    #[must_use]
    pub fn position_list(&self) -> String {
        self.positions.join(",")
    }

    /// Value of [`INSTANCE_KEY`] for this process.
    #[must_use]
    pub fn instance() -> String {
        std::process::id().to_string()
    }
}

impl Default for CaptureNodeProps {
    fn default() -> Self {
        Self::stereo("screenmic-capture", "screenmic Capture")
    }
}
