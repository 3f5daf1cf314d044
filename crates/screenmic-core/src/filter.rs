//! Include/exclude property filters and node selection.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::graph::{Node, Snapshot};

/// An exact `(key, value)` test against a node's property map.
///
/// A predicate never matches a node that lacks the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyPredicate {
    /// Property key
    pub key: String,
    /// Expected property value
    pub value: String,
}

impl PropertyPredicate {
    /// Create a predicate.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into() }
    }

    /// Check the predicate against a node. Case-sensitive, no globbing.
    #[must_use]
    pub fn matches(&self, node: &Node) -> bool {
        node.prop(&self.key) == Some(self.value.as_str())
    }
}

/// A group of predicates that must all match the same node.
///
/// The common case is a group of one. Entries of an include or exclude list
/// are combined with OR; predicates inside one target are combined with AND.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Predicates that must all hold
    pub predicates: Vec<PropertyPredicate>,
}

impl Target {
    /// A target made of a single predicate.
    #[must_use]
    pub fn single(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { predicates: vec![PropertyPredicate::new(key, value)] }
    }

    /// A target made of several predicates.
    #[must_use]
    pub fn all(predicates: Vec<PropertyPredicate>) -> Self {
        Self { predicates }
    }

    /// Check whether every predicate matches the node.
    #[must_use]
    pub fn matches(&self, node: &Node) -> bool {
        self.predicates.iter().all(|p| p.matches(node))
    }
}

fn matches_any(targets: &[Target], node: &Node) -> bool {
    targets.iter().any(|t| t.matches(node))
}

/// How the candidate set was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// Route nodes matching an include predicate
    Include,
    /// Route every node playing into a device that no exclude predicate matches
    Exclude,
}

/// Which nodes to route into the capture endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSet {
    /// Nodes matching any of these are candidates
    #[serde(default)]
    pub include: Vec<Target>,
    /// Nodes matching any of these are never candidates
    #[serde(default)]
    pub exclude: Vec<Target>,
    /// Skip hardware endpoints
    #[serde(default)]
    pub ignore_devices: bool,
    /// Keep only nodes currently playing into the default output sink
    #[serde(default)]
    pub only_default_speakers: bool,
    /// Skip nodes whose media class marks them as capture streams
    #[serde(default)]
    pub ignore_input_media: bool,
}

impl FilterSet {
    /// A filter that includes nodes matching any of the given targets.
    #[must_use]
    pub fn including(include: Vec<Target>) -> Self {
        Self { include, ..Self::default() }
    }

    /// A filter that routes everything except nodes matching the given targets.
    #[must_use]
    pub fn excluding(exclude: Vec<Target>) -> Self {
        Self { exclude, ..Self::default() }
    }

    /// The routing mode implied by the populated lists.
    #[must_use]
    pub fn mode(&self) -> RoutingMode {
        if self.include.is_empty() { RoutingMode::Exclude } else { RoutingMode::Include }
    }

    /// Check the filter's content before it is evaluated.
    ///
    /// # Errors
    /// Returns [`Error::InvalidFilter`] if both lists are empty, a target has
    /// no predicates, or a predicate has an empty key.
    pub fn validate(&self) -> Result<()> {
        if self.include.is_empty() && self.exclude.is_empty() {
            return Err(Error::InvalidFilter("neither include nor exclude is populated".into()));
        }

        for target in self.include.iter().chain(&self.exclude) {
            if target.predicates.is_empty() {
                return Err(Error::InvalidFilter("target without predicates".into()));
            }
            if target.predicates.iter().any(|p| p.key.is_empty()) {
                return Err(Error::InvalidFilter("predicate with empty key".into()));
            }
        }

        Ok(())
    }

    /// Decide whether a single node of `snapshot` is selected.
    fn admits(&self, snapshot: &Snapshot, node: &Node, speaker: Option<u32>) -> bool {
        if !self.include.is_empty() && !matches_any(&self.include, node) {
            trace!(id = node.id, "Not included");
            return false;
        }

        if matches_any(&self.exclude, node) {
            debug!(id = node.id, "Excluded");
            return false;
        }

        if self.ignore_devices && node.is_device() {
            debug!(id = node.id, "Skipping device");
            return false;
        }

        if self.ignore_input_media && node.is_input_media() {
            debug!(id = node.id, class = ?node.prop(crate::graph::MEDIA_CLASS), "Skipping input media");
            return false;
        }

        if self.only_default_speakers {
            let Some(speaker) = speaker else {
                return false;
            };
            if !snapshot.has_link_between(node.id, speaker) {
                trace!(id = node.id, speaker, "Not playing to default speaker");
                return false;
            }
        } else if self.include.is_empty() && !snapshot.plays_into_device(node.id) {
            // Exclude mode only picks up streams that are audible somewhere
            trace!(id = node.id, "Not playing to a device");
            return false;
        }

        true
    }
}

/// Select the nodes of `snapshot` that `filter` routes, preserving snapshot order.
///
/// # Errors
/// Returns [`Error::InvalidFilter`] if the filter fails validation.
pub fn select(snapshot: &Snapshot, filter: &FilterSet) -> Result<Vec<Node>> {
    filter.validate()?;

    let speaker = if filter.only_default_speakers {
        let speaker = snapshot.default_sink_node().map(|n| n.id);
        if speaker.is_none() {
            debug!(sink = ?snapshot.default_sink, "Default speaker unknown, nothing selected");
        }
        speaker
    } else {
        None
    };

    let selected: Vec<Node> = snapshot
        .nodes
        .iter()
        .filter(|node| filter.admits(snapshot, node, speaker))
        .cloned()
        .collect();

    debug!(mode = ?filter.mode(), selected = selected.len(), total = snapshot.nodes.len(), "Filter evaluated");

    Ok(selected)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use assert_matches::assert_matches;
    use proptest::prelude::*;

    use super::*;
    use crate::graph::Link;

    fn node(id: u32, pairs: &[(&str, &str)]) -> Node {
        let props: BTreeMap<_, _> =
            pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        Node::new(id, props)
    }

    fn browsers() -> Snapshot {
        Snapshot {
            nodes: vec![
                node(1, &[("node.name", "Firefox"), ("application.process.binary", "firefox")]),
                node(2, &[("node.name", "Chrome"), ("application.process.binary", "chrome")]),
                node(10, &[("node.name", "speakers"), ("device.id", "1")]),
            ],
            links: vec![
                Link { id: 20, output_node: 1, output_port: 100, input_node: 10, input_port: 200 },
                Link { id: 21, output_node: 2, output_port: 102, input_node: 10, input_port: 201 },
            ],
            ..Snapshot::default()
        }
    }

    fn ids(nodes: &[Node]) -> Vec<u32> {
        nodes.iter().map(|n| n.id).collect()
    }

    #[test]
    fn test_include_selects_exact_match() {
        let filter = FilterSet::including(vec![Target::single("node.name", "Firefox")]);
        let selected = select(&browsers(), &filter).expect("Failed to select");

        assert_eq!(ids(&selected), vec![1]);
    }

    #[test]
    fn test_include_is_case_sensitive() {
        let filter = FilterSet::including(vec![Target::single("node.name", "firefox")]);
        let selected = select(&browsers(), &filter).expect("Failed to select");

        assert!(selected.is_empty());
    }

    #[test]
    fn test_include_predicates_are_ored() {
        let filter = FilterSet::including(vec![
            Target::single("node.name", "Chrome"),
            Target::single("node.name", "Firefox"),
        ]);
        let selected = select(&browsers(), &filter).expect("Failed to select");

        // Snapshot order, not predicate order
        assert_eq!(ids(&selected), vec![1, 2]);
    }

    #[test]
    fn test_target_predicates_are_anded() {
        let filter = FilterSet::including(vec![Target::all(vec![
            PropertyPredicate::new("node.name", "Firefox"),
            PropertyPredicate::new("application.process.binary", "chrome"),
        ])]);
        let selected = select(&browsers(), &filter).expect("Failed to select");

        assert!(selected.is_empty());
    }

    #[test]
    fn test_exclude_only_keeps_the_rest() {
        let filter = FilterSet::excluding(vec![Target::single("node.name", "Chrome")]);
        let selected = select(&browsers(), &filter).expect("Failed to select");

        assert_eq!(filter.mode(), RoutingMode::Exclude);
        assert_eq!(ids(&selected), vec![1]);
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let filter = FilterSet {
            include: vec![Target::single("node.name", "Firefox")],
            exclude: vec![Target::single("application.process.binary", "firefox")],
            ..FilterSet::default()
        };
        let selected = select(&browsers(), &filter).expect("Failed to select");

        assert!(selected.is_empty());
    }

    #[test]
    fn test_predicate_never_matches_missing_key() {
        let filter = FilterSet::excluding(vec![Target::single("application.name", "")]);
        let selected = select(&browsers(), &filter).expect("Failed to select");

        assert_eq!(ids(&selected), vec![1, 2]);
    }

    #[test]
    fn test_ignore_devices_overrides_include() {
        let snapshot = Snapshot {
            nodes: vec![
                node(1, &[("node.name", "Firefox")]),
                node(2, &[("node.name", "Firefox"), ("device.id", "55")]),
            ],
            ..Snapshot::default()
        };
        let filter = FilterSet {
            include: vec![Target::single("node.name", "Firefox")],
            ignore_devices: true,
            ..FilterSet::default()
        };

        let selected = select(&snapshot, &filter).expect("Failed to select");
        assert_eq!(ids(&selected), vec![1]);
    }

    #[test]
    fn test_ignore_input_media() {
        let snapshot = Snapshot {
            nodes: vec![
                node(1, &[("node.name", "a"), ("media.class", "Stream/Output/Audio")]),
                node(2, &[("node.name", "b"), ("media.class", "Stream/Input/Audio")]),
                node(10, &[("node.name", "speakers"), ("device.id", "1")]),
            ],
            links: vec![
                Link { id: 20, output_node: 1, output_port: 100, input_node: 10, input_port: 200 },
                Link { id: 21, output_node: 2, output_port: 101, input_node: 10, input_port: 201 },
            ],
            ..Snapshot::default()
        };
        let filter = FilterSet {
            exclude: vec![Target::single("node.name", "none")],
            ignore_input_media: true,
            ..FilterSet::default()
        };

        let selected = select(&snapshot, &filter).expect("Failed to select");
        assert_eq!(ids(&selected), vec![1]);
    }

    #[test]
    fn test_exclude_mode_needs_device_playback() {
        let snapshot = Snapshot {
            nodes: vec![
                node(1, &[("node.name", "Firefox")]),
                node(2, &[("node.name", "Discord")]),
                node(3, &[("node.name", "idle-player")]),
                node(5, &[("node.name", "usb-mic"), ("device.id", "42"), ("media.class", "Audio/Source")]),
                node(6, &[("node.name", "recorder"), ("media.class", "Stream/Input/Audio")]),
                node(10, &[("node.name", "speakers"), ("device.id", "1"), ("media.class", "Audio/Sink")]),
            ],
            links: vec![
                Link { id: 20, output_node: 1, output_port: 100, input_node: 10, input_port: 200 },
                Link { id: 21, output_node: 2, output_port: 101, input_node: 10, input_port: 201 },
                // The mic feeds a stream, not a device
                Link { id: 22, output_node: 5, output_port: 105, input_node: 6, input_port: 106 },
            ],
            ..Snapshot::default()
        };
        let filter = FilterSet::excluding(vec![Target::single("node.name", "Discord")]);

        let selected = select(&snapshot, &filter).expect("Failed to select");
        assert_eq!(ids(&selected), vec![1]);
    }

    #[test]
    fn test_include_mode_ignores_playback() {
        let mut snapshot = browsers();
        snapshot.links.clear();
        let filter = FilterSet::including(vec![Target::single("node.name", "Chrome")]);

        let selected = select(&snapshot, &filter).expect("Failed to select");
        assert_eq!(ids(&selected), vec![2]);
    }

    #[test]
    fn test_only_default_speakers() {
        let snapshot = Snapshot {
            nodes: vec![
                node(1, &[("node.name", "Firefox")]),
                node(2, &[("node.name", "Chrome")]),
                node(10, &[("node.name", "speakers"), ("device.id", "1")]),
                node(11, &[("node.name", "headset"), ("device.id", "2")]),
            ],
            links: vec![
                Link { id: 20, output_node: 1, output_port: 100, input_node: 10, input_port: 200 },
                Link { id: 21, output_node: 2, output_port: 101, input_node: 11, input_port: 201 },
            ],
            default_sink: Some("speakers".into()),
            ..Snapshot::default()
        };
        let filter = FilterSet {
            exclude: vec![Target::single("node.name", "nothing")],
            ignore_devices: true,
            only_default_speakers: true,
            ..FilterSet::default()
        };

        let selected = select(&snapshot, &filter).expect("Failed to select");
        assert_eq!(ids(&selected), vec![1]);
    }

    #[test]
    fn test_only_default_speakers_without_known_sink() {
        let mut snapshot = browsers();
        snapshot.default_sink = Some("missing".into());
        let filter = FilterSet {
            exclude: vec![Target::single("node.name", "nothing")],
            only_default_speakers: true,
            ..FilterSet::default()
        };

        let selected = select(&snapshot, &filter).expect("Failed to select");
        assert!(selected.is_empty());
    }

    #[test]
    fn test_empty_filter_is_invalid() {
        assert_matches!(select(&browsers(), &FilterSet::default()), Err(Error::InvalidFilter(_)));
    }

    #[test]
    fn test_empty_key_is_invalid() {
        let filter = FilterSet::including(vec![Target::single("", "Firefox")]);
        assert_matches!(select(&browsers(), &filter), Err(Error::InvalidFilter(_)));

        let filter = FilterSet::excluding(vec![Target::all(vec![])]);
        assert_matches!(filter.validate(), Err(Error::InvalidFilter(_)));
    }

    fn arb_node() -> impl Strategy<Value = Node> {
        (0u32..64, "[a-c]{1,2}", proptest::option::of("[a-c]{1,2}")).prop_map(|(id, name, binary)| {
            let mut props = BTreeMap::from([("node.name".to_string(), name)]);
            if let Some(binary) = binary {
                props.insert("application.process.binary".to_string(), binary);
            }
            Node::new(id, props)
        })
    }

    proptest! {
        #[test]
        fn prop_empty_filter_always_rejected(
            ignore_devices: bool,
            only_default_speakers: bool,
            nodes in proptest::collection::vec(arb_node(), 0..8),
        ) {
            let snapshot = Snapshot { nodes, ..Snapshot::default() };
            let filter = FilterSet { ignore_devices, only_default_speakers, ..FilterSet::default() };
            prop_assert!(matches!(select(&snapshot, &filter), Err(Error::InvalidFilter(_))));
        }

        #[test]
        fn prop_selection_is_ordered_subsequence(
            nodes in proptest::collection::vec(arb_node(), 0..12),
            name in "[a-c]{1,2}",
            exclude in proptest::option::of("[a-c]{1,2}"),
        ) {
            let snapshot = Snapshot { nodes, ..Snapshot::default() };
            let filter = FilterSet {
                include: vec![Target::single("node.name", name.clone())],
                exclude: exclude.into_iter().map(|b| Target::single("application.process.binary", b)).collect(),
                ..FilterSet::default()
            };

            let selected = select(&snapshot, &filter).expect("Failed to select");

            let mut remaining = snapshot.nodes.iter();
            for chosen in &selected {
                prop_assert_eq!(chosen.name(), name.as_str());
                prop_assert!(remaining.any(|n| n == chosen));
            }
        }
    }
}
