//! Default device tracking through the `default` metadata object.

use serde::Deserialize;

/// `metadata.name` of the session manager's default-device metadata.
pub const DEFAULT_METADATA_NAME: &str = "default";
/// Metadata key holding the default output sink.
pub const DEFAULT_SINK_KEY: &str = "default.audio.sink";

#[derive(Deserialize)]
struct MetadataName {
    name: String,
}

/// Extract the node name from a `default.audio.sink` value (`{"name": "..."}`).
#[must_use]
pub fn parse_default_sink(value: &str) -> Option<String> {
    serde_json::from_str::<MetadataName>(value).ok().map(|v| v.name).filter(|name| !name.is_empty())
}
